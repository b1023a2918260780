use clap::Parser;
use log::info;

use rowvault::app::{App, Commands};
use rowvault::util;

#[derive(Debug, Parser)]
#[command(author, version, about = "The rowvault table administration tool", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    command: Commands,
}

fn main() {
    util::init();

    let args = Args::parse();
    let mut app = App::new();

    if let Err(e) = app.run(args.command) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    info!("time costs {:?}", app.time_costs());
}
