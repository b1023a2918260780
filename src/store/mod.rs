pub mod codec;
pub mod datfile;
pub mod keys;
pub mod kvfile;

use std::path::{Path, PathBuf};

/// Transient build files are written as `_build_<pid>_<name>` and
/// renamed over their permanent names on close.
pub(crate) fn build_path(homedir: &Path, file_name: &str) -> PathBuf {
    homedir.join(format!("_build_{}_{}", std::process::id(), file_name))
}
