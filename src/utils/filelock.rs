use crate::utils::errors::CarbonError;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Opens `path` in create-or-append mode (readable from the start) and takes
/// an exclusive advisory lock. The lock is released when the guard drops.
pub fn open_locked(path: &Path) -> Result<Flock<File>, CarbonError> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .read(true)
        .open(path)
        .map_err(|e| CarbonError::io(path, e))?;

    Flock::lock(file, FlockArg::LockExclusive)
        .map_err(|(_, errno)| CarbonError::io(path, errno.into()))
}

/// Appends one newline-terminated row while holding the exclusive lock.
pub fn append_line(path: &Path, line: &str) -> Result<(), CarbonError> {
    let mut locked = open_locked(path)?;
    locked
        .write_all(format!("{line}\n").as_bytes())
        .map_err(|e| CarbonError::io(path, e))?;
    locked.flush().map_err(|e| CarbonError::io(path, e))
}

/// Wraps a CSV field in double quotes, doubling any embedded quote.
pub fn quoted(field: &str) -> String {
    format!("\"{}\"", field.replace('"', "\"\""))
}
