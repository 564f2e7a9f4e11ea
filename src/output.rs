//! Sorted output persistence.

use std::io::{self, prelude::*};
use std::path::Path;

use crate::error::NetSortError;
use crate::record::Record;

/// Writes records back to back to `path`, replacing any existing content.
///
/// Data is written into a temporary file next to the destination which is renamed over the
/// destination once complete, so the destination never holds a partial result.
/// Returns the number of records written.
///
/// # Arguments
/// * `path` - Destination file
/// * `records` - Records in output order
/// * `buf_size` - Write buffer size
pub fn write_records<I>(path: &Path, records: I, buf_size: Option<usize>) -> Result<u64, NetSortError>
where
    I: IntoIterator<Item = Record>,
{
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let tmp_file = tempfile::NamedTempFile::new_in(dir).map_err(NetSortError::Output)?;

    let mut writer = match buf_size {
        Some(buf_size) => io::BufWriter::with_capacity(buf_size, tmp_file),
        None => io::BufWriter::new(tmp_file),
    };

    let mut written = 0u64;
    for record in records {
        writer.write_all(record.as_bytes()).map_err(NetSortError::Output)?;
        written += 1;
    }

    let tmp_file = writer.into_inner().map_err(|err| NetSortError::Output(err.into_error()))?;
    tmp_file.as_file().sync_all().map_err(NetSortError::Output)?;
    set_default_permissions(&tmp_file)?;
    tmp_file.persist(path).map_err(|err| NetSortError::Output(err.error))?;

    log::debug!("{} records saved to {}", written, path.display());

    return Ok(written);
}

#[cfg(unix)]
fn set_default_permissions(file: &tempfile::NamedTempFile) -> Result<(), NetSortError> {
    use std::os::unix::fs::PermissionsExt;

    // temporary files are private, the result is a regular output file
    file.as_file()
        .set_permissions(std::fs::Permissions::from_mode(0o644))
        .map_err(NetSortError::Output)
}

#[cfg(not(unix))]
fn set_default_permissions(_file: &tempfile::NamedTempFile) -> Result<(), NetSortError> {
    Ok(())
}
