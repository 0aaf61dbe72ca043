use std::fs::File;
use std::io;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::config::defs::{FASTA_EXTS, GZIP_EXT};

pub fn is_gzipped(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut buffer = [0u8; 2];
    match file.read_exact(&mut buffer) {
        Ok(()) => Ok(buffer == [0x1F, 0x8B]), // Gzip magic bytes
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}


/// Makes a relative path absolute against `cwd`; absolute paths pass through.
///
/// # Arguments
///
/// * `path` - Path as given on the command line or in a table.
/// * `cwd` - Base directory for relative paths.
///
/// # Returns
/// PathBuf
pub fn resolve_path(path: &Path, cwd: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}


/// Strips an optional `.gz` and a FASTA extension from a file name,
/// e.g. `NC_000913.3.fasta.gz` -> `NC_000913.3`.
///
/// # Returns
/// None when the file is not a FASTA file.
pub fn fasta_stem(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let name = name
        .strip_suffix(&format!(".{}", GZIP_EXT))
        .unwrap_or(name);
    let (stem, ext) = name.rsplit_once('.')?;
    if FASTA_EXTS.contains(&ext) && !stem.is_empty() {
        Some(stem.to_string())
    } else {
        None
    }
}


/// Writes `contents` to `path` through a temp file in the same directory, so
/// readers never observe a partial file.
///
/// # Arguments
///
/// * `path` - Final destination.
/// * `contents` - Bytes to write.
///
/// # Returns
/// io::Result<()>
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}


/// Removes a file, treating an already-missing file as success.
pub fn remove_if_exists(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
