//! Capability-scoped file helpers for UTF-8 paths.

use std::io;

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};

fn split(path: &Utf8Path) -> io::Result<(&Utf8Path, &str)> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{path} does not name a file"),
        )
    })?;
    Ok((parent, file_name))
}

/// Reads a whole file.
///
/// # Errors
///
/// Returns the underlying I/O error.
pub fn read_to_string(path: &Utf8Path) -> io::Result<String> {
    let (parent, file_name) = split(path)?;
    Dir::open_ambient_dir(parent, ambient_authority())?.read_to_string(file_name)
}

/// Writes a file, creating missing parent directories.
///
/// # Errors
///
/// Returns the underlying I/O error.
pub fn write(path: &Utf8Path, contents: &str) -> io::Result<()> {
    let (parent, file_name) = split(path)?;
    Dir::create_ambient_dir_all(parent, ambient_authority())?;
    Dir::open_ambient_dir(parent, ambient_authority())?.write(file_name, contents)
}

/// Returns whether the file exists. A missing parent directory counts as
/// "does not exist".
///
/// # Errors
///
/// Returns the underlying I/O error.
pub fn exists(path: &Utf8Path) -> io::Result<bool> {
    let (parent, file_name) = split(path)?;
    match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir.try_exists(file_name),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

/// Removes a file. Absent files are not an error.
///
/// # Errors
///
/// Returns the underlying I/O error.
pub fn remove(path: &Utf8Path) -> io::Result<()> {
    let (parent, file_name) = split(path)?;
    let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    match dir.remove_file(file_name) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Creates a directory and all of its parents.
///
/// # Errors
///
/// Returns the underlying I/O error.
pub fn create_dir_all(path: &Utf8Path) -> io::Result<()> {
    Dir::create_ambient_dir_all(path, ambient_authority())
}
