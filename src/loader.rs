//! Loading raw program images
//!
//! A program file is a raw little-endian byte image of at most 64 KiB,
//! loaded at guest address 0. Bytes beyond the file length stay
//! zero-initialised in memory.

use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::hart::memory::MEM_SIZE;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("error opening program file {path}: {source}")]
    Io { path: String, source: io::Error },
    #[error("program file {path} is {size} bytes, larger than guest memory ({MEM_SIZE} bytes)")]
    TooLarge { path: String, size: usize },
}

/// Read a program image from disk, checking it fits guest memory
pub fn read_image(path: &Path) -> Result<Vec<u8>, LoadError> {
    let image = fs::read(path).map_err(|source| LoadError::Io {
        path: path.display().to_string(),
        source,
    })?;
    if image.len() > MEM_SIZE {
        return Err(LoadError::TooLarge {
            path: path.display().to_string(),
            size: image.len(),
        });
    }
    Ok(image)
}
