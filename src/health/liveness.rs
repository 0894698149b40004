//! Supervisor heartbeat file.
//!
//! Present (holding the last healthy tick time) while the link is healthy,
//! absent otherwise. Container health checks only test for existence.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;

#[derive(Debug, Clone)]
pub struct LivenessFile {
    path: PathBuf,
}

impl LivenessFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the current UTC time.
    pub fn touch(&self) -> io::Result<()> {
        fs::write(&self.path, Utc::now().to_rfc3339())
    }

    /// Remove the file; a missing file is not an error.
    pub fn clear(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}
