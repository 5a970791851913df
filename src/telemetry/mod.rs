//! # Telemetry Module
//!
//! Handles session export to JSONL files.
//!
//! This module handles:
//! - Naming export files by UTC time, never overwriting an earlier export
//! - Writing one sample per line as JSON (JSON Lines)
//! - Reading an exported session back for analysis

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::Result;
use crate::sampler::Sample;

/// Export file extension
const SESSION_EXTENSION: &str = "jsonl";

/// Suffixed names tried after the plain one is taken
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Writes recorded sessions into a directory
#[derive(Debug, Clone)]
pub struct SessionWriter {
    dir: PathBuf,
}

impl SessionWriter {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File name for a session exported at `at`, to the millisecond
    pub fn file_name(at: DateTime<Utc>) -> String {
        Self::numbered_file_name(at, 0)
    }

    fn numbered_file_name(at: DateTime<Utc>, attempt: u32) -> String {
        let stamp = at.format("%Y%m%dT%H%M%S%.3fZ");
        match attempt {
            0 => format!("session_{}.{}", stamp, SESSION_EXTENSION),
            n => format!("session_{}_{}.{}", stamp, n, SESSION_EXTENSION),
        }
    }

    /// Create a file that did not exist before, suffixing the name on collision
    fn create_unique(&self, at: DateTime<Utc>) -> Result<(PathBuf, File)> {
        let mut attempt = 0;
        loop {
            let path = self.dir.join(Self::numbered_file_name(at, attempt));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists && attempt < MAX_NAME_ATTEMPTS => {
                    debug!("{} exists, trying next name", path.display());
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Write `samples` to a new file named after the current UTC time
    ///
    /// Creates the export directory if needed. An existing file is never
    /// overwritten; a numeric suffix is added instead.
    ///
    /// # Returns
    ///
    /// * `Result<PathBuf>` - Path of the written file
    ///
    /// # Errors
    ///
    /// Returns error if the directory or file cannot be created or written
    pub fn write(&self, samples: &[Sample]) -> Result<PathBuf> {
        self.write_at(samples, Utc::now())
    }

    /// Write `samples` to a new file named after `at`
    pub fn write_at(&self, samples: &[Sample], at: DateTime<Utc>) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let (path, file) = self.create_unique(at)?;

        let mut writer = BufWriter::new(file);
        for sample in samples {
            serde_json::to_writer(&mut writer, sample)?;
            writeln!(writer)?;
        }
        writer.flush()?;

        info!("Exported {} samples to {}", samples.len(), path.display());
        Ok(path)
    }
}

/// Read an exported session
///
/// Blank lines are ignored.
///
/// # Errors
///
/// Returns error if the file cannot be read or a line is not a valid sample
pub fn read_session<P: AsRef<Path>>(path: P) -> Result<Vec<Sample>> {
    let reader = BufReader::new(File::open(path.as_ref())?);
    let mut samples = Vec::new();

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        samples.push(serde_json::from_str(&line)?);
    }

    debug!("Read {} samples from {}", samples.len(), path.as_ref().display());
    Ok(samples)
}
