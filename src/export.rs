//! Persisted session export.
//!
//! A session writes two append-only CSV files next to each other:
//!
//! - `ecg_<stamp>.csv` with header `time,ecg_samples`: the frame timestamp in
//!   nanoseconds and the frame's samples separated by spaces.
//! - `rr_<stamp>.csv` with header `time,rr_value`: the heart-rate frame's
//!   timestamp and its RR intervals in seconds separated by spaces.
//!
//! Every processed frame is one row.
//!
//! The same files are read back by the replay sensor and the offline command.

use crate::sensor::types::{Channel, Frame};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

pub const ECG_HEADER: &str = "time,ecg_samples";
pub const RR_HEADER: &str = "time,rr_value";

/// Export errors.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}:{line}: {message}")]
    Malformed {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl ExportError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        ExportError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn malformed(path: &Path, line: usize, message: impl Into<String>) -> Self {
        ExportError::Malformed {
            path: path.to_path_buf(),
            line,
            message: message.into(),
        }
    }
}

/// One append-only CSV file.
struct CsvSink {
    path: PathBuf,
    writer: BufWriter<File>,
    rows: u64,
}

impl CsvSink {
    /// Open for appending; the header is written only if the file is new or
    /// empty.
    fn open(path: PathBuf, header: &str) -> Result<Self, ExportError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| ExportError::io(&path, e))?;
        let is_empty = file
            .metadata()
            .map_err(|e| ExportError::io(&path, e))?
            .len()
            == 0;

        let mut writer = BufWriter::new(file);
        if is_empty {
            writeln!(writer, "{header}").map_err(|e| ExportError::io(&path, e))?;
        }
        Ok(Self {
            path,
            writer,
            rows: 0,
        })
    }

    fn write_row(&mut self, time: u64, value: &str) -> Result<(), ExportError> {
        writeln!(self.writer, "{time},{value}").map_err(|e| ExportError::io(&self.path, e))?;
        self.rows += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ExportError> {
        self.writer
            .flush()
            .map_err(|e| ExportError::io(&self.path, e))
    }
}

/// Records every frame of a session to the two CSV files.
pub struct SessionRecorder {
    ecg: CsvSink,
    rr: CsvSink,
}

impl SessionRecorder {
    /// Create (or append to) the export files for a session stamp inside
    /// `dir`.
    pub fn create(dir: &Path, stamp: &str) -> Result<Self, ExportError> {
        std::fs::create_dir_all(dir).map_err(|e| ExportError::io(dir, e))?;
        let (ecg_path, rr_path) = export_paths(dir, stamp);
        Ok(Self {
            ecg: CsvSink::open(ecg_path, ECG_HEADER)?,
            rr: CsvSink::open(rr_path, RR_HEADER)?,
        })
    }

    /// Append one frame.
    pub fn record(&mut self, frame: &Frame) -> Result<(), ExportError> {
        match frame.channel {
            Channel::Ecg => {
                let samples: Vec<String> = frame.payload.iter().map(|s| s.to_string()).collect();
                self.ecg.write_row(frame.timestamp, &samples.join(" "))
            }
            Channel::HeartRate => {
                let rr: Vec<String> = frame.rr_secs().iter().map(|s| s.to_string()).collect();
                self.rr.write_row(frame.timestamp, &rr.join(" "))
            }
        }
    }

    pub fn flush(&mut self) -> Result<(), ExportError> {
        self.ecg.flush()?;
        self.rr.flush()
    }

    pub fn ecg_path(&self) -> &Path {
        &self.ecg.path
    }

    pub fn rr_path(&self) -> &Path {
        &self.rr.path
    }

    /// Rows written so far as `(ecg, rr)`.
    pub fn rows(&self) -> (u64, u64) {
        (self.ecg.rows, self.rr.rows)
    }
}

impl Drop for SessionRecorder {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::warn!("failed to flush session export: {e}");
        }
    }
}

/// File names used for a session stamp.
pub fn export_paths(dir: &Path, stamp: &str) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("ecg_{stamp}.csv")),
        dir.join(format!("rr_{stamp}.csv")),
    )
}

/// Read data rows (after the header) as `(line_number, time, value)`.
fn read_rows(path: &Path, header: &str) -> Result<Vec<(usize, u64, String)>, ExportError> {
    let file = File::open(path).map_err(|e| ExportError::io(path, e))?;
    let mut rows = Vec::new();

    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| ExportError::io(path, e))?;
        let number = idx + 1;
        let line = line.trim();
        if idx == 0 {
            if line != header {
                return Err(ExportError::malformed(
                    path,
                    number,
                    format!("expected header '{header}'"),
                ));
            }
            continue;
        }
        if line.is_empty() {
            continue;
        }

        let (time, value) = line
            .split_once(',')
            .ok_or_else(|| ExportError::malformed(path, number, "missing ','"))?;
        let time = time
            .trim()
            .parse::<u64>()
            .map_err(|e| ExportError::malformed(path, number, format!("bad time: {e}")))?;
        rows.push((number, time, value.trim().to_string()));
    }

    Ok(rows)
}

/// Load ECG frames from an export file.
pub fn read_ecg_frames(path: &Path) -> Result<Vec<Frame>, ExportError> {
    read_rows(path, ECG_HEADER)?
        .into_iter()
        .map(|(number, time, value)| {
            let samples = value
                .split_whitespace()
                .map(|s| s.parse::<f64>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ExportError::malformed(path, number, format!("bad sample: {e}")))?;
            Ok(Frame::ecg(time, samples))
        })
        .collect()
}

/// Load heart-rate frames from an RR export file.
///
/// The rate is derived from the row's mean interval; a row without
/// intervals gives a frame with an unknown (zero) rate.
pub fn read_rr_frames(path: &Path) -> Result<Vec<Frame>, ExportError> {
    read_rows(path, RR_HEADER)?
        .into_iter()
        .map(|(number, time, value)| {
            let values = value
                .split_whitespace()
                .map(|s| s.parse::<f64>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ExportError::malformed(path, number, format!("bad rr: {e}")))?;
            if values.iter().any(|rr| *rr <= 0.0) {
                return Err(ExportError::malformed(path, number, "rr must be positive"));
            }
            if values.is_empty() {
                return Ok(Frame::heart_rate(time, 0.0, &[]));
            }
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            let rr_ms: Vec<f64> = values.iter().map(|rr| rr * 1000.0).collect();
            Ok(Frame::heart_rate(time, 60.0 / mean, &rr_ms))
        })
        .collect()
}

/// Save a session's window reports as pretty JSON.
pub fn save_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), ExportError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ExportError::io(parent, e))?;
    }
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).map_err(|e| ExportError::io(path, e))
}
