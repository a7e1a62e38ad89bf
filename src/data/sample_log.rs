//! CSV sample log.
//!
//! The file is created on the first appended sample (parent directories included),
//! so a run that never produces data leaves the filesystem untouched. Metadata is
//! written as `# key=value ...` comment lines: tags set before the first sample go
//! above the header, later ones are inserted between rows where they happened.
//!
//! Requires the `storage_csv` feature.

use crate::data::pipeline::SampleRecord;
use crate::error::{AppResult, TerpsError};
#[cfg(feature = "storage_csv")]
use std::fs::File;
#[cfg(feature = "storage_csv")]
use std::io::Write;
use std::path::{Path, PathBuf};
#[cfg(feature = "storage_csv")]
use tracing::info;

/// Column names of the sample log.
pub const SAMPLE_LOG_HEADER: [&str; 9] = [
    "ts_ms",
    "frequency_hz",
    "tau_ms",
    "diode_uV",
    "pressure",
    "adc_gain",
    "flags",
    "ppm_corr",
    "mode",
];

/// Lazily opened CSV writer for [`SampleRecord`]s.
pub struct SampleLog {
    path: PathBuf,
    #[cfg(feature = "storage_csv")]
    writer: Option<csv::Writer<File>>,
    pending_metadata: Vec<String>,
    rows: u64,
}

impl SampleLog {
    /// Log that will be written to `path`.
    pub fn new(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        #[cfg(not(feature = "storage_csv"))]
        return Err(TerpsError::FeatureNotEnabled(format!(
            "storage_csv (sample log {})",
            path.display()
        )));

        #[cfg(feature = "storage_csv")]
        Ok(Self {
            path,
            writer: None,
            pending_metadata: Vec::new(),
            rows: 0,
        })
    }

    /// Destination path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows written so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Whether the file has been created.
    pub fn is_open(&self) -> bool {
        #[cfg(feature = "storage_csv")]
        return self.writer.is_some();

        #[cfg(not(feature = "storage_csv"))]
        false
    }

    /// Record `key=value` tags. Empty input is ignored.
    pub fn set_metadata<K: AsRef<str>>(&mut self, metadata: &[(K, String)]) -> AppResult<()> {
        if metadata.is_empty() {
            return Ok(());
        }
        let line = format_metadata(metadata);

        #[cfg(feature = "storage_csv")]
        if let Some(writer) = self.writer.as_mut() {
            writer
                .flush()
                .map_err(|e| TerpsError::Storage(e.to_string()))?;
            let mut file: &File = writer.get_ref();
            writeln!(file, "{}", line).map_err(|e| TerpsError::Storage(e.to_string()))?;
            return Ok(());
        }

        self.pending_metadata.push(line);
        Ok(())
    }

    /// Append one sample, creating the file first if needed.
    pub fn append(&mut self, sample: &SampleRecord) -> AppResult<()> {
        #[cfg(not(feature = "storage_csv"))]
        return {
            let _ = sample;
            Err(TerpsError::FeatureNotEnabled("storage_csv".to_string()))
        };

        #[cfg(feature = "storage_csv")]
        {
            if self.writer.is_none() {
                self.writer = Some(self.open()?);
            }
            let Some(writer) = self.writer.as_mut() else {
                return Err(TerpsError::Storage("sample log is not open".to_string()));
            };
            writer
                .write_record(&[
                    sample.ts_ms.to_string(),
                    sample.frequency_hz.to_string(),
                    sample.tau_ms.to_string(),
                    sample.diode_uv.to_string(),
                    sample.pressure.to_string(),
                    sample.adc_gain.to_string(),
                    sample.flags.to_string(),
                    sample.ppm_corr.to_string(),
                    sample.mode.to_string(),
                ])
                .map_err(|e| TerpsError::Storage(e.to_string()))?;
            writer
                .flush()
                .map_err(|e| TerpsError::Storage(e.to_string()))?;
            self.rows += 1;
            Ok(())
        }
    }

    #[cfg(feature = "storage_csv")]
    fn open(&mut self) -> AppResult<csv::Writer<File>> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| TerpsError::Storage(e.to_string()))?;
            }
        }
        let mut file = File::create(&self.path).map_err(|e| {
            TerpsError::Storage(format!(
                "Failed to create sample log '{}': {}",
                self.path.display(),
                e
            ))
        })?;
        for line in self.pending_metadata.drain(..) {
            writeln!(file, "{}", line).map_err(|e| TerpsError::Storage(e.to_string()))?;
        }

        let mut writer = csv::Writer::from_writer(file);
        writer
            .write_record(SAMPLE_LOG_HEADER)
            .map_err(|e| TerpsError::Storage(e.to_string()))?;
        info!(path = %self.path.display(), "sample log opened");
        Ok(writer)
    }

    /// Flush and close the file. Later appends reopen (and truncate) it.
    pub fn close(&mut self) -> AppResult<()> {
        #[cfg(feature = "storage_csv")]
        if let Some(mut writer) = self.writer.take() {
            writer
                .flush()
                .map_err(|e| TerpsError::Storage(e.to_string()))?;
            info!(path = %self.path.display(), rows = self.rows, "sample log closed");
        }
        Ok(())
    }
}

fn format_metadata<K: AsRef<str>>(metadata: &[(K, String)]) -> String {
    let tags: Vec<String> = metadata
        .iter()
        .map(|(key, value)| format!("{}={}", key.as_ref(), value))
        .collect();
    format!("# {}", tags.join(" "))
}
