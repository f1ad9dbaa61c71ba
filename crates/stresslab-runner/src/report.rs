//! CSV reports. Rows are flushed as soon as they are written so a long batch
//! leaves a usable partial file behind.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

pub const TIMING_HEADER: [&str; 2] = ["permutation", "seconds"];
pub const EVALUATION_HEADER: [&str; 4] = ["permutation", "before", "after", "difference"];
pub const COMPARISON_HEADER: [&str; 4] = ["Filename", "GCC Time", "Clang Time", "Difference Time"];

pub struct CsvReport<W: Write> {
    out: W,
    columns: usize,
}

impl CsvReport<BufWriter<File>> {
    pub fn create(path: &Path, header: &[&str]) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
        CsvReport::new(BufWriter::new(file), header)
    }
}

impl<W: Write> CsvReport<W> {
    pub fn new(out: W, header: &[&str]) -> Result<Self> {
        let mut report = Self {
            out,
            columns: header.len(),
        };
        report.write_fields(header.iter().map(|h| h.to_string()))?;
        Ok(report)
    }

    pub fn write_row(&mut self, fields: &[Option<String>]) -> Result<()> {
        debug_assert_eq!(fields.len(), self.columns);
        self.write_fields(fields.iter().map(|f| f.clone().unwrap_or_default()))
    }

    fn write_fields(&mut self, fields: impl Iterator<Item = String>) -> Result<()> {
        let line = fields
            .map(|f| escape_field(&f))
            .collect::<Vec<_>>()
            .join(",");
        self.out.write_all(line.as_bytes())?;
        self.out.write_all(b"\r\n")?;
        self.out.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Renders an optional measurement; absent values become empty cells.
pub fn seconds_cell(seconds: Option<f64>) -> Option<String> {
    seconds.map(|s| s.to_string())
}

fn escape_field(field: &str) -> String {
    if field.contains([',', '"', '\r', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
