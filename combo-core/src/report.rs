//! Line-oriented sweep output

use serde::{Deserialize, Serialize};
use std::io::{self, Write};

use crate::metrics::SweepRecord;

/// Header of the comma-delimited results table
pub const TABLE_HEADER: [&str; 7] = ["PP", "TG", "B", "N_KV", "S_PP(t/s)", "S_TG(t/s)", "S(t/s)"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Header line plus one aligned, comma-delimited line per record
    #[default]
    Table,
    /// One JSON object per record
    Json,
}

/// Writes sweep records to any output stream
pub struct Reporter<W: Write> {
    out: W,
    format: OutputFormat,
}

impl<W: Write> Reporter<W> {
    pub fn new(out: W, format: OutputFormat) -> Self {
        Self { out, format }
    }

    pub fn write_header(&mut self) -> io::Result<()> {
        match self.format {
            OutputFormat::Table => {
                let h = TABLE_HEADER;
                writeln!(
                    self.out,
                    "{:>6} , {:>6} , {:>4} , {:>6} , {:>8} , {:>8} , {:>8}",
                    h[0], h[1], h[2], h[3], h[4], h[5], h[6]
                )?;
                self.out.flush()
            }
            OutputFormat::Json => Ok(()),
        }
    }

    pub fn write_record(&mut self, record: &SweepRecord) -> io::Result<()> {
        match self.format {
            OutputFormat::Table => writeln!(self.out, "{}", format_table_line(record))?,
            OutputFormat::Json => {
                serde_json::to_writer(&mut self.out, record)?;
                writeln!(self.out)?;
            }
        }
        // Keep results visible while a long sweep is still running
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Render one record as a table line
pub fn format_table_line(record: &SweepRecord) -> String {
    match record {
        SweepRecord::Trial(t) => format!(
            "{:>6} , {:>6} , {:>4} , {:>6} , {:>8.3} , {:>8.3} , {:>8.3}",
            t.grid_point.prompt_len,
            t.grid_point.gen_len,
            t.grid_point.parallelism,
            t.required_slots,
            t.prefill_tokens_per_sec,
            t.decode_tokens_per_sec,
            t.combined_tokens_per_sec
        ),
        SweepRecord::Skipped(s) => format!(
            "{:>6} , {:>6} , {:>4} , {:>6} , {} , , ",
            s.grid_point.prompt_len,
            s.grid_point.gen_len,
            s.grid_point.parallelism,
            s.required_slots,
            s.reason
        ),
    }
}
