use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use clap::ValueEnum;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cli::Arguments;
use crate::utils::channel::ChannelError;

// External software
pub const BOWTIE2_TAG: &str = "bowtie2";
pub const SAMTOOLS_TAG: &str = "samtools";
pub const BEDTOOLS_TAG: &str = "bedtools";
pub const BG2BW_TAG: &str = "bedGraphToBigWig";
pub const SORT_TAG: &str = "sort";
pub const AWK_TAG: &str = "awk";
pub const SBATCH_TAG: &str = "sbatch";
pub const SQUEUE_TAG: &str = "squeue";
pub const SACCT_TAG: &str = "sacct";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamtoolsSubcommand {
    View,
    Sort,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BedtoolsSubcommand {
    Genomecov,
    Coverage,
}

// Static Filenames
pub const TMP_NAME: &str = ".tmp";
pub const FILTERED_NAME: &str = "FILTERED";
pub const UNALIGNED_NAME: &str = "UNALIGNED";
pub const NO_BC_NAME: &str = "no-barcode";
pub const STATE_FILE: &str = ".pipeline_state";
pub const SAMPLE_DB_COPY: &str = "sample_db.csv";
pub const FULL_LOG: &str = "full.log";
pub const ARGS_FILE: &str = "args.bin";
pub const STATS_FILE: &str = "statistics.tsv";
pub const COUNTS_FILE: &str = "feature_counts.tsv";

// Static Parameters
pub const N_READS_STAT: &str = "n_reads";
pub const PASS_FILTER_STAT: &str = "pass-filter";
pub const SPIKEIN_SUFFIX: &str = "-spikein";
pub const REPORT_CHANNEL: &str = "report";
pub const LOG_CHANNEL: &str = "log";
pub const STAT_CHANNEL: &str = "statc";

lazy_static! {
    /// Column order of the statistics table when none is given on the command line.
    pub static ref DEFAULT_STAT_ORDER: Vec<&'static str> = vec![
        N_READS_STAT,
        "total",
        "unique-align",
        "multiple-align",
        "unaligned",
        PASS_FILTER_STAT,
    ];
}

/// Pipeline stages in execution order. `Begin` means nothing has been done yet.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, ValueEnum, Serialize, Deserialize,
)]
#[value(rename_all = "UPPER")]
pub enum Stage {
    #[default]
    Begin,
    Fastq,
    Align,
    Count,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Begin, Stage::Fastq, Stage::Align, Stage::Count];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Begin => "BEGIN",
            Stage::Fastq => "FASTQ",
            Stage::Align => "ALIGN",
            Stage::Count => "COUNT",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .iter()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(s.trim()))
            .copied()
            .ok_or_else(|| PipelineError::InvalidConfig(format!("unknown pipeline stage '{}'", s.trim())))
    }
}

/// Where stage commands are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
pub enum ExecOn {
    #[default]
    Local,
    Slurm,
}

/// The two genomic strands a coverage track is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strand {
    Watson,
    Crick,
}

impl Strand {
    pub const BOTH: [Strand; 2] = [Strand::Watson, Strand::Crick];

    /// Short tag used in file names and work kwargs.
    pub fn tag(&self) -> &'static str {
        match self {
            Strand::Watson => "w",
            Strand::Crick => "c",
        }
    }

    /// Strand argument understood by `bedtools genomecov -strand`.
    pub fn bedtools_flag(&self) -> &'static str {
        match self {
            Strand::Watson => "+",
            Strand::Crick => "-",
        }
    }

    /// Crick coverage is drawn below the axis unless told otherwise.
    pub fn negate_by_default(&self) -> bool {
        matches!(self, Strand::Crick)
    }

    pub fn from_tag(tag: &str) -> Option<Strand> {
        match tag {
            "w" => Some(Strand::Watson),
            "c" => Some(Strand::Crick),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid sample db '{path}': {reason}")]
    InvalidSampleDb { path: String, reason: String },

    #[error("Read '{read}' carries a {found}bp barcode, expected {expected}bp")]
    BarcodeLength { read: String, expected: usize, found: usize },

    #[error("Could not resolve {tool}: {error}")]
    MissingTool { tool: String, error: String },

    #[error("{tool} failed: {error}")]
    ToolExecution { tool: String, error: String },

    #[error("No channel named '{0}' is registered")]
    UnknownChannel(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("I/O error: {0}")]
    IOError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::IOError(e.to_string())
    }
}

pub struct RunConfig {
    pub cwd: PathBuf,
    pub log_file: Option<PathBuf>,
    pub args: Arguments,
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_and_parse() {
        assert!(Stage::Begin < Stage::Fastq);
        assert!(Stage::Fastq < Stage::Align);
        assert!(Stage::Align < Stage::Count);
        assert_eq!("align".parse::<Stage>().unwrap(), Stage::Align);
        assert_eq!(" COUNT\n".parse::<Stage>().unwrap(), Stage::Count);
        assert!("ERROR".parse::<Stage>().is_err());
    }

    #[test]
    fn test_strand_conventions() {
        assert_eq!(Strand::Watson.bedtools_flag(), "+");
        assert!(!Strand::Watson.negate_by_default());
        assert!(Strand::Crick.negate_by_default());
        assert_eq!(Strand::from_tag("c"), Some(Strand::Crick));
        assert_eq!(Strand::from_tag("x"), None);
    }

    #[test]
    fn test_error_messages() {
        let e = PipelineError::BarcodeLength { read: "r1".into(), expected: 4, found: 3 };
        assert!(e.to_string().contains("3bp barcode, expected 4bp"));
    }
}
