use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::config::defs::{ExecOn, PipelineError, Stage, BG2BW_TAG, BEDTOOLS_TAG, BOWTIE2_TAG, SAMTOOLS_TAG};

/// `--debug <numlines>,<numsamples>`: process only a slice of the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugLimits {
    pub n_lines: usize,
    pub n_samples: usize,
}

fn parse_debug_limits(s: &str) -> Result<DebugLimits, String> {
    let (lines, samples) = s
        .split_once(',')
        .ok_or_else(|| format!("expected <numlines>,<numsamples>, got '{}'", s))?;
    let n_lines = lines.trim().parse::<usize>().map_err(|e| format!("numlines: {}", e))?;
    let n_samples = samples.trim().parse::<usize>().map_err(|e| format!("numsamples: {}", e))?;
    Ok(DebugLimits { n_lines, n_samples })
}

#[derive(Parser, Debug, Clone, Default, Serialize, Deserialize)]
#[command(name = "transeq-pipelines", version, about = "Barcode splitting, alignment, tracks and counts for pooled TranSEQ runs")]
pub struct Arguments {

    #[arg(short = 'f', long = "fastq-prefix", help = "Folder (ending with '/') or path/prefix of the R1/R2 fastq.gz pairs. Ignored with --start-from.")]
    pub fastq_prefix: Option<String>,

    #[arg(long = "start-from", value_enum, ignore_case = true, default_value_t = Stage::Begin,
          help = "Continue a previous run (given by --output-dir) after this completed stage")]
    pub start_from: Stage,

    #[arg(short = 'w', long = "n-workers", default_value_t = 50, help = "Maximal number of concurrently running jobs")]
    pub n_workers: usize,

    #[arg(long, default_value_t = 0.1, help = "Delay (seconds) between iterations of all polling loops")]
    pub delay: f64,

    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,

    #[arg(short = 'o', long = "output-dir", help = "Output directory. If not given, <data-path>/<user>/<experiment>/<date>/<N> is created.")]
    pub output_dir: Option<String>,

    #[arg(long, default_value = ".")]
    pub data_path: String,

    #[arg(long, default_value = "FASTQ")]
    pub fastq_dirname: String,

    #[arg(long, default_value = "BAM")]
    pub bam_dirname: String,

    #[arg(long, default_value = "BIGWIG")]
    pub bigwig_dirname: String,

    #[arg(short = 'd', long, value_parser = parse_debug_limits,
          help = "<numlines>,<numsamples>: only this many lines per input pair and samples from the sample db")]
    pub debug: Option<DebugLimits>,

    #[arg(short = 's', long = "sample-db", help = "Sample db file. Defaults to sample_db.csv next to the fastq prefix.")]
    pub sample_db: Option<String>,

    #[arg(long, default_value_t = 8)]
    pub umi_length: usize,

    #[arg(long, default_value_t = 1, help = "Barcodes up to this hamming distance from a sample barcode are assigned to it")]
    pub hamming_distance: usize,

    #[arg(long, default_value_t = false, help = "Keep reads that matched no barcode (R1/R2 interleaved)")]
    pub keep_nobarcode: bool,

    #[arg(long, help = "Path prefix of the genome bowtie2 index")]
    pub bowtie_index: Option<String>,

    #[arg(long, help = "If given, reads are also aligned to this genome and only counts are reported")]
    pub spikein_index: Option<String>,

    #[arg(long, help = "Aligner threads per bowtie2 instance. Defaults to the physical core count, capped at 4.")]
    pub n_threads: Option<usize>,

    #[arg(long, default_value_t = false)]
    pub keep_unaligned: bool,

    #[arg(short = 'F', long, default_value = "dup(),qual()")]
    pub filter: String,

    #[arg(long, default_value_t = false)]
    pub keep_filtered: bool,

    #[arg(long, default_value_t = false, help = "Print available filters and exit")]
    pub filter_specs: bool,

    #[arg(long, value_enum, default_value_t = ExecOn::Local)]
    pub exec_on: ExecOn,

    #[arg(long, help = "Extra arguments passed verbatim to sbatch")]
    pub slurm_args: Option<String>,

    #[arg(long, default_value = BOWTIE2_TAG)]
    pub bowtie_exec: String,

    #[arg(long, default_value = SAMTOOLS_TAG)]
    pub samtools_exec: String,

    #[arg(long, default_value = BEDTOOLS_TAG)]
    pub bedtools_exec: String,

    #[arg(long, default_value = BG2BW_TAG)]
    pub bg2bw_exec: String,

    #[arg(long, help = "Chromosome sizes file used for tracks")]
    pub chrom_sizes: Option<String>,

    #[arg(long, help = "Tab delimited annotation used for counting, feature id in column 4")]
    pub tts_file: Option<String>,

    #[arg(short = 'E', long, default_value = "tab();long()")]
    pub exporters: String,

    #[arg(long)]
    pub export_path: Option<String>,

    #[arg(long, default_value_t = false, help = "Print available exporters and exit")]
    pub exporter_specs: bool,

    #[clap(
        long,
        value_delimiter = ',',
        help = "Comma-separated column order of the statistics table"
    )]
    pub stat_order: Option<Vec<String>>,
}

impl Arguments {
    pub fn polling_delay(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.delay.max(0.001))
    }

    /// Splits `--fastq-prefix` into its folder and file-name prefix.
    pub fn fastq_path_and_prefix(&self) -> Option<(PathBuf, String)> {
        let prefix = self.fastq_prefix.as_ref()?;
        if prefix.ends_with('/') {
            return Some((PathBuf::from(prefix), String::new()));
        }
        let path = Path::new(prefix);
        let folder = path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
        let pref = path.file_name().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        Some((folder, pref))
    }

    pub fn sample_db_path(&self) -> Option<PathBuf> {
        match (&self.sample_db, &self.output_dir) {
            (Some(db), _) => Some(PathBuf::from(db)),
            (None, Some(out)) if self.start_from != Stage::Begin => {
                Some(Path::new(out).join(crate::config::defs::SAMPLE_DB_COPY))
            }
            _ => self.fastq_path_and_prefix().map(|(folder, _)| folder.join("sample_db.csv")),
        }
    }
}

/// Checks argument combinations clap cannot express.
pub fn validate(args: &Arguments) -> Result<(), PipelineError> {
    if args.start_from != Stage::Begin {
        if args.output_dir.is_none() {
            return Err(PipelineError::InvalidConfig(
                "--start-from requires an existing output directory (--output-dir)".to_string(),
            ));
        }
    } else if args.fastq_prefix.is_none() {
        return Err(PipelineError::InvalidConfig(
            "without --start-from an input fastq prefix/folder must be given (--fastq-prefix)".to_string(),
        ));
    }
    if args.n_workers == 0 {
        return Err(PipelineError::InvalidConfig("--n-workers must be at least 1".to_string()));
    }
    if !(args.delay > 0.0) {
        return Err(PipelineError::InvalidConfig(format!("--delay must be positive, got {}", args.delay)));
    }
    Ok(())
}

pub fn parse() -> Arguments {
    Arguments::parse()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_limits() {
        assert_eq!(parse_debug_limits("4000, 3").unwrap(), DebugLimits { n_lines: 4000, n_samples: 3 });
        assert!(parse_debug_limits("4000").is_err());
        assert!(parse_debug_limits("a,3").is_err());
    }

    #[test]
    fn test_start_from_requires_output_dir() {
        let args = Arguments::parse_from(["transeq-pipelines", "--start-from", "align"]);
        assert_eq!(args.start_from, Stage::Align);
        assert!(validate(&args).is_err());

        let args = Arguments::parse_from(["transeq-pipelines", "--start-from", "ALIGN", "-o", "/tmp/run"]);
        assert!(validate(&args).is_ok());
    }

    #[test]
    fn test_begin_requires_fastq_prefix() {
        let args = Arguments::parse_from(["transeq-pipelines"]);
        assert!(validate(&args).is_err());

        let args = Arguments::parse_from(["transeq-pipelines", "-f", "/data/run1/lib_"]);
        assert!(validate(&args).is_ok());
        let (folder, pref) = args.fastq_path_and_prefix().unwrap();
        assert_eq!(folder, PathBuf::from("/data/run1"));
        assert_eq!(pref, "lib_");
        assert_eq!(args.sample_db_path().unwrap(), PathBuf::from("/data/run1/sample_db.csv"));
    }

    #[test]
    fn test_folder_prefix() {
        let args = Arguments::parse_from(["transeq-pipelines", "-f", "/data/run1/"]);
        let (folder, pref) = args.fastq_path_and_prefix().unwrap();
        assert_eq!(folder, PathBuf::from("/data/run1/"));
        assert!(pref.is_empty());
    }
}
