/// Functions and structs for building the shell pipelines of each stage

use std::path::Path;

use anyhow::{anyhow, Result};
use log::debug;

use crate::cli::Arguments;
use crate::config::defs::{
    BedtoolsSubcommand, ExecOn, PipelineError, SamtoolsSubcommand, Strand, AWK_TAG, SBATCH_TAG, SORT_TAG,
};
use crate::utils::executor::shell_quote;

fn q(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

pub mod bowtie2 {
    use super::*;

    /// `bowtie2 --local -p N -U <fastq> -x <index>`; alignment statistics go to stderr.
    pub fn arg_generator(exec: &str, n_threads: usize, fastq: &Path, index: &str) -> String {
        format!("{} --local -p {} -U {} -x {}", exec, n_threads, q(fastq), shell_quote(index))
    }

    /// Aligns to a spike-in genome only to collect statistics.
    pub fn spikein_script(exec: &str, n_threads: usize, fastq: &Path, index: &str) -> String {
        format!("{} > /dev/null", arg_generator(exec, n_threads, fastq, index))
    }
}

pub mod samtools {
    use super::*;

    pub fn arg_generator(exec: &str, sub: SamtoolsSubcommand, args: &[String]) -> String {
        let sub = match sub {
            SamtoolsSubcommand::View => "view",
            SamtoolsSubcommand::Sort => "sort",
        };
        let mut parts = vec![exec.to_string(), sub.to_string()];
        parts.extend(args.iter().cloned());
        parts.join(" ")
    }
}

pub mod bedtools {
    use super::*;

    pub fn arg_generator(exec: &str, sub: BedtoolsSubcommand, args: &[String]) -> String {
        let sub = match sub {
            BedtoolsSubcommand::Genomecov => "genomecov",
            BedtoolsSubcommand::Coverage => "coverage",
        };
        let mut parts = vec![exec.to_string(), sub.to_string()];
        parts.extend(args.iter().cloned());
        parts.join(" ")
    }
}

/// Primary alignment: bowtie2 | header capture | unsorted bam.
///
/// # Arguments
///
/// * `fastq` - UMI-tagged reads of one sample.
/// * `sam_hdr` - receives the `@SQ`/`@HD` lines of the aligner output.
/// * `unsorted_bam` - every alignment, aligned or not.
///
/// # Returns
/// bash pipeline; bowtie2 statistics are written on stderr.
pub fn align_script(args: &Arguments, n_threads: usize, index: &str, fastq: &Path, sam_hdr: &Path, unsorted_bam: &Path) -> String {
    format!(
        "{bt} | {awk} -v hdr={hdr} 'BEGIN{{OFS=\"\\t\"}} /^@/ {{print > hdr}} {{print}}' | {view}",
        bt = bowtie2::arg_generator(&args.bowtie_exec, n_threads, fastq, index),
        awk = AWK_TAG,
        hdr = q(sam_hdr),
        view = samtools::arg_generator(
            &args.samtools_exec,
            SamtoolsSubcommand::View,
            &["-b".to_string(), "-o".to_string(), q(unsorted_bam), "-".to_string()],
        ),
    )
}

/// Writes the unaligned reads (flag 4) of `bam` to `out`.
pub fn unaligned_script(args: &Arguments, bam: &Path, out: &Path) -> String {
    samtools::arg_generator(
        &args.samtools_exec,
        SamtoolsSubcommand::View,
        &["-b".to_string(), "-f4".to_string(), "-o".to_string(), q(out), q(bam)],
    )
}

/// Keeps aligned reads of `bam` and sorts them by coordinate into `out`.
pub fn sort_aligned_script(args: &Arguments, n_threads: usize, bam: &Path, out: &Path) -> String {
    format!(
        "{} | {}",
        samtools::arg_generator(&args.samtools_exec, SamtoolsSubcommand::View, &["-b".to_string(), "-F4".to_string(), q(bam)]),
        samtools::arg_generator(
            &args.samtools_exec,
            SamtoolsSubcommand::Sort,
            &["-@".to_string(), n_threads.to_string(), "-o".to_string(), q(out), "-".to_string()],
        ),
    )
}

/// Strand coverage as a sorted bedGraph, negated when `negate` is set.
pub fn coverage_script(args: &Arguments, bam: &Path, chrom_sizes: &Path, strand: Strand, negate: bool, bed_out: &Path) -> String {
    let genomecov = bedtools::arg_generator(
        &args.bedtools_exec,
        BedtoolsSubcommand::Genomecov,
        &[
            "-ibam".to_string(),
            q(bam),
            "-g".to_string(),
            q(chrom_sizes),
            "-bg".to_string(),
            "-strand".to_string(),
            strand.bedtools_flag().to_string(),
        ],
    );
    let negate_step = if negate {
        format!(" | {} 'BEGIN{{OFS=\"\\t\"}} {{$4=-$4; print}}'", AWK_TAG)
    } else {
        String::new()
    };
    format!("{}{} | {} -k1,1 -k2,2n > {}", genomecov, negate_step, SORT_TAG, q(bed_out))
}

pub fn bigwig_script(args: &Arguments, bed: &Path, chrom_sizes: &Path, bw_out: &Path) -> String {
    format!("{} {} {} {}", args.bg2bw_exec, q(bed), q(chrom_sizes), q(bw_out))
}

/// Read counts per annotation interval; count is the last column.
pub fn count_script(args: &Arguments, annotation: &Path, bam: &Path) -> String {
    bedtools::arg_generator(
        &args.bedtools_exec,
        BedtoolsSubcommand::Coverage,
        &["-counts".to_string(), "-a".to_string(), q(annotation), "-b".to_string(), q(bam)],
    )
}

async fn presence_check(exec: &str, probe: &str) -> Result<()> {
    tokio::process::Command::new(exec)
        .arg(probe)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .map_err(|e| anyhow!("Failed to spawn {}: {}. Is it installed?", exec, e))?;
    Ok(())
}

/// Verifies that every external tool of the run can be started.
///
/// # Arguments
///
/// * `args` - run arguments naming the executables.
///
/// # Returns
/// MissingTool for the first tool that cannot be spawned.
pub async fn check_tools(args: &Arguments) -> Result<(), PipelineError> {
    let mut tools: Vec<(&str, &str)> = vec![
        (args.bowtie_exec.as_str(), "--help"),
        (args.samtools_exec.as_str(), "--help"),
        (args.bedtools_exec.as_str(), "--help"),
        (args.bg2bw_exec.as_str(), "--help"),
    ];
    if args.exec_on == ExecOn::Slurm {
        tools.push((SBATCH_TAG, "--version"));
    }
    for (exec, probe) in tools {
        presence_check(exec, probe)
            .await
            .map_err(|e| PipelineError::MissingTool { tool: exec.to_string(), error: e.to_string() })?;
        debug!("found {}", exec);
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use clap::Parser;

    fn args() -> Arguments {
        Arguments::parse_from(["transeq-pipelines", "-f", "/data/"])
    }

    #[test]
    fn test_align_script() {
        let s = align_script(
            &args(),
            4,
            "/idx/sacCer3",
            &PathBuf::from("/o/FASTQ/wt_0.fastq.gz"),
            &PathBuf::from("/o/.tmp/wt_0.sam_hdr"),
            &PathBuf::from("/o/.tmp/wt_0.unsorted.bam"),
        );
        assert!(s.starts_with("bowtie2 --local -p 4 -U '/o/FASTQ/wt_0.fastq.gz' -x '/idx/sacCer3' | awk"));
        assert!(s.ends_with("samtools view -b -o '/o/.tmp/wt_0.unsorted.bam' -"));
    }

    #[test]
    fn test_coverage_script_negation() {
        let a = args();
        let bam = PathBuf::from("s.bam");
        let sizes = PathBuf::from("chrom.sizes");
        let bed = PathBuf::from("s.c.bed");
        let neg = coverage_script(&a, &bam, &sizes, Strand::Crick, true, &bed);
        assert!(neg.contains("-strand -"));
        assert!(neg.contains("$4=-$4"));
        assert!(neg.ends_with("sort -k1,1 -k2,2n > 's.c.bed'"));
        let pos = coverage_script(&a, &bam, &sizes, Strand::Watson, false, &bed);
        assert!(pos.contains("-strand +"));
        assert!(!pos.contains("$4=-$4"));
    }

    #[test]
    fn test_count_script() {
        let s = count_script(&args(), &PathBuf::from("tts.bed"), &PathBuf::from("s.bam"));
        assert_eq!(s, "bedtools coverage -counts -a 'tts.bed' -b 's.bam'");
    }

    #[tokio::test]
    async fn test_missing_tool() {
        let mut a = args();
        a.bowtie_exec = "definitely-not-a-real-aligner".to_string();
        let res = check_tools(&a).await;
        assert!(matches!(res, Err(PipelineError::MissingTool { ref tool, .. }) if tool == "definitely-not-a-real-aligner"));
    }
}
