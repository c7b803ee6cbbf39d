// src/pipelines/stages.rs: the work each sample submits at every stage
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use log::debug;

use crate::cli::Arguments;
use crate::config::defs::{Strand, PASS_FILTER_STAT, SPIKEIN_SUFFIX};
use crate::utils::command;
use crate::utils::executor::ShellJob;
use crate::utils::fastx::umi_tag_reads;
use crate::utils::filters::{FilterPipeline, FilterScheme};
use crate::utils::sample::Sample;
use crate::utils::stats::{parse_bowtie_stats, suffixed, StatsHandle};
use crate::utils::work::{work_fn, Kwargs, WorkFn};

// Logical file names in `Sample::files`.
pub const TMP_FASTQ: &str = "tmp_fastq";
pub const FASTQ: &str = "fastq";
pub const SAM_HDR: &str = "sam_hdr";
pub const UNSORTED_BAM: &str = "unsorted_bam";
pub const UNFILTERED_BAM: &str = "unfiltered_bam";
pub const UNALIGNED_BAM: &str = "unaligned_bam";
pub const BAM: &str = "bam";
pub const FILTERED_BAM: &str = "filtered_bam";

pub const STRAND_KWARG: &str = "strand";
pub const NEGATE_KWARG: &str = "negate";

/// Builds the work function of each stage step for one sample.
pub trait StageWork: Send + Sync {
    /// BEGIN -> FASTQ: UMI-tagged single-end reads.
    fn collect_fastq(&self, sample: &Sample) -> WorkFn;

    /// Alignment to the spike-in genome, statistics only. None when no spike-in is configured.
    fn spikein_count(&self, sample: &Sample) -> Option<WorkFn>;

    /// FASTQ -> ALIGN: alignment, sorting and read filters.
    fn align(&self, sample: &Sample) -> WorkFn;

    /// One strand's coverage track; reads `strand` and optionally `negate` from kwargs.
    fn make_track(&self, sample: &Sample) -> WorkFn;

    /// ALIGN -> COUNT: reads per annotated feature.
    fn count(&self, sample: &Sample) -> WorkFn;
}

/// Kwargs for `make_track`.
pub fn track_kwargs(strand: Strand, negate: Option<bool>) -> Kwargs {
    let mut kwargs = Kwargs::new();
    kwargs.insert(STRAND_KWARG.to_string(), strand.tag().to_string());
    if let Some(negate) = negate {
        kwargs.insert(NEGATE_KWARG.to_string(), negate.to_string());
    }
    kwargs
}

fn parse_track_kwargs(kwargs: &Kwargs) -> Result<(Strand, bool)> {
    let tag = kwargs.get(STRAND_KWARG).ok_or_else(|| anyhow!("make_track needs a '{}' argument", STRAND_KWARG))?;
    let strand = Strand::from_tag(tag).ok_or_else(|| anyhow!("unknown strand '{}'", tag))?;
    let negate = match kwargs.get(NEGATE_KWARG) {
        Some(v) => v.parse::<bool>().with_context(|| format!("bad negate value '{}'", v))?,
        None => strand.negate_by_default(),
    };
    Ok((strand, negate))
}

/// Production stages: external tools through the work context's executor.
pub struct ToolStages {
    args: Arc<Arguments>,
    filters: FilterScheme,
    stats: StatsHandle,
    barcode_len: usize,
    n_threads: usize,
}

impl ToolStages {
    pub fn new(args: Arc<Arguments>, filters: FilterScheme, stats: StatsHandle, barcode_len: usize, n_threads: usize) -> Self {
        ToolStages { args, filters, stats, barcode_len, n_threads }
    }
}

fn required<'a>(value: &'a Option<String>, flag: &str) -> Result<&'a str> {
    value.as_deref().ok_or_else(|| anyhow!("{} is not set", flag))
}

async fn remove_if_exists(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!("could not remove {}: {}", path.display(), e);
        }
    }
}

/// Feature id (column 4) of every annotation line, in file order and without repeats.
pub fn annotation_ids(text: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    text.lines()
        .filter(|l| !l.trim().is_empty() && !l.starts_with('#') && !l.starts_with("track"))
        .filter_map(|l| l.split('\t').nth(3))
        .filter(|id| seen.insert(id.to_string()))
        .map(str::to_string)
        .collect()
}

/// Zero-filled counts: every id of `ids`, with the last column of each coverage line added to its id.
pub fn counts_from_coverage<'a>(ids: &[String], coverage: impl Iterator<Item = &'a str>) -> Result<Vec<(String, u64)>> {
    let mut counts: HashMap<&str, u64> = ids.iter().map(|id| (id.as_str(), 0)).collect();
    let mut extra: Vec<(String, u64)> = Vec::new();
    for line in coverage.filter(|l| !l.trim().is_empty()) {
        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() < 5 {
            return Err(anyhow!("coverage line has {} columns: {}", cols.len(), line));
        }
        let n: u64 = cols[cols.len() - 1].trim().parse().with_context(|| format!("bad count in '{}'", line))?;
        match counts.get_mut(cols[3]) {
            Some(c) => *c += n,
            None => extra.push((cols[3].to_string(), n)),
        }
    }
    let mut out: Vec<(String, u64)> = ids.iter().map(|id| (id.clone(), counts[id.as_str()])).collect();
    out.extend(extra);
    Ok(out)
}

impl StageWork for ToolStages {
    fn collect_fastq(&self, sample: &Sample) -> WorkFn {
        let files = (sample.file(TMP_FASTQ).cloned(), sample.file(FASTQ).cloned());
        let (bc_len, umi_len) = (self.barcode_len, self.args.umi_length);
        work_fn(move |_, _| async move {
            let (src, dst) = (files.0?, files.1?);
            let dst_clone = dst.clone();
            let src_clone = src.clone();
            let n = tokio::task::spawn_blocking(move || umi_tag_reads(&src_clone, &dst_clone, bc_len, umi_len))
                .await
                .map_err(|e| anyhow!("fastq collection aborted: {}", e))??;
            remove_if_exists(&src).await;
            Ok(Some(format!("{} reads written to {}", n, dst.display())))
        })
    }

    fn spikein_count(&self, sample: &Sample) -> Option<WorkFn> {
        let index = self.args.spikein_index.clone()?;
        let fastq = sample.file(FASTQ).cloned();
        let name = sample.base_name();
        let (exec, n_threads, stats) = (self.args.bowtie_exec.clone(), self.n_threads, self.stats.clone());
        Some(work_fn(move |ctx, _| async move {
            let fastq = fastq?;
            let job = ShellJob::new(format!("{}.spikein", name), command::bowtie2::spikein_script(&exec, n_threads, &fastq, &index));
            let out = ctx.executor.run(&job).await?.check(&job.label)?;
            let bt = parse_bowtie_stats(&out.stderr);
            let aligned = bt.get("total").copied().unwrap_or(0).saturating_sub(bt.get("unaligned").copied().unwrap_or(0));
            let summary = format!("{} spike-in reads aligned", aligned);
            stats.add_stats(&name, suffixed(bt, SPIKEIN_SUFFIX));
            Ok(Some(summary))
        }))
    }

    fn align(&self, sample: &Sample) -> WorkFn {
        let args = Arc::clone(&self.args);
        let stats = self.stats.clone();
        let n_threads = self.n_threads;
        let name = sample.base_name();
        let filters = self.filters.build();
        let files = sample.files.clone();
        work_fn(move |ctx, _| async move {
            let path = |key: &str| -> Result<PathBuf> {
                files.get(key).cloned().ok_or_else(|| anyhow!("sample {} has no '{}' file assigned", name, key))
            };
            let index = required(&args.bowtie_index, "--bowtie-index")?;
            let (fastq, sam_hdr, unsorted, unfiltered, bam) =
                (path(FASTQ)?, path(SAM_HDR)?, path(UNSORTED_BAM)?, path(UNFILTERED_BAM)?, path(BAM)?);

            let job = ShellJob::new(
                format!("{}.align", name),
                command::align_script(&args, n_threads, index, &fastq, &sam_hdr, &unsorted),
            );
            let out = ctx.executor.run(&job).await?.check(&job.label)?;
            let bt = parse_bowtie_stats(&out.stderr);
            stats.add_stats(&name, bt);

            if args.keep_unaligned {
                let job = ShellJob::new(format!("{}.unaligned", name), command::unaligned_script(&args, &unsorted, &path(UNALIGNED_BAM)?));
                ctx.executor.run(&job).await?.check(&job.label)?;
            }

            let job = ShellJob::new(format!("{}.sort", name), command::sort_aligned_script(&args, n_threads, &unsorted, &unfiltered));
            ctx.executor.run(&job).await?.check(&job.label)?;
            remove_if_exists(&unsorted).await;

            let filtered = if args.keep_filtered { Some(path(FILTERED_BAM)?) } else { None };
            let mut pipeline = FilterPipeline::new(&args.samtools_exec, filters?);
            let n_pass = pipeline
                .filter(&unfiltered, &bam, &sam_hdr, filtered.as_deref())
                .await
                .with_context(|| format!("filtering {}", unfiltered.display()))?;
            stats.add_stats(&name, HashMap::from([(PASS_FILTER_STAT.to_string(), n_pass)]));
            remove_if_exists(&unfiltered).await;
            remove_if_exists(&sam_hdr).await;
            Ok(Some(format!("{} reads passed filters", n_pass)))
        })
    }

    fn make_track(&self, sample: &Sample) -> WorkFn {
        let args = Arc::clone(&self.args);
        let name = sample.base_name();
        let files = sample.files.clone();
        work_fn(move |ctx, kwargs| async move {
            let (strand, negate) = parse_track_kwargs(&kwargs)?;
            let path = |key: &str| -> Result<PathBuf> {
                files.get(key).cloned().ok_or_else(|| anyhow!("sample {} has no '{}' file assigned", name, key))
            };
            let sizes = PathBuf::from(required(&args.chrom_sizes, "--chrom-sizes")?);
            let (bam, bed, bw) = (path(BAM)?, path(Sample::tmp_bed_key(strand).as_str())?, path(Sample::track_key(strand).as_str())?);

            let label = format!("{}.track.{}", name, strand.tag());
            let script = format!(
                "{}\n{}",
                command::coverage_script(&args, &bam, &sizes, strand, negate, &bed),
                command::bigwig_script(&args, &bed, &sizes, &bw)
            );
            let job = ShellJob::new(label, script);
            ctx.executor.run(&job).await?.check(&job.label)?;
            remove_if_exists(&bed).await;
            Ok(Some(format!("{} track written to {}", strand.tag(), bw.display())))
        })
    }

    fn count(&self, sample: &Sample) -> WorkFn {
        let args = Arc::clone(&self.args);
        let stats = self.stats.clone();
        let name = sample.base_name();
        let bam = sample.file(BAM).cloned();
        work_fn(move |ctx, _| async move {
            let bam = bam?;
            let annotation = PathBuf::from(required(&args.tts_file, "--tts-file")?);
            let ids = annotation_ids(
                &tokio::fs::read_to_string(&annotation)
                    .await
                    .with_context(|| format!("cannot read annotation {}", annotation.display()))?,
            );
            let job = ShellJob::new(format!("{}.count", name), command::count_script(&args, &annotation, &bam));
            let out = ctx.executor.run(&job).await?.check(&job.label)?;
            let counts = counts_from_coverage(&ids, out.stdout_lines())?;
            let total: u64 = counts.iter().map(|(_, n)| n).sum();
            let n_features = counts.len();
            stats.set_counts(&name, counts);
            Ok(Some(format!("{} reads over {} features", total, n_features)))
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_kwargs() -> Result<()> {
        assert_eq!(parse_track_kwargs(&track_kwargs(Strand::Watson, None))?, (Strand::Watson, false));
        assert_eq!(parse_track_kwargs(&track_kwargs(Strand::Crick, None))?, (Strand::Crick, true));
        assert_eq!(parse_track_kwargs(&track_kwargs(Strand::Crick, Some(false)))?, (Strand::Crick, false));
        assert!(parse_track_kwargs(&Kwargs::new()).is_err());
        Ok(())
    }

    #[test]
    fn test_counts_are_zero_filled() -> Result<()> {
        let annotation = "chrI\t10\t20\tYAL001C\t0\t+\nchrI\t30\t40\tYAL002W\t0\t-\nchrI\t50\t60\tYAL001C\t0\t+\n";
        let ids = annotation_ids(annotation);
        assert_eq!(ids, vec!["YAL001C", "YAL002W"]);
        let coverage = ["chrI\t10\t20\tYAL001C\t0\t+\t4", "chrI\t50\t60\tYAL001C\t0\t+\t3"];
        let counts = counts_from_coverage(&ids, coverage.into_iter())?;
        assert_eq!(counts, vec![("YAL001C".to_string(), 7), ("YAL002W".to_string(), 0)]);
        assert!(counts_from_coverage(&ids, ["chrI\t1"].into_iter()).is_err());
        Ok(())
    }
}
