// src/utils/filters.rs: read filters applied to each sample's sorted alignments
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use log::debug;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::process::{Child, ChildStdin, Command};
use tokio_stream::StreamExt;

use crate::config::defs::PipelineError;
use crate::utils::scheme::{parse_scheme, SchemeCall};
use crate::utils::streams::line_stream;

const FLAG_REVERSE: u16 = 0x10;

/// The fields of a SAM line the filters look at.
#[derive(Debug, Clone, PartialEq)]
pub struct SamRecord {
    pub qname: String,
    pub flag: u16,
    pub rname: String,
    /// 1-based leftmost position.
    pub pos: u64,
    pub mapq: u8,
    pub cigar: String,
    pub seq: String,
}

impl SamRecord {
    pub fn parse(line: &str) -> Result<SamRecord> {
        let cols: Vec<&str> = line.splitn(11, '\t').collect();
        if cols.len() < 10 {
            return Err(anyhow!("SAM line has {} columns: {}", cols.len(), line));
        }
        Ok(SamRecord {
            qname: cols[0].to_string(),
            flag: cols[1].parse().with_context(|| format!("bad SAM flag '{}'", cols[1]))?,
            rname: cols[2].to_string(),
            pos: cols[3].parse().with_context(|| format!("bad SAM position '{}'", cols[3]))?,
            mapq: cols[4].parse().with_context(|| format!("bad SAM mapq '{}'", cols[4]))?,
            cigar: cols[5].to_string(),
            seq: cols[9].to_string(),
        })
    }

    pub fn is_reverse(&self) -> bool {
        self.flag & FLAG_REVERSE != 0
    }

    /// UMI carried in the read name as `umi:<UMI>`.
    pub fn umi(&self) -> Option<&str> {
        self.qname.strip_prefix("umi:").map(|rest| rest.split(|c: char| c.is_whitespace()).next().unwrap_or(rest))
    }

    /// Reference bases covered by the alignment.
    pub fn reference_len(&self) -> u64 {
        let mut len = 0;
        let mut n = 0u64;
        for c in self.cigar.chars() {
            if let Some(d) = c.to_digit(10) {
                n = n * 10 + d as u64;
                continue;
            }
            if matches!(c, 'M' | 'D' | 'N' | '=' | 'X') {
                len += n;
            }
            n = 0;
        }
        len
    }

    /// Position of the read's 5' end on the reference.
    pub fn five_prime(&self) -> u64 {
        if self.is_reverse() {
            self.pos + self.reference_len().max(1) - 1
        } else {
            self.pos
        }
    }
}

/// A read predicate. Filters may keep state across the reads of one sample.
pub trait ReadFilter: Send + fmt::Display {
    /// true if the read passes.
    fn apply(&mut self, rec: &SamRecord) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DupKind {
    Start,
    StartUmi,
}

/// Keeps the first read of every (chrom, strand, 5' position[, umi]) key.
pub struct DuplicateFilter {
    kind: DupKind,
    seen: HashSet<(String, bool, u64, String)>,
}

impl DuplicateFilter {
    pub fn new(kind: DupKind) -> Self {
        DuplicateFilter { kind, seen: HashSet::new() }
    }
}

impl ReadFilter for DuplicateFilter {
    fn apply(&mut self, rec: &SamRecord) -> bool {
        let umi = match self.kind {
            DupKind::StartUmi => rec.umi().unwrap_or_default().to_string(),
            DupKind::Start => String::new(),
        };
        self.seen.insert((rec.rname.clone(), rec.is_reverse(), rec.five_prime(), umi))
    }
}

impl fmt::Display for DuplicateFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            DupKind::Start => "start",
            DupKind::StartUmi => "start&umi",
        };
        write!(f, "dup(kind={})", kind)
    }
}

/// Keeps reads with mapping quality >= q.
pub struct QualityFilter {
    q: u8,
}

impl ReadFilter for QualityFilter {
    fn apply(&mut self, rec: &SamRecord) -> bool {
        rec.mapq >= self.q
    }
}

impl fmt::Display for QualityFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "qual(q={})", self.q)
    }
}

/// Keeps reads ending in at least n As (leading Ts when reverse-mapped).
pub struct PolyAFilter {
    n: usize,
}

impl ReadFilter for PolyAFilter {
    fn apply(&mut self, rec: &SamRecord) -> bool {
        let seq = rec.seq.as_bytes();
        let run = if rec.is_reverse() {
            seq.iter().take_while(|&&b| b == b'T' || b == b't').count()
        } else {
            seq.iter().rev().take_while(|&&b| b == b'A' || b == b'a').count()
        };
        run >= self.n
    }
}

impl fmt::Display for PolyAFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "polya(n={})", self.n)
    }
}

/// Inverts the wrapped filter.
pub struct Negated(Box<dyn ReadFilter>);

impl ReadFilter for Negated {
    fn apply(&mut self, rec: &SamRecord) -> bool {
        !self.0.apply(rec)
    }
}

impl fmt::Display for Negated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-", self.0)
    }
}

struct FilterSpec {
    name: &'static str,
    args: &'static str,
    help: &'static str,
}

const FILTER_REGISTRY: &[FilterSpec] = &[
    FilterSpec {
        name: "dup",
        args: "kind=start&umi|start (default start&umi)",
        help: "keep the first read of every start position (and umi); later reads are duplicates",
    },
    FilterSpec { name: "qual", args: "q=<int> (default 10)", help: "keep reads with mapping quality >= q" },
    FilterSpec {
        name: "polya",
        args: "n=<int> (default 5)",
        help: "keep reads with at least n trailing As (leading Ts for reverse-strand reads)",
    },
];

fn build_filter(call: &SchemeCall) -> Result<Box<dyn ReadFilter>, PipelineError> {
    let filter: Box<dyn ReadFilter> = match call.name.as_str() {
        "dup" => {
            call.only_args(&["kind"])?;
            let kind = match call.kwargs.get("kind").map(String::as_str) {
                None | Some("start&umi") => DupKind::StartUmi,
                Some("start") => DupKind::Start,
                Some(other) => {
                    return Err(PipelineError::InvalidConfig(format!("dup(): unknown kind '{}'", other)));
                }
            };
            Box::new(DuplicateFilter::new(kind))
        }
        "qual" => {
            call.only_args(&["q"])?;
            Box::new(QualityFilter { q: call.arg("q", 10u8)? })
        }
        "polya" => {
            call.only_args(&["n"])?;
            Box::new(PolyAFilter { n: call.arg("n", 5usize)? })
        }
        other => {
            let known: Vec<&str> = FILTER_REGISTRY.iter().map(|s| s.name).collect();
            return Err(PipelineError::InvalidConfig(format!(
                "unknown filter '{}', available filters: {}",
                other,
                known.join(", ")
            )));
        }
    };
    Ok(if call.negate { Box::new(Negated(filter)) } else { filter })
}

/// Parsed `--filter` value. Filters are stateful, so each sample gets a fresh set.
#[derive(Debug, Clone)]
pub struct FilterScheme {
    calls: Vec<SchemeCall>,
}

impl FilterScheme {
    pub fn parse(s: &str) -> Result<FilterScheme, PipelineError> {
        let scheme = FilterScheme { calls: parse_scheme(s, ',')? };
        // surface bad names and arguments at startup
        scheme.build()?;
        Ok(scheme)
    }

    pub fn build(&self) -> Result<Vec<Box<dyn ReadFilter>>, PipelineError> {
        self.calls.iter().map(build_filter).collect()
    }

    pub fn describe(&self) -> String {
        match self.build() {
            Ok(filters) if !filters.is_empty() => {
                filters.iter().map(|f| f.to_string()).collect::<Vec<_>>().join(", ")
            }
            _ => "none".to_string(),
        }
    }
}

/// The filters of one sample plus the samtools executable that reads and writes the BAMs.
pub struct FilterPipeline {
    samtools_exec: String,
    filters: Vec<Box<dyn ReadFilter>>,
}

async fn spawn_bam_writer(samtools_exec: &str, out: &Path) -> Result<(Child, BufWriter<ChildStdin>)> {
    let mut child = Command::new(samtools_exec)
        .args(["view", "-b", "-o"])
        .arg(out)
        .arg("-")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| anyhow!("Failed to spawn {} view: {}", samtools_exec, e))?;
    let stdin = child.stdin.take().ok_or_else(|| anyhow!("samtools stdin is not piped"))?;
    Ok((child, BufWriter::new(stdin)))
}

async fn write_line<W: AsyncWrite + Unpin>(w: &mut W, line: &str) -> Result<()> {
    w.write_all(line.as_bytes()).await?;
    w.write_all(b"\n").await?;
    Ok(())
}

async fn finish(child: Child, mut stdin: BufWriter<ChildStdin>, label: &str) -> Result<()> {
    stdin.flush().await?;
    stdin.shutdown().await?;
    drop(stdin);
    let out = child.wait_with_output().await?;
    if !out.status.success() {
        return Err(anyhow!("{} failed: {}", label, String::from_utf8_lossy(&out.stderr).trim()));
    }
    Ok(())
}

impl FilterPipeline {
    pub fn new(samtools_exec: &str, filters: Vec<Box<dyn ReadFilter>>) -> Self {
        FilterPipeline { samtools_exec: samtools_exec.to_string(), filters }
    }

    /// true if every filter passes. Evaluation stops at the first rejecting filter.
    pub fn accept(&mut self, rec: &SamRecord) -> bool {
        self.filters.iter_mut().all(|f| f.apply(rec))
    }

    /// Streams `unfiltered_bam` through the filters.
    ///
    /// # Arguments
    ///
    /// * `unfiltered_bam` - sorted, aligned reads.
    /// * `out_bam` - receives passing reads.
    /// * `sam_hdr` - header lines written ahead of the reads.
    /// * `filtered_bam` - receives rejected reads, if given.
    ///
    /// # Returns
    /// Number of reads that passed.
    pub async fn filter(&mut self, unfiltered_bam: &Path, out_bam: &Path, sam_hdr: &Path, filtered_bam: Option<&Path>) -> Result<u64> {
        let header = tokio::fs::read_to_string(sam_hdr)
            .await
            .with_context(|| format!("cannot read sam header {}", sam_hdr.display()))?;

        let mut reader = Command::new(&self.samtools_exec)
            .arg("view")
            .arg(unfiltered_bam)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| anyhow!("Failed to spawn {} view: {}", self.samtools_exec, e))?;
        let stdout = reader.stdout.take().ok_or_else(|| anyhow!("samtools stdout is not piped"))?;

        let (pass_child, mut pass_in) = spawn_bam_writer(&self.samtools_exec, out_bam).await?;
        let mut fail = match filtered_bam {
            Some(path) => Some(spawn_bam_writer(&self.samtools_exec, path).await?),
            None => None,
        };

        for line in header.lines() {
            write_line(&mut pass_in, line).await?;
            if let Some((_, fail_in)) = fail.as_mut() {
                write_line(fail_in, line).await?;
            }
        }

        let (mut n_pass, mut n_fail) = (0u64, 0u64);
        let mut lines = line_stream(stdout);
        while let Some(line) = lines.next().await {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let rec = SamRecord::parse(&line)?;
            if self.accept(&rec) {
                n_pass += 1;
                write_line(&mut pass_in, &line).await?;
            } else {
                n_fail += 1;
                if let Some((_, fail_in)) = fail.as_mut() {
                    write_line(fail_in, &line).await?;
                }
            }
        }

        let read_out = reader.wait_with_output().await?;
        if !read_out.status.success() {
            return Err(anyhow!(
                "samtools view {} failed: {}",
                unfiltered_bam.display(),
                String::from_utf8_lossy(&read_out.stderr).trim()
            ));
        }
        finish(pass_child, pass_in, "writing filtered bam").await?;
        if let Some((child, stdin)) = fail {
            finish(child, stdin, "writing rejected reads").await?;
        }
        debug!("{}: {} reads passed, {} filtered", out_bam.display(), n_pass, n_fail);
        Ok(n_pass)
    }
}

/// `--filter-specs` text.
pub fn filter_specs() -> String {
    let mut out = String::from(
        "Only reads that pass every filter are written to the BAM folder; with --keep-filtered the rest \
         go to the FILTERED folder.\nA filter scheme is a comma separated list of calls \
         <name>([<arg>=<value>,]*)[+|-], where '-' negates the filter. \
         For example \"dup(kind=start&umi),polya(n=5)\".\n\nAvailable filters:\n",
    );
    for spec in FILTER_REGISTRY {
        out.push_str(&format!("  {}({})\n      {}\n", spec.name, spec.args, spec.help));
    }
    out
}
