// src/utils/exporters.rs: end-of-run export of counts and statistics
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Result;
use log::info;

use crate::config::defs::PipelineError;
use crate::utils::scheme::{parse_scheme, SchemeCall};
use crate::utils::stats::{write_counts_table, write_statistics_table, StatsSnapshot};

/// What the exporters see of a finished run.
pub struct ExportContext<'a> {
    pub output_dir: &'a Path,
    pub experiment: &'a str,
    /// Sample base names in registry order.
    pub samples: &'a [String],
    /// Rows of the statistics table: the samples plus the no-barcode row.
    pub stat_rows: &'a [String],
    pub stat_order: &'a [String],
    pub snapshot: &'a StatsSnapshot,
}

impl ExportContext<'_> {
    fn path(&self, suffix: &str) -> PathBuf {
        self.output_dir.join(format!("{}_{}", self.experiment, suffix))
    }

    /// Feature ids in the order of the first sample that has counts.
    fn feature_ids(&self) -> Vec<String> {
        self.samples
            .iter()
            .find_map(|s| self.snapshot.counts.get(s))
            .map(|c| c.iter().map(|(f, _)| f.clone()).collect())
            .unwrap_or_default()
    }

    fn count(&self, sample: &str, feature: &str) -> Option<u64> {
        self.snapshot
            .counts
            .get(sample)
            .and_then(|c| c.iter().find(|(f, _)| f == feature))
            .map(|(_, n)| *n)
    }
}

pub trait Exporter: Send + Sync + fmt::Display {
    /// Writes the export files and returns their paths.
    fn export(&self, ctx: &ExportContext<'_>) -> Result<Vec<PathBuf>>;
}

/// Tab delimited counts matrix (features x samples) and statistics table.
pub struct TabExporter;

impl Exporter for TabExporter {
    fn export(&self, ctx: &ExportContext<'_>) -> Result<Vec<PathBuf>> {
        let counts_path = ctx.path("counts.tsv");
        let mut wtr = csv::WriterBuilder::new().delimiter(b'\t').from_path(&counts_path)?;
        let mut header = vec!["feature".to_string()];
        header.extend(ctx.samples.iter().cloned());
        wtr.write_record(&header)?;
        for feature in ctx.feature_ids() {
            let mut row = vec![feature.clone()];
            row.extend(
                ctx.samples
                    .iter()
                    .map(|s| ctx.count(s, &feature).map(|n| n.to_string()).unwrap_or_default()),
            );
            wtr.write_record(&row)?;
        }
        wtr.flush()?;

        let stats_path = ctx.path("stats.tsv");
        write_statistics_table(&stats_path, ctx.snapshot, ctx.stat_rows, ctx.stat_order)?;
        Ok(vec![counts_path, stats_path])
    }
}

impl fmt::Display for TabExporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tab()")
    }
}

/// One `sample  feature  count` row per count.
pub struct LongExporter;

impl Exporter for LongExporter {
    fn export(&self, ctx: &ExportContext<'_>) -> Result<Vec<PathBuf>> {
        let path = ctx.path("long.tsv");
        write_counts_table(&path, ctx.snapshot, ctx.samples)?;
        Ok(vec![path])
    }
}

impl fmt::Display for LongExporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "long()")
    }
}

const EXPORTER_REGISTRY: &[(&str, &str)] = &[
    ("tab", "counts matrix (<exp>_counts.tsv) and statistics (<exp>_stats.tsv), tab delimited"),
    ("long", "one sample/feature/count row per count (<exp>_long.tsv)"),
];

fn build_exporter(call: &SchemeCall) -> Result<Box<dyn Exporter>, PipelineError> {
    call.only_args(&[])?;
    match call.name.as_str() {
        "tab" => Ok(Box::new(TabExporter)),
        "long" => Ok(Box::new(LongExporter)),
        other => Err(PipelineError::InvalidConfig(format!(
            "unknown exporter '{}', available exporters: {}",
            other,
            EXPORTER_REGISTRY.iter().map(|(n, _)| *n).collect::<Vec<_>>().join(", ")
        ))),
    }
}

/// Parses a `;`-separated exporter scheme.
pub fn exporters_from_string(s: &str) -> Result<Vec<Box<dyn Exporter>>, PipelineError> {
    parse_scheme(s, ';')?.iter().map(build_exporter).collect()
}

/// Runs every exporter, then copies their files to `export_path` if given.
pub fn run_exporters(exporters: &[Box<dyn Exporter>], ctx: &ExportContext<'_>, export_path: Option<&Path>) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for exporter in exporters {
        let files = exporter.export(ctx)?;
        info!("{} wrote {}", exporter, files.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", "));
        written.extend(files);
    }
    if let Some(dest) = export_path {
        std::fs::create_dir_all(dest)?;
        for file in &written {
            if let Some(name) = file.file_name() {
                std::fs::copy(file, dest.join(name))?;
            }
        }
        info!("exported files copied to {}", dest.display());
    }
    Ok(written)
}

/// `--exporter-specs` text.
pub fn exporter_specs() -> String {
    let mut out = String::from(
        "Exporters write the counts and statistics of a run at its end. With --export-path the files are \
         copied there as well.\nAn exporter scheme is a semicolon separated list of calls <name>(), \
         for example \"tab();long()\".\n\nAvailable exporters:\n",
    );
    for (name, help) in EXPORTER_REGISTRY {
        out.push_str(&format!("  {}()\n      {}\n", name, help));
    }
    out
}
