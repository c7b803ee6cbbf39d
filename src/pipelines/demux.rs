// src/pipelines/demux.rs: splits pooled R1/R2 pairs into per-sample files by R2 barcode
use std::path::PathBuf;

use anyhow::{anyhow, Context};
use log::{debug, info, warn};
use seq_io::fastq::Record;

use crate::config::defs::PipelineError;
use crate::utils::barcode::{BarcodeMatch, BarcodeMatcher};
use crate::utils::fastx::{fastq_reader, write_record};
use crate::utils::file::{FastqPair, FileWriter};

/// Read pairs routed to each sample, split by how the barcode matched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DemuxCounts {
    pub exact: Vec<u64>,
    pub ball: Vec<u64>,
    pub no_barcode: u64,
}

impl DemuxCounts {
    /// Total read pairs of sample `idx`.
    pub fn n_reads(&self, idx: usize) -> u64 {
        self.exact[idx] + self.ball[idx]
    }
}

pub struct Demultiplexer {
    matcher: BarcodeMatcher,
    outputs: Vec<PathBuf>,
    no_barcode: Option<PathBuf>,
    max_pairs: Option<usize>,
}

impl Demultiplexer {
    /// # Arguments
    ///
    /// * `barcodes` - sample barcodes in registry order.
    /// * `hamming_distance` - tolerance of the ball pass.
    /// * `outputs` - interleaved FASTQ per sample, same order as `barcodes`.
    /// * `no_barcode` - where unmatched pairs go, if they are kept.
    /// * `max_pairs` - pairs read per input pair (debug runs).
    pub fn new(
        barcodes: &[&str],
        hamming_distance: usize,
        outputs: Vec<PathBuf>,
        no_barcode: Option<PathBuf>,
        max_pairs: Option<usize>,
    ) -> Result<Demultiplexer, PipelineError> {
        if barcodes.len() != outputs.len() {
            return Err(PipelineError::InvalidConfig(format!(
                "{} barcodes but {} output files",
                barcodes.len(),
                outputs.len()
            )));
        }
        let matcher = BarcodeMatcher::new(barcodes, hamming_distance)?;
        debug!(
            "barcode lookup: {} barcodes of {}bp, {} ball keys",
            barcodes.len(),
            matcher.barcode_len(),
            matcher.ball_size()
        );
        if matcher.ambiguous_keys() > 0 {
            warn!(
                "{} barcode variants are equally close to more than one sample; they go to the sample listed first",
                matcher.ambiguous_keys()
            );
        }
        Ok(Demultiplexer { matcher, outputs, no_barcode, max_pairs })
    }

    /// Reads every input pair. Blocking; run it off the async workers.
    pub fn run(&self, inputs: &[FastqPair]) -> Result<DemuxCounts, PipelineError> {
        let mut writers = self
            .outputs
            .iter()
            .map(|p| FileWriter::create(p).with_context(|| format!("cannot create {}", p.display())))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let mut nobc_writer = match &self.no_barcode {
            Some(p) => Some(FileWriter::create(p).with_context(|| format!("cannot create {}", p.display()))?),
            None => None,
        };

        let n = self.outputs.len();
        let mut counts = DemuxCounts { exact: vec![0; n], ball: vec![0; n], no_barcode: 0 };
        for pair in inputs {
            info!("splitting {} / {}", pair.r1.display(), pair.r2.display());
            self.split_pair(pair, &mut writers, nobc_writer.as_mut(), &mut counts)?;
        }

        for w in writers {
            w.finish()?;
        }
        if let Some(w) = nobc_writer {
            w.finish()?;
        }
        Ok(counts)
    }

    fn split_pair(
        &self,
        pair: &FastqPair,
        writers: &mut [FileWriter],
        mut nobc: Option<&mut FileWriter>,
        counts: &mut DemuxCounts,
    ) -> Result<(), PipelineError> {
        let bc_len = self.matcher.barcode_len();
        let mut r1_reader = fastq_reader(&pair.r1).with_context(|| format!("cannot open {}", pair.r1.display()))?;
        let mut r2_reader = fastq_reader(&pair.r2).with_context(|| format!("cannot open {}", pair.r2.display()))?;
        let mut n_pairs = 0usize;

        loop {
            if self.max_pairs.is_some_and(|max| n_pairs >= max) {
                break;
            }
            let (r1, r2) = match (r1_reader.next(), r2_reader.next()) {
                (None, None) => break,
                (Some(r1), Some(r2)) => (r1.map_err(anyhow::Error::from)?, r2.map_err(anyhow::Error::from)?),
                _ => {
                    return Err(anyhow!("{} and {} have different read counts", pair.r1.display(), pair.r2.display()).into());
                }
            };
            n_pairs += 1;

            let seq2 = r2.seq();
            if seq2.len() < bc_len {
                return Err(PipelineError::BarcodeLength {
                    read: String::from_utf8_lossy(r2.head()).into_owned(),
                    expected: bc_len,
                    found: seq2.len(),
                });
            }
            let barcode = seq2[..bc_len].to_ascii_uppercase();

            let target = match self.matcher.classify(&barcode) {
                BarcodeMatch::Exact(idx) => {
                    counts.exact[idx] += 1;
                    Some(&mut writers[idx])
                }
                BarcodeMatch::Ball(idx) => {
                    counts.ball[idx] += 1;
                    Some(&mut writers[idx])
                }
                BarcodeMatch::NoMatch => {
                    counts.no_barcode += 1;
                    nobc.as_deref_mut()
                }
            };
            if let Some(w) = target {
                write_record(w, &r1)?;
                write_record(w, &r2)?;
            }
        }
        debug!("{}: {} read pairs", pair.r1.display(), n_pairs);
        Ok(())
    }
}

/// Logs the per-sample split.
pub fn log_counts(names: &[String], counts: &DemuxCounts) {
    let total: u64 = (0..names.len()).map(|i| counts.n_reads(i)).sum::<u64>() + counts.no_barcode;
    for (i, name) in names.iter().enumerate() {
        info!("{}: {} reads ({} exact, {} within tolerance)", name, counts.n_reads(i), counts.exact[i], counts.ball[i]);
    }
    info!("no barcode: {} of {} reads", counts.no_barcode, total);
}
