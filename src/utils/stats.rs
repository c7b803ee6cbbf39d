/// Per-sample statistics and counts, owned by a single collector task
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{anyhow, Result};
use lazy_static::lazy_static;
use log::{debug, warn};
use regex::Regex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::utils::channel::Channel;

lazy_static! {
    static ref BT_TOTAL_RE: Regex = Regex::new(r"^\s*(\d+) reads; of these:").unwrap();
    static ref BT_UNALIGNED_RE: Regex = Regex::new(r"^\s*(\d+) \([\d.]+%\) aligned 0 times").unwrap();
    static ref BT_UNIQUE_RE: Regex = Regex::new(r"^\s*(\d+) \([\d.]+%\) aligned exactly 1 time").unwrap();
    static ref BT_MULTI_RE: Regex = Regex::new(r"^\s*(\d+) \([\d.]+%\) aligned >1 times").unwrap();
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatKind {
    /// Named counters, summed into what is already there.
    Stats(HashMap<String, u64>),
    /// Feature counts in annotation order, replacing earlier counts.
    Counts(Vec<(String, u64)>),
}

#[derive(Debug)]
pub enum StatMessage {
    Update { sample: String, kind: StatKind },
    Snapshot(oneshot::Sender<StatsSnapshot>),
    Shutdown,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSnapshot {
    pub stats: BTreeMap<String, HashMap<String, u64>>,
    pub counts: BTreeMap<String, Vec<(String, u64)>>,
}

impl StatsSnapshot {
    fn apply(&mut self, sample: String, kind: StatKind) {
        match kind {
            StatKind::Stats(update) => {
                let entry = self.stats.entry(sample).or_default();
                for (k, v) in update {
                    *entry.entry(k).or_insert(0) += v;
                }
            }
            StatKind::Counts(counts) => {
                self.counts.insert(sample, counts);
            }
        }
    }

    pub fn stat(&self, sample: &str, key: &str) -> Option<u64> {
        self.stats.get(sample).and_then(|s| s.get(key)).copied()
    }
}

/// Sends statistics to the collector.
#[derive(Clone, Debug)]
pub struct StatsHandle {
    channel: Channel<StatMessage>,
}

impl StatsHandle {
    pub fn add_stats(&self, sample: &str, stats: HashMap<String, u64>) {
        self.channel.put(StatMessage::Update { sample: sample.to_string(), kind: StatKind::Stats(stats) });
    }

    pub fn set_counts(&self, sample: &str, counts: Vec<(String, u64)>) {
        self.channel.put(StatMessage::Update { sample: sample.to_string(), kind: StatKind::Counts(counts) });
    }

    /// Current totals. Every update put before this call is included.
    pub async fn snapshot(&self) -> Result<StatsSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.channel.put(StatMessage::Snapshot(tx));
        rx.await.map_err(|_| anyhow!("statistics collector is gone"))
    }

    pub fn shutdown(&self) {
        self.channel.put(StatMessage::Shutdown);
    }
}

/// Starts the collector task on `channel`.
///
/// # Arguments
///
/// * `channel` - statistics channel; the collector is its only reader.
/// * `initial` - totals to start from (a resumed run's earlier numbers).
///
/// # Returns
/// A handle for producers and the collector's join handle, which yields the final totals.
pub fn spawn_collector(channel: Channel<StatMessage>, initial: StatsSnapshot) -> (StatsHandle, JoinHandle<StatsSnapshot>) {
    let handle = StatsHandle { channel: channel.clone() };
    let task = tokio::spawn(async move {
        let mut acc = initial;
        while let Ok(msg) = channel.get(None).await {
            match msg {
                StatMessage::Update { sample, kind } => acc.apply(sample, kind),
                StatMessage::Snapshot(reply) => {
                    let _ = reply.send(acc.clone());
                }
                StatMessage::Shutdown => break,
            }
        }
        debug!("statistics collector stopped");
        acc
    });
    (handle, task)
}

/// Reads bowtie2's alignment summary (stderr).
///
/// # Returns
/// `total`, `unaligned`, `unique-align` and `multiple-align`; missing lines are left out.
pub fn parse_bowtie_stats(stderr: &str) -> HashMap<String, u64> {
    let mut stats = HashMap::new();
    for line in stderr.lines() {
        for (re, key) in [
            (&*BT_TOTAL_RE, "total"),
            (&*BT_UNALIGNED_RE, "unaligned"),
            (&*BT_UNIQUE_RE, "unique-align"),
            (&*BT_MULTI_RE, "multiple-align"),
        ] {
            if let Some(n) = re.captures(line).and_then(|c| c[1].parse::<u64>().ok()) {
                stats.insert(key.to_string(), n);
            }
        }
    }
    if stats.is_empty() {
        warn!("no alignment statistics found in aligner output");
    }
    stats
}

/// Appends `suffix` to every statistic name.
pub fn suffixed(stats: HashMap<String, u64>, suffix: &str) -> HashMap<String, u64> {
    stats.into_iter().map(|(k, v)| (format!("{}{}", k, suffix), v)).collect()
}

/// Column order: `order` first, then any other statistic in name order.
pub fn stat_columns(snapshot: &StatsSnapshot, order: &[String]) -> Vec<String> {
    let mut extra: Vec<String> = snapshot
        .stats
        .values()
        .flat_map(|s| s.keys())
        .filter(|k| !order.contains(k))
        .cloned()
        .collect();
    extra.sort();
    extra.dedup();
    order.iter().cloned().chain(extra).collect()
}

/// Writes the statistics table, one row per sample in `rows` order; absent values are empty.
pub fn write_statistics_table(path: &Path, snapshot: &StatsSnapshot, rows: &[String], order: &[String]) -> Result<()> {
    let columns = stat_columns(snapshot, order);
    let mut wtr = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    let mut header = vec!["sample".to_string()];
    header.extend(columns.iter().cloned());
    wtr.write_record(&header)?;
    for sample in rows {
        let mut record = vec![sample.clone()];
        record.extend(
            columns
                .iter()
                .map(|c| snapshot.stat(sample, c).map(|v| v.to_string()).unwrap_or_default()),
        );
        wtr.write_record(&record)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Reads a table written by `write_statistics_table` back into per-sample counters.
pub fn read_statistics_table(path: &Path) -> Result<BTreeMap<String, HashMap<String, u64>>> {
    let mut rdr = csv::ReaderBuilder::new().delimiter(b'\t').from_path(path)?;
    let headers = rdr.headers()?.clone();
    let mut out = BTreeMap::new();
    for record in rdr.records() {
        let record = record?;
        let mut fields = record.iter();
        let sample = fields.next().unwrap_or_default().to_string();
        let stats: HashMap<String, u64> = headers
            .iter()
            .skip(1)
            .zip(fields)
            .filter_map(|(k, v)| v.parse().ok().map(|v| (k.to_string(), v)))
            .collect();
        out.insert(sample, stats);
    }
    Ok(out)
}


/// Writes feature counts in long form, one `sample  feature  count` line per count, samples in `rows` order.
pub fn write_counts_table(path: &Path, snapshot: &StatsSnapshot, rows: &[String]) -> Result<()> {
    let mut wtr = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    wtr.write_record(["sample", "feature", "count"])?;
    for sample in rows {
        let Some(counts) = snapshot.counts.get(sample) else { continue };
        for (feature, n) in counts {
            wtr.write_record([sample.as_str(), feature.as_str(), &n.to_string()])?;
        }
    }
    wtr.flush()?;
    Ok(())
}

/// Reads a table written by `write_counts_table`, keeping feature order.
pub fn read_counts_table(path: &Path) -> Result<BTreeMap<String, Vec<(String, u64)>>> {
    let mut rdr = csv::ReaderBuilder::new().delimiter(b'\t').from_path(path)?;
    let mut out: BTreeMap<String, Vec<(String, u64)>> = BTreeMap::new();
    for record in rdr.records() {
        let record = record?;
        let n: u64 = record[2].parse().map_err(|e| anyhow!("bad count '{}' in {}: {}", &record[2], path.display(), e))?;
        out.entry(record[0].to_string()).or_default().push((record[1].to_string(), n));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BT2: &str = "10000 reads; of these:\n\
                       \x20 10000 (100.00%) were unpaired; of these:\n\
                       \x20   1200 (12.00%) aligned 0 times\n\
                       \x20   7000 (70.00%) aligned exactly 1 time\n\
                       \x20   1800 (18.00%) aligned >1 times\n\
                       88.00% overall alignment rate\n";

    #[test]
    fn test_parse_bowtie_stats() {
        let s = parse_bowtie_stats(BT2);
        assert_eq!(s["total"], 10000);
        assert_eq!(s["unaligned"], 1200);
        assert_eq!(s["unique-align"], 7000);
        assert_eq!(s["multiple-align"], 1800);
        let s = suffixed(s, "-spikein");
        assert_eq!(s["total-spikein"], 10000);
    }

    #[tokio::test]
    async fn test_collector_sums_stats_and_overwrites_counts() -> Result<()> {
        let (stats, task) = spawn_collector(Channel::new("statc"), StatsSnapshot::default());
        stats.add_stats("s1", HashMap::from([("n_reads".to_string(), 5)]));
        stats.add_stats("s1", HashMap::from([("n_reads".to_string(), 7)]));
        stats.set_counts("s1", vec![("g1".to_string(), 3)]);
        stats.set_counts("s1", vec![("g1".to_string(), 4), ("g2".to_string(), 0)]);

        let snap = stats.snapshot().await?;
        assert_eq!(snap.stat("s1", "n_reads"), Some(12));
        assert_eq!(snap.counts["s1"], vec![("g1".to_string(), 4), ("g2".to_string(), 0)]);

        stats.shutdown();
        let last = task.await?;
        assert_eq!(last, snap);
        Ok(())
    }

    #[test]
    fn test_statistics_table_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("stats.tsv");
        let mut snap = StatsSnapshot::default();
        snap.apply("wt".to_string(), StatKind::Stats(HashMap::from([("n_reads".to_string(), 10), ("zz".to_string(), 1)])));
        snap.apply("no-barcode".to_string(), StatKind::Stats(HashMap::from([("n_reads".to_string(), 2)])));
        let order = vec!["n_reads".to_string(), "total".to_string()];
        write_statistics_table(&path, &snap, &["wt".to_string(), "no-barcode".to_string()], &order)?;

        let text = std::fs::read_to_string(&path)?;
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("sample\tn_reads\ttotal\tzz"));
        assert_eq!(lines.next(), Some("wt\t10\t\t1"));
        assert_eq!(lines.next(), Some("no-barcode\t2\t\t"));

        let back = read_statistics_table(&path)?;
        assert_eq!(back["wt"]["n_reads"], 10);
        assert!(!back["wt"].contains_key("total"));
        Ok(())
    }

    #[test]
    fn test_counts_table_keeps_feature_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("counts.tsv");
        let mut snap = StatsSnapshot::default();
        snap.apply("wt".to_string(), StatKind::Counts(vec![("YBR".to_string(), 3), ("YAL".to_string(), 0)]));
        write_counts_table(&path, &snap, &["wt".to_string(), "no-barcode".to_string()])?;
        assert_eq!(std::fs::read_to_string(&path)?, "sample\tfeature\tcount\nwt\tYBR\t3\nwt\tYAL\t0\n");
        assert_eq!(read_counts_table(&path)?, snap.counts);
        Ok(())
    }
}
