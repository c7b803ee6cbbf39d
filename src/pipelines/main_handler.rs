// src/pipelines/main_handler.rs: run coordinator, checkpoints, resume and aftermath
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use futures::future::{join_all, BoxFuture};
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::cli::Arguments;
use crate::config::defs::{
    ExecOn, PipelineError, RunConfig, Stage, Strand, ARGS_FILE, COUNTS_FILE, DEFAULT_STAT_ORDER, FILTERED_NAME, FULL_LOG,
    LOG_CHANNEL, NO_BC_NAME, N_READS_STAT, REPORT_CHANNEL, SAMPLE_DB_COPY, STATE_FILE, STATS_FILE, STAT_CHANNEL,
    TMP_NAME, UNALIGNED_NAME,
};
use crate::pipelines::demux::{log_counts, Demultiplexer};
use crate::pipelines::sample_manager::{SampleManager, SampleReport, SampleState};
use crate::pipelines::stages::{self, StageWork, ToolStages};
use crate::utils::channel::{Channel, ChannelError};
use crate::utils::command::check_tools;
use crate::utils::executor::{Executor, LocalExecutor, SlurmExecutor};
use crate::utils::exporters::{exporters_from_string, run_exporters, ExportContext, Exporter};
use crate::utils::file::{collect_input_fastqs, create_dir, next_run_dir};
use crate::utils::filters::FilterScheme;
use crate::utils::logging::{spawn_log_drain, LogHandle, LogMessage};
use crate::utils::sample::{parse_sample_db, Sample, SampleRegistry};
use crate::utils::stats::{
    read_counts_table, read_statistics_table, spawn_collector, write_counts_table, write_statistics_table, StatMessage,
    StatsHandle, StatsSnapshot,
};
use crate::utils::system::{align_threads, current_user, make_group_readable};
use crate::utils::work::WorkManager;

/// Per-stage sets of samples that reached it, plus the failed ones.
#[derive(Debug, Clone)]
pub struct CheckpointTracker {
    samples: BTreeSet<String>,
    reached: BTreeMap<Stage, BTreeSet<String>>,
    errors: BTreeMap<String, String>,
    checkpointed: BTreeSet<Stage>,
}

impl CheckpointTracker {
    /// Stages up to `start_from` count as reached and checkpointed already.
    pub fn new<I: IntoIterator<Item = String>>(samples: I, start_from: Stage) -> Self {
        let samples: BTreeSet<String> = samples.into_iter().collect();
        let mut reached = BTreeMap::new();
        let mut checkpointed = BTreeSet::new();
        for stage in Stage::ALL.into_iter().filter(|s| *s <= start_from) {
            reached.insert(stage, samples.clone());
            checkpointed.insert(stage);
        }
        CheckpointTracker { samples, reached, errors: BTreeMap::new(), checkpointed }
    }

    /// Records a report. Returns the stage to checkpoint, at most once per stage.
    pub fn record(&mut self, report: &SampleReport) -> Option<Stage> {
        match report {
            SampleReport::Failed { sample, error, .. } => {
                self.errors.insert(sample.clone(), error.clone());
                None
            }
            SampleReport::Reached { sample, stage } => {
                let set = self.reached.entry(*stage).or_default();
                set.insert(sample.clone());
                if *set == self.samples && self.checkpointed.insert(*stage) {
                    Some(*stage)
                } else {
                    None
                }
            }
        }
    }

    /// `sample` reached COUNT or failed.
    pub fn is_done(&self, sample: &str) -> bool {
        self.errors.contains_key(sample) || self.reached.get(&Stage::Count).is_some_and(|d| d.contains(sample))
    }

    /// Every sample reached COUNT or failed.
    pub fn is_finished(&self) -> bool {
        self.samples.iter().all(|s| self.is_done(s))
    }

    /// The stage `sample` was working towards.
    pub fn next_stage(&self, sample: &str) -> Stage {
        let last = Stage::ALL
            .into_iter()
            .filter(|s| self.reached.get(s).is_some_and(|r| r.contains(sample)))
            .max()
            .unwrap_or(Stage::Begin);
        Stage::ALL.into_iter().find(|s| *s > last).unwrap_or(last)
    }

    /// Highest stage every sample completed.
    pub fn completed(&self) -> Stage {
        Stage::ALL
            .into_iter()
            .filter(|s| self.checkpointed.contains(s))
            .max()
            .unwrap_or(Stage::Begin)
    }

    pub fn errors(&self) -> &BTreeMap<String, String> {
        &self.errors
    }
}

/// Persists the run state when a stage completes for all samples.
pub trait CheckpointSink: Send {
    fn checkpoint<'a>(&'a mut self, stage: Stage) -> BoxFuture<'a, Result<(), PipelineError>>;
}

/// Everything needed to drive a set of samples through the stages.
pub struct SampleRun {
    pub samples: Vec<Sample>,
    pub start_from: Stage,
    pub wm: Arc<WorkManager>,
    pub stages: Arc<dyn StageWork>,
    pub log: LogHandle,
    pub token: CancellationToken,
    pub poll: Duration,
}

/// Final state of every sample, by barcode.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub states: Vec<(String, SampleState)>,
    pub completed: Stage,
    pub errors: BTreeMap<String, String>,
}

/// Spawns one SampleManager per sample and polls the report channel until all are done.
///
/// Samples are tracked by barcode. A sample task that ends without reporting is recorded as failed.
///
/// # Arguments
///
/// * `run` - samples and the machinery they run on.
/// * `sink` - called once per stage, when every sample has reached it.
///
/// # Returns
/// RunSummary, or Cancelled when the run token fires first.
pub async fn drive_samples(run: SampleRun, sink: &mut dyn CheckpointSink) -> Result<RunSummary, PipelineError> {
    let report: Channel<SampleReport> = Channel::new(REPORT_CHANNEL);
    let barcodes: Vec<String> = run.samples.iter().map(|s| s.barcode.clone()).collect();
    let mut tracker = CheckpointTracker::new(barcodes.clone(), run.start_from);

    let mut handles = Vec::with_capacity(run.samples.len());
    for sample in run.samples {
        let manager = SampleManager::new(
            sample,
            run.start_from,
            Arc::clone(&run.wm),
            Arc::clone(&run.stages),
            report.clone(),
            run.log.clone(),
            run.token.child_token(),
        );
        handles.push(manager.spawn());
    }

    while !tracker.is_finished() {
        if run.token.is_cancelled() {
            break;
        }
        match report.get(Some(run.poll)).await {
            Ok(msg) => record_report(&mut tracker, sink, &msg).await?,
            Err(ChannelError::Timeout(_)) => {
                // a finished task has already put its last report
                while let Some(msg) = report.try_get() {
                    record_report(&mut tracker, sink, &msg).await?;
                }
                for (barcode, handle) in barcodes.iter().zip(&handles) {
                    if handle.is_finished() && !tracker.is_done(barcode) {
                        let stage = tracker.next_stage(barcode);
                        error!("sample {} stopped without reporting on its way to {}", barcode, stage);
                        let lost = SampleReport::Failed {
                            sample: barcode.clone(),
                            stage,
                            error: "sample task ended without reporting".to_string(),
                        };
                        record_report(&mut tracker, sink, &lost).await?;
                    }
                }
            }
            Err(e) => return Err(e.into()),
        }
    }

    let mut states = Vec::with_capacity(barcodes.len());
    for (barcode, res) in barcodes.into_iter().zip(join_all(handles).await) {
        let state = res.unwrap_or_else(|e| {
            error!("sample task {} died: {}", barcode, e);
            SampleState::Error
        });
        states.push((barcode, state));
    }
    run.wm.shutdown().await;

    if run.token.is_cancelled() {
        return Err(ChannelError::Cancelled(REPORT_CHANNEL.to_string()).into());
    }
    Ok(RunSummary { states, completed: tracker.completed(), errors: tracker.errors().clone() })
}

async fn record_report(tracker: &mut CheckpointTracker, sink: &mut dyn CheckpointSink, msg: &SampleReport) -> Result<(), PipelineError> {
    debug!("report: {:?}", msg);
    if let Some(stage) = tracker.record(msg) {
        sink.checkpoint(stage).await?;
    }
    Ok(())
}

/// Resume marker: one line naming the highest completed stage.
pub fn read_state(out_dir: &Path) -> Result<Stage, PipelineError> {
    let path = out_dir.join(STATE_FILE);
    let text = fs::read_to_string(&path)
        .map_err(|e| PipelineError::InvalidConfig(format!("cannot read run state {}: {}", path.display(), e)))?;
    text.trim().parse()
}

pub fn write_state(out_dir: &Path, stage: Stage) -> Result<(), PipelineError> {
    fs::write(out_dir.join(STATE_FILE), format!("{}\n", stage))?;
    Ok(())
}

/// Rewrites the statistics table and the per-feature counts of a run.
pub fn write_run_tables(out_dir: &Path, snapshot: &StatsSnapshot, rows: &[String], stat_order: &[String]) -> anyhow::Result<()> {
    write_statistics_table(&out_dir.join(STATS_FILE), snapshot, rows, stat_order)?;
    write_counts_table(&out_dir.join(COUNTS_FILE), snapshot, rows)?;
    Ok(())
}

/// Statistics and counts of the stages that will not run again.
pub fn earlier_snapshot(out_dir: &Path, start_from: Stage) -> StatsSnapshot {
    let mut snapshot = StatsSnapshot::default();
    if start_from == Stage::Begin {
        return snapshot;
    }
    match read_statistics_table(&out_dir.join(STATS_FILE)) {
        Ok(mut stats) => {
            if start_from < Stage::Align {
                for s in stats.values_mut() {
                    s.retain(|k, _| k == N_READS_STAT);
                }
            }
            snapshot.stats = stats;
        }
        Err(e) => warn!("no statistics from the previous run: {}", e),
    }
    if start_from == Stage::Count {
        match read_counts_table(&out_dir.join(COUNTS_FILE)) {
            Ok(counts) => snapshot.counts = counts,
            Err(e) => warn!("no feature counts from the previous run: {}", e),
        }
    }
    snapshot
}

/// Output folders of a run.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    pub root: PathBuf,
    pub fastq: PathBuf,
    pub bam: PathBuf,
    pub bigwig: PathBuf,
    pub tmp: PathBuf,
    pub filtered: Option<PathBuf>,
    pub unaligned: Option<PathBuf>,
}

impl OutputLayout {
    pub fn new(root: PathBuf, args: &Arguments) -> Self {
        OutputLayout {
            fastq: root.join(&args.fastq_dirname),
            bam: root.join(&args.bam_dirname),
            bigwig: root.join(&args.bigwig_dirname),
            tmp: root.join(TMP_NAME),
            filtered: args.keep_filtered.then(|| root.join(FILTERED_NAME)),
            unaligned: args.keep_unaligned.then(|| root.join(UNALIGNED_NAME)),
            root,
        }
    }

    /// Creates every folder; the tmp folder starts empty.
    pub fn create(&self) -> Result<(), PipelineError> {
        if self.tmp.exists() {
            fs::remove_dir_all(&self.tmp)?;
        }
        for dir in [&self.root, &self.fastq, &self.bam, &self.bigwig, &self.tmp] {
            create_dir(dir)?;
        }
        for dir in [&self.filtered, &self.unaligned].into_iter().flatten() {
            create_dir(dir)?;
        }
        Ok(())
    }

    /// Fills in the logical file map of a sample.
    pub fn assign_files(&self, sample: &mut Sample) {
        let base = sample.base_name();
        let f = &mut sample.files;
        f.insert(stages::TMP_FASTQ.to_string(), self.tmp.join(format!("{}.fastq", base)));
        f.insert(stages::FASTQ.to_string(), self.fastq.join(format!("{}.fastq.gz", base)));
        f.insert(stages::SAM_HDR.to_string(), self.tmp.join(format!("{}.sam_hdr", base)));
        f.insert(stages::UNSORTED_BAM.to_string(), self.tmp.join(format!("{}.unsorted.bam", base)));
        f.insert(stages::UNFILTERED_BAM.to_string(), self.tmp.join(format!("{}.unfiltered.bam", base)));
        f.insert(stages::BAM.to_string(), self.bam.join(format!("{}.bam", base)));
        if let Some(dir) = &self.filtered {
            f.insert(stages::FILTERED_BAM.to_string(), dir.join(format!("{}.bam", base)));
        }
        if let Some(dir) = &self.unaligned {
            f.insert(stages::UNALIGNED_BAM.to_string(), dir.join(format!("{}.bam", base)));
        }
        for strand in Strand::BOTH {
            f.insert(Sample::tmp_bed_key(strand), self.tmp.join(format!("{}.{}.bed", base, strand.tag())));
            f.insert(Sample::track_key(strand), self.bigwig.join(format!("{}.{}.bw", base, strand.tag())));
        }
    }
}

/// Checkpoints of a real run: statistics table, state marker and log copy.
struct RunCheckpointer {
    out_dir: PathBuf,
    stats: StatsHandle,
    rows: Vec<String>,
    stat_order: Vec<String>,
    log_file: Option<PathBuf>,
}

impl RunCheckpointer {
    async fn write_tables(&self) -> Result<StatsSnapshot, PipelineError> {
        let snapshot = self.stats.snapshot().await?;
        write_run_tables(&self.out_dir, &snapshot, &self.rows, &self.stat_order)?;
        Ok(snapshot)
    }

    fn copy_log(&self) {
        if let Some(log) = &self.log_file {
            if let Err(e) = fs::copy(log, self.out_dir.join(FULL_LOG)) {
                warn!("could not copy log file: {}", e);
            }
        }
    }
}

impl CheckpointSink for RunCheckpointer {
    fn checkpoint<'a>(&'a mut self, stage: Stage) -> BoxFuture<'a, Result<(), PipelineError>> {
        Box::pin(async move {
            self.write_tables().await?;
            write_state(&self.out_dir, stage)?;
            info!(
                "All samples reached {}. To continue from here run with --start-from {} --output-dir {}",
                stage,
                stage,
                self.out_dir.display()
            );
            self.copy_log();
            Ok(())
        })
    }
}

pub struct MainHandler {
    config: RunConfig,
    args: Arc<Arguments>,
    token: CancellationToken,
}

impl MainHandler {
    pub fn new(config: RunConfig) -> Self {
        let args = Arc::new(config.args.clone());
        MainHandler { config, args, token: CancellationToken::new() }
    }

    /// Cancelling this token stops every sample at its next wait.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    fn resolve(&self, p: &str) -> PathBuf {
        let path = PathBuf::from(p);
        if path.is_absolute() { path } else { self.config.cwd.join(path) }
    }

    fn stat_order(&self) -> Vec<String> {
        self.args
            .stat_order
            .clone()
            .unwrap_or_else(|| DEFAULT_STAT_ORDER.iter().map(|s| s.to_string()).collect())
    }

    /// Inputs the stages still to run depend on.
    fn check_inputs(&self) -> Result<(), PipelineError> {
        let args = &self.args;
        let mut needed: Vec<(&Option<String>, &str)> = Vec::new();
        if args.start_from < Stage::Align {
            needed.push((&args.bowtie_index, "--bowtie-index"));
        }
        if args.start_from < Stage::Count {
            needed.push((&args.chrom_sizes, "--chrom-sizes"));
            needed.push((&args.tts_file, "--tts-file"));
        }
        for (value, flag) in needed {
            if value.is_none() {
                return Err(PipelineError::InvalidConfig(format!("{} is required", flag)));
            }
        }
        for (value, flag) in [(&args.chrom_sizes, "--chrom-sizes"), (&args.tts_file, "--tts-file")] {
            if let Some(v) = value {
                if args.start_from < Stage::Count && !self.resolve(v).exists() {
                    return Err(PipelineError::InvalidConfig(format!("{} {} does not exist", flag, v)));
                }
            }
        }
        Ok(())
    }

    fn output_root(&self, registry: &SampleRegistry) -> Result<PathBuf, PipelineError> {
        if let Some(out) = &self.args.output_dir {
            return Ok(self.resolve(out));
        }
        let dated = self
            .resolve(&self.args.data_path)
            .join(current_user())
            .join(&registry.experiment)
            .join(chrono::Local::now().format("%d-%m-%y").to_string());
        Ok(next_run_dir(&dated, self.args.debug.is_some())?)
    }

    fn executor(&self, layout: &OutputLayout) -> Arc<dyn Executor> {
        match self.args.exec_on {
            ExecOn::Local => Arc::new(LocalExecutor),
            ExecOn::Slurm => Arc::new(SlurmExecutor::new(
                layout.tmp.clone(),
                self.args.polling_delay(),
                self.args.slurm_args.as_deref(),
            )),
        }
    }

    /// Demultiplexes all input pairs into the tmp folder.
    async fn demultiplex(&self, samples: &[Sample], barcodes: Vec<String>, layout: &OutputLayout, stats: &StatsHandle) -> Result<(), PipelineError> {
        let (folder, prefix) = self
            .args
            .fastq_path_and_prefix()
            .ok_or_else(|| PipelineError::InvalidConfig("no --fastq-prefix given".to_string()))?;
        let inputs = collect_input_fastqs(&self.resolve(&folder.to_string_lossy()), &prefix)?;
        let outputs = samples
            .iter()
            .map(|s| s.file(stages::TMP_FASTQ).cloned())
            .collect::<anyhow::Result<Vec<_>>>()?;
        let no_barcode = self.args.keep_nobarcode.then(|| layout.root.join(format!("{}.fastq.gz", NO_BC_NAME)));
        let max_pairs = self.args.debug.map(|d| d.n_lines / 4);
        let names: Vec<String> = samples.iter().map(Sample::base_name).collect();
        let hamming = self.args.hamming_distance;

        let counts = tokio::task::spawn_blocking(move || {
            let refs: Vec<&str> = barcodes.iter().map(String::as_str).collect();
            Demultiplexer::new(&refs, hamming, outputs, no_barcode, max_pairs)?.run(&inputs)
        })
        .await
        .map_err(|e| PipelineError::Other(anyhow!("demultiplexing aborted: {}", e)))??;

        log_counts(&names, &counts);
        for (i, name) in names.iter().enumerate() {
            stats.add_stats(name, HashMap::from([(N_READS_STAT.to_string(), counts.n_reads(i))]));
        }
        stats.add_stats(NO_BC_NAME, HashMap::from([(N_READS_STAT.to_string(), counts.no_barcode)]));
        Ok(())
    }

    /// Runs the pipeline.
    ///
    /// # Returns
    /// Ok once every sample reached COUNT or failed; failed samples are logged, not returned.
    pub async fn execute(&self) -> Result<(), PipelineError> {
        let started = Instant::now();
        let args = Arc::clone(&self.args);

        let db_path = args
            .sample_db_path()
            .map(|p| self.resolve(&p.to_string_lossy()))
            .ok_or_else(|| PipelineError::InvalidConfig("no sample db given (--sample-db)".to_string()))?;
        let registry = parse_sample_db(&db_path, args.debug.map(|d| d.n_samples))?;
        let filters = FilterScheme::parse(&args.filter)?;
        let exporters = exporters_from_string(&args.exporters)?;
        info!("Filters: {}", filters.describe());
        self.check_inputs()?;
        check_tools(&args).await?;

        let out_dir = self.output_root(&registry)?;
        if args.start_from != Stage::Begin {
            let marker = read_state(&out_dir)?;
            if marker < args.start_from {
                return Err(PipelineError::InvalidConfig(format!(
                    "cannot start from {}: {} only completed {}",
                    args.start_from,
                    out_dir.display(),
                    marker
                )));
            }
            info!("resuming {} after {}", out_dir.display(), args.start_from);
        }
        let layout = OutputLayout::new(out_dir.clone(), &args);
        layout.create()?;
        info!("output folder: {}", out_dir.display());

        let db_copy = out_dir.join(SAMPLE_DB_COPY);
        if !db_copy.exists() {
            fs::copy(&db_path, &db_copy)?;
        }

        let mut samples = registry.samples.clone();
        for sample in samples.iter_mut() {
            layout.assign_files(sample);
        }

        let log_channel: Channel<LogMessage> = Channel::new(LOG_CHANNEL);
        let log = LogHandle::new(log_channel.clone());
        let log_drain = spawn_log_drain(log_channel);
        let (stats, collector) = spawn_collector(Channel::<StatMessage>::new(STAT_CHANNEL), earlier_snapshot(&out_dir, args.start_from));

        let ctrl_c = {
            let token = self.token.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    error!("interrupted, stopping all samples");
                    token.cancel();
                }
            })
        };

        let result = self.run_stages(&registry, samples, &layout, &stats, &log, &exporters).await;

        ctrl_c.abort();
        stats.shutdown();
        log.shutdown();
        if let Err(e) = collector.await {
            warn!("statistics collector failed: {}", e);
        }
        if let Ok(n) = log_drain.await {
            debug!("{} sample log events", n);
        }
        result?;

        if args.debug.is_none() {
            if let Err(e) = fs::remove_dir_all(&layout.tmp) {
                warn!("could not remove {}: {}", layout.tmp.display(), e);
            }
        }
        if let Err(e) = make_group_readable(&out_dir).await {
            warn!("{}", e);
        }
        info!("All done. ({} seconds)", started.elapsed().as_secs());
        if let Some(log_file) = &self.config.log_file {
            fs::copy(log_file, out_dir.join(FULL_LOG))?;
        }
        Ok(())
    }

    async fn run_stages(
        &self,
        registry: &SampleRegistry,
        samples: Vec<Sample>,
        layout: &OutputLayout,
        stats: &StatsHandle,
        log: &LogHandle,
        exporters: &[Box<dyn Exporter>],
    ) -> Result<(), PipelineError> {
        let args = Arc::clone(&self.args);
        let names: Vec<String> = samples.iter().map(Sample::base_name).collect();
        let labels: HashMap<String, String> = samples.iter().map(|s| (s.barcode.clone(), s.base_name())).collect();
        let mut checkpointer = RunCheckpointer {
            out_dir: layout.root.clone(),
            stats: stats.clone(),
            rows: names.iter().cloned().chain(std::iter::once(NO_BC_NAME.to_string())).collect(),
            stat_order: self.stat_order(),
            log_file: self.config.log_file.clone(),
        };

        if args.start_from == Stage::Begin {
            let barcodes = registry.samples.iter().map(|s| s.barcode.clone()).collect();
            self.demultiplex(&samples, barcodes, layout, stats).await?;
        }

        let wm = Arc::new(WorkManager::new(self.executor(layout), args.n_workers, args.polling_delay()));
        let stage_work: Arc<dyn StageWork> = Arc::new(ToolStages::new(
            Arc::clone(&args),
            FilterScheme::parse(&args.filter)?,
            stats.clone(),
            registry.barcode_len,
            align_threads(args.n_threads),
        ));
        let run = SampleRun {
            samples,
            start_from: args.start_from,
            wm,
            stages: stage_work,
            log: log.clone(),
            token: self.token.clone(),
            poll: args.polling_delay(),
        };
        let summary = drive_samples(run, &mut checkpointer).await?;

        for (barcode, err) in &summary.errors {
            let name = labels.get(barcode).map(String::as_str).unwrap_or_default();
            error!("sample {} ({}) failed: {}", name, barcode, err);
        }
        info!(
            "{} of {} samples completed, run state {}",
            summary.states.iter().filter(|(_, s)| *s == SampleState::At(Stage::Count)).count(),
            summary.states.len(),
            summary.completed
        );

        let snapshot = checkpointer.write_tables().await?;
        self.aftermath(&layout.root, registry, &names, &checkpointer.rows, &snapshot, exporters)?;
        Ok(())
    }

    /// Persists the run arguments and runs the exporters.
    fn aftermath(
        &self,
        root: &Path,
        registry: &SampleRegistry,
        names: &[String],
        stat_rows: &[String],
        snapshot: &StatsSnapshot,
        exporters: &[Box<dyn Exporter>],
    ) -> Result<(), PipelineError> {
        let encoded = bincode::serde::encode_to_vec(&*self.args, bincode::config::standard())
            .map_err(|e| PipelineError::Other(anyhow!("cannot encode run arguments: {}", e)))?;
        fs::write(root.join(ARGS_FILE), encoded)?;

        if snapshot.counts.is_empty() && self.args.start_from == Stage::Count {
            warn!("no feature counts to export, keeping the exports of the previous run");
            return Ok(());
        }
        let stat_order = self.stat_order();
        let ctx = ExportContext {
            output_dir: root,
            experiment: &registry.experiment,
            samples: names,
            stat_rows,
            stat_order: &stat_order,
            snapshot,
        };
        let export_path = self.args.export_path.as_ref().map(|p| self.resolve(p));
        run_exporters(exporters, &ctx, export_path.as_deref())?;
        Ok(())
    }
}
