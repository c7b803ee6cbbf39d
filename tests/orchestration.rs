use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use transeq_pipelines::config::defs::{PipelineError, Stage};
use transeq_pipelines::pipelines::main_handler::{drive_samples, CheckpointSink, SampleRun};
use transeq_pipelines::pipelines::sample_manager::SampleState;
use transeq_pipelines::pipelines::stages::{StageWork, STRAND_KWARG};
use transeq_pipelines::utils::channel::Channel;
use transeq_pipelines::utils::executor::LocalExecutor;
use transeq_pipelines::utils::logging::LogHandle;
use transeq_pipelines::utils::sample::{FeatureValue, Sample};
use transeq_pipelines::utils::work::{work_fn, WorkFn, WorkManager};

type Events = Arc<Mutex<Vec<(String, String, &'static str)>>>;

/// Records when each step starts and ends, by barcode; fails the steps listed in `fail`.
#[derive(Clone, Default)]
struct FakeStages {
    events: Events,
    fail: HashMap<(String, String), String>,
    slow: HashMap<(String, String), Duration>,
    panic_on: Option<(String, String)>,
    step_time: Duration,
}

impl FakeStages {
    fn failing(mut self, sample: &str, step: &str) -> Self {
        self.fail.insert((sample.to_string(), step.to_string()), format!("{} broke", step));
        self
    }

    fn slow(mut self, sample: &str, step: &str, time: Duration) -> Self {
        self.slow.insert((sample.to_string(), step.to_string()), time);
        self
    }

    fn step(&self, sample: &Sample, step: &str) -> WorkFn {
        let events = Arc::clone(&self.events);
        let name = sample.barcode.clone();
        let step = step.to_string();
        let key = (name.clone(), step.clone());
        if self.panic_on.as_ref() == Some(&key) {
            panic!("cannot build {} for {}", step, name);
        }
        let failure = self.fail.get(&key).cloned();
        let step_time = self.slow.get(&key).copied().unwrap_or(self.step_time);
        work_fn(move |_, kwargs| async move {
            let label = match kwargs.get(STRAND_KWARG) {
                Some(strand) => format!("{}:{}", step, strand),
                None => step,
            };
            events.lock().unwrap().push((name.clone(), label.clone(), "start"));
            tokio::time::sleep(step_time).await;
            events.lock().unwrap().push((name.clone(), label.clone(), "end"));
            match failure {
                Some(e) => Err(anyhow!(e)),
                None => Ok(Some(label)),
            }
        })
    }

    fn steps_of(&self, sample: &str) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _, phase)| s == sample && *phase == "start")
            .map(|(_, step, _)| step.clone())
            .collect()
    }
}

impl StageWork for FakeStages {
    fn collect_fastq(&self, sample: &Sample) -> WorkFn {
        self.step(sample, "collect_fastq")
    }

    fn spikein_count(&self, sample: &Sample) -> Option<WorkFn> {
        Some(self.step(sample, "spikein_count"))
    }

    fn align(&self, sample: &Sample) -> WorkFn {
        self.step(sample, "align")
    }

    fn make_track(&self, sample: &Sample) -> WorkFn {
        self.step(sample, "make_track")
    }

    fn count(&self, sample: &Sample) -> WorkFn {
        self.step(sample, "count")
    }
}

/// Records each checkpoint and how many samples had finished collect_fastq at that moment.
#[derive(Default)]
struct RecordingSink {
    stages: Vec<Stage>,
    watch: Events,
    fastq_done: Vec<(Stage, usize)>,
}

impl RecordingSink {
    fn watching(stages: &FakeStages) -> Self {
        RecordingSink { watch: Arc::clone(&stages.events), ..Default::default() }
    }
}

impl CheckpointSink for RecordingSink {
    fn checkpoint<'a>(&'a mut self, stage: Stage) -> BoxFuture<'a, Result<(), PipelineError>> {
        Box::pin(async move {
            self.stages.push(stage);
            let done = self
                .watch
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, step, phase)| step == "collect_fastq" && *phase == "end")
                .count();
            self.fastq_done.push((stage, done));
            Ok(())
        })
    }
}

/// A sample whose name is its two feature values joined by '_'.
fn named(barcode: &str, a: &str, b: &str) -> Sample {
    let mut sample = Sample::new(barcode);
    sample.values = vec![
        ("a".to_string(), FeatureValue::Str(a.to_string())),
        ("b".to_string(), FeatureValue::Str(b.to_string())),
    ];
    sample
}

fn samples(barcodes: &[&str]) -> Vec<Sample> {
    barcodes.iter().map(|b| Sample::new(b)).collect()
}

fn sample_run(stages: &FakeStages, barcodes: &[&str], start_from: Stage, max_workers: usize) -> SampleRun {
    SampleRun {
        samples: samples(barcodes),
        start_from,
        wm: Arc::new(WorkManager::new(Arc::new(LocalExecutor), max_workers, Duration::from_millis(5))),
        stages: Arc::new(stages.clone()),
        log: LogHandle::new(Channel::new("log")),
        token: CancellationToken::new(),
        poll: Duration::from_millis(10),
    }
}

const FULL_RUN: [&str; 6] = ["collect_fastq", "spikein_count", "align", "make_track:w", "make_track:c", "count"];

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_full_run_checkpoints_each_stage_once() -> anyhow::Result<()> {
    let stages = FakeStages { step_time: Duration::from_millis(2), ..Default::default() };
    let mut sink = RecordingSink::default();
    let summary = drive_samples(sample_run(&stages, &["AAAA", "AAAT", "GGGG"], Stage::Begin, 2), &mut sink).await?;

    assert_eq!(sink.stages, vec![Stage::Fastq, Stage::Align, Stage::Count]);
    assert_eq!(summary.completed, Stage::Count);
    assert!(summary.errors.is_empty());
    for (name, state) in &summary.states {
        assert_eq!(*state, SampleState::At(Stage::Count));
        assert_eq!(stages.steps_of(name), FULL_RUN);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_next_step_waits_for_previous_reply() -> anyhow::Result<()> {
    let stages = FakeStages { step_time: Duration::from_millis(5), ..Default::default() }.failing("AAAT", "align");
    let mut sink = RecordingSink::default();
    drive_samples(sample_run(&stages, &["AAAA", "AAAT"], Stage::Begin, 4), &mut sink).await?;

    let events = stages.events.lock().unwrap().clone();
    for sample in ["AAAA", "AAAT"] {
        let phases: Vec<&str> = events.iter().filter(|(s, _, _)| s == sample).map(|(_, _, p)| *p).collect();
        // no step of a sample starts while another of its steps is running
        for pair in phases.chunks(2) {
            assert_eq!(pair, ["start", "end"]);
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_failed_sample_stops_and_blocks_checkpoint() -> anyhow::Result<()> {
    let stages = FakeStages::default().failing("AAAT", "align");
    let mut sink = RecordingSink::default();
    let summary = drive_samples(sample_run(&stages, &["AAAA", "AAAT"], Stage::Begin, 2), &mut sink).await?;

    assert_eq!(sink.stages, vec![Stage::Fastq]);
    assert_eq!(summary.completed, Stage::Fastq);
    assert!(summary.errors["AAAT"].contains("align broke"));
    assert_eq!(stages.steps_of("AAAT"), ["collect_fastq", "spikein_count", "align"]);
    assert_eq!(stages.steps_of("AAAA"), FULL_RUN);
    let states: HashMap<_, _> = summary.states.into_iter().collect();
    assert_eq!(states["AAAT"], SampleState::Error);
    assert_eq!(states["AAAA"], SampleState::At(Stage::Count));
    Ok(())
}

#[tokio::test]
async fn test_spikein_failure_is_not_fatal() -> anyhow::Result<()> {
    let stages = FakeStages::default().failing("GGGG", "spikein_count");
    let mut sink = RecordingSink::default();
    let summary = drive_samples(sample_run(&stages, &["GGGG"], Stage::Begin, 1), &mut sink).await?;
    assert!(summary.errors.is_empty());
    assert_eq!(sink.stages, vec![Stage::Fastq, Stage::Align, Stage::Count]);
    Ok(())
}

#[tokio::test]
async fn test_resume_from_align_runs_only_count() -> anyhow::Result<()> {
    let stages = FakeStages::default();
    let mut sink = RecordingSink::default();
    let summary = drive_samples(sample_run(&stages, &["AAAA", "AAAT", "GGGG"], Stage::Align, 3), &mut sink).await?;

    assert_eq!(sink.stages, vec![Stage::Count]);
    for (name, _) in &summary.states {
        assert_eq!(stages.steps_of(name), ["make_track:w", "make_track:c", "count"]);
    }
    Ok(())
}

#[tokio::test]
async fn test_resume_from_count_runs_nothing() -> anyhow::Result<()> {
    let stages = FakeStages::default();
    let mut sink = RecordingSink::default();
    let summary = drive_samples(sample_run(&stages, &["AAAA"], Stage::Count, 1), &mut sink).await?;
    assert!(sink.stages.is_empty());
    assert!(stages.events.lock().unwrap().is_empty());
    assert_eq!(summary.states[0].1, SampleState::At(Stage::Count));
    Ok(())
}

#[tokio::test]
async fn test_cancellation_stops_the_run() -> anyhow::Result<()> {
    let stages = FakeStages { step_time: Duration::from_millis(300), ..Default::default() };
    let mut sink = RecordingSink::default();
    let run = sample_run(&stages, &["AAAA", "AAAT"], Stage::Begin, 2);
    let token = run.token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });
    let res = drive_samples(run, &mut sink).await;
    assert!(res.is_err());
    assert!(sink.stages.is_empty());
    assert_eq!(stages.steps_of("AAAA"), ["collect_fastq"]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_samples_with_equal_names_are_tracked_by_barcode() -> anyhow::Result<()> {
    let stages = FakeStages::default().slow("CCCC", "collect_fastq", Duration::from_millis(300));
    let mut sink = RecordingSink::watching(&stages);
    let mut run = sample_run(&stages, &[], Stage::Begin, 2);
    run.samples = vec![named("AAAA", "x_y", "z"), named("CCCC", "x", "y_z")];
    assert_eq!(run.samples[0].base_name(), run.samples[1].base_name());

    let summary = drive_samples(run, &mut sink).await?;
    assert_eq!(sink.fastq_done, vec![(Stage::Fastq, 2), (Stage::Align, 2), (Stage::Count, 2)]);
    assert_eq!(summary.states.len(), 2);
    assert_eq!(stages.steps_of("AAAA"), FULL_RUN);
    assert_eq!(stages.steps_of("CCCC"), FULL_RUN);
    Ok(())
}

#[tokio::test]
async fn test_sample_task_dying_silently_is_a_failure() -> anyhow::Result<()> {
    let stages = FakeStages { panic_on: Some(("AAAT".to_string(), "align".to_string())), ..Default::default() };
    let mut sink = RecordingSink::default();
    let run = sample_run(&stages, &["AAAA", "AAAT"], Stage::Begin, 2);
    let summary = tokio::time::timeout(Duration::from_secs(10), drive_samples(run, &mut sink)).await??;

    assert!(summary.errors["AAAT"].contains("without reporting"));
    assert_eq!(sink.stages, vec![Stage::Fastq]);
    let states: HashMap<_, _> = summary.states.into_iter().collect();
    assert_eq!(states["AAAT"], SampleState::Error);
    assert_eq!(states["AAAA"], SampleState::At(Stage::Count));
    Ok(())
}
