// src/pipelines/sample_manager.rs: one task per sample walking it through the stages
use std::fmt;
use std::sync::Arc;

use log::debug;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::defs::{PipelineError, Stage, Strand};
use crate::pipelines::stages::{track_kwargs, StageWork};
use crate::utils::channel::{Channel, ChannelError};
use crate::utils::logging::LogHandle;
use crate::utils::sample::Sample;
use crate::utils::work::{Kwargs, WorkFn, WorkManager, WorkOutcome, WorkResult};

/// What a sample tells the coordinator. Samples are identified by barcode.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleReport {
    Reached { sample: String, stage: Stage },
    Failed { sample: String, stage: Stage, error: String },
}

impl SampleReport {
    pub fn sample(&self) -> &str {
        match self {
            SampleReport::Reached { sample, .. } | SampleReport::Failed { sample, .. } => sample,
        }
    }
}

/// Where a sample ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleState {
    At(Stage),
    Error,
}

impl fmt::Display for SampleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleState::At(stage) => write!(f, "{}", stage),
            SampleState::Error => write!(f, "ERROR"),
        }
    }
}

enum StepFailure {
    Failed(String),
    Cancelled,
}

impl From<PipelineError> for StepFailure {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Channel(ChannelError::Cancelled(_)) => StepFailure::Cancelled,
            other => StepFailure::Failed(other.to_string()),
        }
    }
}

impl From<ChannelError> for StepFailure {
    fn from(e: ChannelError) -> Self {
        PipelineError::from(e).into()
    }
}

pub struct SampleManager {
    sample: Sample,
    name: String,
    start_from: Stage,
    wm: Arc<WorkManager>,
    stages: Arc<dyn StageWork>,
    report: Channel<SampleReport>,
    log: LogHandle,
    token: CancellationToken,
}

impl SampleManager {
    pub fn new(
        sample: Sample,
        start_from: Stage,
        wm: Arc<WorkManager>,
        stages: Arc<dyn StageWork>,
        report: Channel<SampleReport>,
        log: LogHandle,
        token: CancellationToken,
    ) -> Self {
        let name = sample.base_name();
        SampleManager { sample, name, start_from, wm, stages, report, log, token }
    }

    pub fn channel_name(&self) -> String {
        format!("{}.channel", self.sample.barcode)
    }

    pub fn spawn(self) -> JoinHandle<SampleState> {
        tokio::spawn(self.run())
    }

    /// Runs every stage after `start_from`, reporting each one reached. Stops at the first failure.
    pub async fn run(self) -> SampleState {
        let channel = self.wm.get_channel(&self.channel_name());
        let mut state = self.start_from;

        for next in Stage::ALL.into_iter().filter(|s| *s > self.start_from) {
            match self.advance(next, &channel).await {
                Ok(()) => {
                    state = next;
                    self.log.info(format!("{} reached {}", self.name, next));
                    self.report.put(SampleReport::Reached { sample: self.sample.barcode.clone(), stage: next });
                }
                Err(failure) => {
                    let error = match failure {
                        StepFailure::Failed(e) => e,
                        StepFailure::Cancelled => "cancelled".to_string(),
                    };
                    self.log.error(format!("{} failed on its way from {} to {}: {}", self.name, state, next, error));
                    self.report.put(SampleReport::Failed { sample: self.sample.barcode.clone(), stage: next, error });
                    return SampleState::Error;
                }
            }
        }
        SampleState::At(state)
    }

    async fn advance(&self, next: Stage, channel: &Channel<WorkOutcome>) -> Result<(), StepFailure> {
        match next {
            Stage::Begin => Ok(()),
            Stage::Fastq => {
                self.step("collect_fastq", self.stages.collect_fastq(&self.sample), Kwargs::new(), channel).await?;
                Ok(())
            }
            Stage::Align => {
                if let Some(work) = self.stages.spikein_count(&self.sample) {
                    match self.step("spikein_count", work, Kwargs::new(), channel).await {
                        Ok(_) => {}
                        Err(StepFailure::Failed(e)) => {
                            self.log.warn(format!("{}: spike-in count failed, continuing: {}", self.name, e));
                        }
                        Err(StepFailure::Cancelled) => return Err(StepFailure::Cancelled),
                    }
                }
                self.step("align", self.stages.align(&self.sample), Kwargs::new(), channel).await?;
                Ok(())
            }
            Stage::Count => {
                for strand in Strand::BOTH {
                    self.step("make_track", self.stages.make_track(&self.sample), track_kwargs(strand, None), channel)
                        .await?;
                }
                self.step("count", self.stages.count(&self.sample), Kwargs::new(), channel).await?;
                Ok(())
            }
        }
    }

    /// Submits one work item and waits for its outcome on the sample's channel.
    async fn step(
        &self,
        label: &str,
        work: WorkFn,
        kwargs: Kwargs,
        channel: &Channel<WorkOutcome>,
    ) -> Result<WorkResult, StepFailure> {
        if self.token.is_cancelled() {
            return Err(StepFailure::Cancelled);
        }
        debug!("{}: submitting {}", self.name, label);
        self.wm.execute(work, kwargs, channel.name())?;
        let outcome = channel.get_or_cancel(&self.token).await?;
        match outcome.error {
            Some(e) => Err(StepFailure::Failed(format!("{}: {}", label, e))),
            None => {
                if let Some(summary) = &outcome.result {
                    self.log.debug(format!("{} {}: {}", self.name, label, summary));
                }
                Ok(outcome.result)
            }
        }
    }
}
