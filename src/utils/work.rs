// src/utils/work.rs: bounded dispatch of stage work onto named channels
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use futures::future::{join_all, BoxFuture};
use log::{debug, warn};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::config::defs::PipelineError;
use crate::utils::channel::{Channel, ChannelRegistry};
use crate::utils::executor::Executor;

/// Keyword arguments handed to a work function.
pub type Kwargs = HashMap<String, String>;

/// What a work function returns on success: an optional human-readable summary.
pub type WorkResult = Option<String>;

/// Everything a running work item may use.
#[derive(Clone)]
pub struct WorkContext {
    pub executor: Arc<dyn Executor>,
}

pub type WorkFn = Box<dyn FnOnce(WorkContext, Kwargs) -> BoxFuture<'static, anyhow::Result<WorkResult>> + Send>;

/// Boxes an async closure into a `WorkFn`.
pub fn work_fn<F, Fut>(f: F) -> WorkFn
where
    F: FnOnce(WorkContext, Kwargs) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<WorkResult>> + Send + 'static,
{
    Box::new(move |ctx, kwargs| Box::pin(f(ctx, kwargs)))
}

/// The `(result, error)` pair posted back on the item's channel.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkOutcome {
    pub result: WorkResult,
    pub error: Option<String>,
}

impl WorkOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// A deferred unit of work and the channel its outcome goes to.
pub struct WorkItem {
    pub work: WorkFn,
    pub kwargs: Kwargs,
    pub channel: Channel<WorkOutcome>,
}

/// Runs work items on an `Executor`, never more than `max_workers` at a time.
pub struct WorkManager {
    executor: Arc<dyn Executor>,
    channels: ChannelRegistry<WorkOutcome>,
    slots: Arc<Semaphore>,
    max_workers: usize,
    delay: Duration,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkManager {
    pub fn new(executor: Arc<dyn Executor>, max_workers: usize, delay: Duration) -> Self {
        let max_workers = max_workers.max(1);
        debug!("WorkManager: {} executor, {} workers", executor.name(), max_workers);
        WorkManager {
            executor,
            channels: ChannelRegistry::new(),
            slots: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            delay,
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn get_channel(&self, name: &str) -> Channel<WorkOutcome> {
        self.channels.get_or_create(name)
    }

    pub fn executor_name(&self) -> &'static str {
        self.executor.name()
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Items currently holding a worker slot.
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously running items seen so far.
    pub fn peak_workers(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Queues `work` and returns at once. The `(result, error)` outcome is posted on
    /// `channel_name`, which must already exist.
    pub fn execute(&self, work: WorkFn, kwargs: Kwargs, channel_name: &str) -> Result<(), PipelineError> {
        let channel = self
            .channels
            .get(channel_name)
            .ok_or_else(|| PipelineError::UnknownChannel(channel_name.to_string()))?;
        self.submit(WorkItem { work, kwargs, channel });
        Ok(())
    }

    fn submit(&self, item: WorkItem) {
        let slots = Arc::clone(&self.slots);
        let active = Arc::clone(&self.active);
        let peak = Arc::clone(&self.peak);
        let ctx = WorkContext { executor: Arc::clone(&self.executor) };

        let handle = tokio::spawn(async move {
            let WorkItem { work, kwargs, channel } = item;
            let _permit = match slots.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    channel.put(WorkOutcome { result: None, error: Some("worker pool is shut down".to_string()) });
                    return;
                }
            };
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);

            // A panicking work function must still produce an outcome.
            let outcome = match tokio::spawn(work(ctx, kwargs)).await {
                Ok(Ok(result)) => WorkOutcome { result, error: None },
                Ok(Err(e)) => WorkOutcome { result: None, error: Some(format!("{:#}", e)) },
                Err(join_err) => WorkOutcome {
                    result: None,
                    error: Some(format!("{:#}", anyhow!("work item aborted: {}", join_err))),
                },
            };
            active.fetch_sub(1, Ordering::SeqCst);
            channel.put(outcome);
        });

        let mut handles = self.handles.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Stops handing out slots and waits for running items to post their outcomes.
    pub async fn shutdown(&self) {
        self.slots.close();
        let handles: Vec<JoinHandle<()>> = {
            let mut handles = self.handles.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            handles.drain(..).collect()
        };
        for res in join_all(handles).await {
            if let Err(e) = res {
                warn!("work item task failed during shutdown: {}", e);
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::executor::{LocalExecutor, ShellJob};
    use tokio::time::sleep;

    fn manager(max_workers: usize) -> WorkManager {
        WorkManager::new(Arc::new(LocalExecutor), max_workers, Duration::from_millis(10))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_max_workers_bound() -> anyhow::Result<()> {
        let wm = manager(3);
        let c = wm.get_channel("load");
        let running = Arc::new(AtomicUsize::new(0));
        let observed = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            let running = Arc::clone(&running);
            let observed = Arc::clone(&observed);
            wm.execute(
                work_fn(move |_, _| async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    observed.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(15)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(None)
                }),
                Kwargs::new(),
                "load",
            )?;
        }
        for _ in 0..20 {
            assert!(c.get(Some(Duration::from_secs(10))).await?.is_ok());
        }
        assert!(observed.load(Ordering::SeqCst) <= 3);
        assert!(wm.peak_workers() <= 3);
        assert!(wm.peak_workers() >= 1);
        assert_eq!(wm.active_workers(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_error_is_posted_with_none_result() -> anyhow::Result<()> {
        let wm = manager(2);
        let c = wm.get_channel("s.channel");
        wm.execute(work_fn(|_, _| async { Err(anyhow!("tool exploded")) }), Kwargs::new(), "s.channel")?;
        let outcome = c.get(Some(Duration::from_secs(5))).await?;
        assert_eq!(outcome.result, None);
        assert_eq!(outcome.error.as_deref(), Some("tool exploded"));
        Ok(())
    }

    #[tokio::test]
    #[allow(unreachable_code)]
    async fn test_panic_is_reported() -> anyhow::Result<()> {
        let wm = manager(1);
        let c = wm.get_channel("p");
        wm.execute(
            work_fn(|_, _| async {
                panic!("boom");
                Ok(None)
            }),
            Kwargs::new(),
            "p",
        )?;
        let outcome = c.get(Some(Duration::from_secs(5))).await?;
        assert!(outcome.error.unwrap().contains("work item aborted"));
        // The slot is released after the panic.
        wm.execute(work_fn(|_, _| async { Ok(Some("fine".to_string())) }), Kwargs::new(), "p")?;
        assert_eq!(c.get(Some(Duration::from_secs(5))).await?.result.as_deref(), Some("fine"));
        Ok(())
    }

    #[tokio::test]
    async fn test_kwargs_and_executor_reach_work() -> anyhow::Result<()> {
        let wm = manager(2);
        let c = wm.get_channel("kw");
        let mut kwargs = Kwargs::new();
        kwargs.insert("strand".to_string(), "w".to_string());
        wm.execute(
            work_fn(|ctx, kwargs| async move {
                let strand = kwargs.get("strand").cloned().unwrap_or_default();
                let out = ctx.executor.run(&ShellJob::new("echo", format!("echo {}", strand))).await?;
                Ok(out.stdout_lines().next().map(str::to_string))
            }),
            kwargs,
            "kw",
        )?;
        assert_eq!(c.get(Some(Duration::from_secs(5))).await?.result.as_deref(), Some("w"));
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_channel_is_rejected() {
        let wm = manager(1);
        let res = wm.execute(work_fn(|_, _| async { Ok(None) }), Kwargs::new(), "nobody");
        assert!(matches!(res, Err(PipelineError::UnknownChannel(_))));
    }
}
