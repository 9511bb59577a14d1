//! Pipeline runner — wires stages together with bounded queues.
//!
//! `N` stages get `N + 1` queues: queue 0 is fed by the caller, queue `N` is
//! drained by the caller, and stage `i` reads queue `i` and writes queue
//! `i + 1`. A stage owns the sender of its output queue, so when the stage
//! returns (or panics) the queue closes and the next stage sees end-of-input.

use std::any::Any;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{PipelineError, StageError};
use crate::pipeline::queue::{self, QueueReceiver, QueueSender};

/// One step of the pipeline.
///
/// `run` reads `input` until it is closed and writes derived items to
/// `output`. Dropping `output` on return is what closes the next queue.
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    async fn run(
        &self,
        input: QueueReceiver<Self::Input>,
        output: QueueSender<Self::Output>,
        cancel: CancellationToken,
    ) -> Result<(), StageError>;
}

type Launch = Box<dyn FnOnce(CancellationToken) -> JoinHandle<Result<(), StageError>> + Send>;

struct PendingStage {
    name: &'static str,
    launch: Launch,
}

/// Builds a typed chain of stages. Each `.stage()` call must accept what the
/// previous stage produces.
pub struct PipelineBuilder<In, Out> {
    capacity: usize,
    input: QueueSender<In>,
    tail: QueueReceiver<Out>,
    stages: Vec<PendingStage>,
}

impl<T: Send + 'static> PipelineBuilder<T, T> {
    /// Start a pipeline whose queues each buffer `capacity` items.
    pub fn new(capacity: usize) -> Self {
        let (input, tail) = queue::bounded(capacity);
        Self {
            capacity,
            input,
            tail,
            stages: Vec::new(),
        }
    }
}

impl<In: Send + 'static, Out: Send + 'static> PipelineBuilder<In, Out> {
    /// Append a stage reading this pipeline's current output.
    pub fn stage<S>(self, stage: S) -> PipelineBuilder<In, S::Output>
    where
        S: Stage<Input = Out>,
    {
        let (tx, rx) = queue::bounded(self.capacity);
        let upstream = self.tail;
        let name = stage.name();

        let launch: Launch = Box::new(move |cancel| {
            tokio::spawn(async move { stage.run(upstream, tx, cancel).await })
        });

        let mut stages = self.stages;
        stages.push(PendingStage { name, launch });

        PipelineBuilder {
            capacity: self.capacity,
            input: self.input,
            tail: rx,
            stages,
        }
    }

    /// Split into the caller-owned input sender, the runnable pipeline and
    /// the caller-owned output receiver.
    pub fn build(self) -> (QueueSender<In>, Pipeline, QueueReceiver<Out>) {
        let pipeline = Pipeline {
            stages: self.stages,
            cancel: CancellationToken::new(),
        };
        (self.input, pipeline, self.tail)
    }

    /// Run the pipeline over `items`: feed and close queue 0, drain queue `N`
    /// and return everything that came out.
    pub async fn collect<I>(self, items: I) -> Result<Vec<Out>, PipelineError>
    where
        I: IntoIterator<Item = In>,
    {
        let (input, pipeline, output) = self.build();
        let cancel = pipeline.cancel_token();

        let feed = async move {
            for item in items {
                if input.send_until(item, &cancel).await.is_err() {
                    return Err(PipelineError::InputClosed);
                }
            }
            Ok(())
        };

        let drain = async move {
            let mut out = Vec::new();
            while let Some(item) = output.recv().await {
                out.push(item);
            }
            out
        };

        let (fed, ran, collected) = tokio::join!(feed, pipeline.run(), drain);
        // A dead pipeline also closes the input; report why it died.
        ran?;
        fed?;
        Ok(collected)
    }
}

/// A built pipeline, ready to run.
pub struct Pipeline {
    stages: Vec<PendingStage>,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Token that aborts the run when cancelled. Every blocking wait inside
    /// the stages observes it.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run every stage concurrently and wait for all of them.
    ///
    /// A stage that panics or returns an error cancels its siblings; the first
    /// panic (or else the first root-cause failure) is returned once every
    /// stage has stopped.
    pub async fn run(self) -> Result<(), PipelineError> {
        if self.stages.is_empty() {
            return Ok(());
        }

        let start = Instant::now();
        let run_token = self.cancel.child_token();
        // Dropping this future mid-run must still stop the stage tasks.
        let _guard = run_token.clone().drop_guard();

        info!(stages = self.stages.len(), "Pipeline started");

        let mut running = JoinSet::new();
        for (index, pending) in self.stages.into_iter().enumerate() {
            let PendingStage { name, launch } = pending;
            let handle = launch(run_token.clone());
            let token = run_token.clone();

            running.spawn(async move {
                let outcome = supervise(name, handle).await;
                if outcome.is_err() {
                    token.cancel();
                }
                (index, outcome)
            });
        }

        let mut failures: Vec<(usize, PipelineError)> = Vec::new();
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((index, Err(e))) => failures.push((index, e)),
                Err(e) => failures.push((
                    usize::MAX,
                    PipelineError::StagePanicked {
                        stage: "supervisor".to_string(),
                        reason: e.to_string(),
                    },
                )),
            }
        }

        let elapsed_ms = saturating_millis(start.elapsed());
        match pick_failure(failures, self.cancel.is_cancelled()) {
            None => {
                info!(elapsed_ms, "Pipeline finished");
                Ok(())
            }
            Some(e) => {
                error!(error = %e, elapsed_ms, "Pipeline aborted");
                Err(e)
            }
        }
    }
}

fn saturating_millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// Await one stage task and translate its exit into a pipeline outcome.
async fn supervise(
    name: &'static str,
    handle: JoinHandle<Result<(), StageError>>,
) -> Result<(), PipelineError> {
    debug!(stage = name, "Stage started");
    match handle.await {
        Ok(Ok(())) => {
            debug!(stage = name, "Stage finished");
            Ok(())
        }
        Ok(Err(source)) => {
            debug!(stage = name, error = %source, "Stage stopped early");
            Err(PipelineError::StageFailed {
                stage: name.to_string(),
                source,
            })
        }
        Err(e) if e.is_panic() => {
            let reason = panic_message(e.into_panic());
            error!(stage = name, reason = %reason, "Stage panicked");
            Err(PipelineError::StagePanicked {
                stage: name.to_string(),
                reason,
            })
        }
        Err(e) => Err(PipelineError::StagePanicked {
            stage: name.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Choose the error that explains the run. Panics win; then caller
/// cancellation; then the earliest-positioned stage that failed for a reason
/// other than being cancelled by a sibling.
fn pick_failure(
    mut failures: Vec<(usize, PipelineError)>,
    cancelled_by_caller: bool,
) -> Option<PipelineError> {
    if failures.is_empty() {
        return cancelled_by_caller.then_some(PipelineError::Cancelled);
    }
    failures.sort_by_key(|(index, _)| *index);

    if let Some(pos) = failures
        .iter()
        .position(|(_, e)| matches!(e, PipelineError::StagePanicked { .. }))
    {
        return Some(failures.swap_remove(pos).1);
    }
    if cancelled_by_caller {
        return Some(PipelineError::Cancelled);
    }
    let pos = failures
        .iter()
        .position(|(_, e)| {
            !matches!(
                e,
                PipelineError::StageFailed {
                    source: StageError::Cancelled,
                    ..
                }
            )
        })
        .unwrap_or(0);
    Some(failures.swap_remove(pos).1)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
