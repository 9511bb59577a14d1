//! Staged spam-check pipeline.
//!
//! Raw identifiers flow through four stages connected by bounded queues:
//! 1. `SelectUsers` — resolve identifiers, forward each distinct user once
//! 2. `SelectMessages` — batch users and fetch their message ids
//! 3. `CheckSpam` — fixed worker pool classifying each message
//! 4. `CombineResults` — drain, sort spam-first then by id, format lines
//!
//! Failed lookups drop the affected items and never stop the run.

pub mod aggregate;
pub mod batching;
pub mod dedup;
pub mod queue;
pub mod runner;
pub mod types;
pub mod worker_pool;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::error::{ServiceError, StageError};
use crate::services::{MessageStore, SpamClassifier, UserDirectory};

pub use aggregate::CombineResults;
pub use batching::{Batcher, SelectMessages};
pub use dedup::SelectUsers;
pub use queue::{QueueClosed, QueueReceiver, QueueSender, bounded};
pub use runner::{Pipeline, PipelineBuilder, Stage};
pub use types::{ClassifiedMessage, MessageId, User};
pub use worker_pool::CheckSpam;

/// Assemble the standard four-stage pipeline from `config` and the three
/// collaborators.
pub fn spam_pipeline(
    config: &PipelineConfig,
    users: Arc<dyn UserDirectory>,
    messages: Arc<dyn MessageStore>,
    classifier: Arc<dyn SpamClassifier>,
) -> PipelineBuilder<String, String> {
    PipelineBuilder::new(config.queue_capacity)
        .stage(SelectUsers::new(
            users,
            config.resolver_workers,
            config.call_timeout,
        ))
        .stage(SelectMessages::new(
            messages,
            config.max_batch_size,
            config.call_timeout,
        ))
        .stage(CheckSpam::new(
            classifier,
            config.worker_count,
            config.call_timeout,
        ))
        .stage(CombineResults)
}

/// Await an external call, bounded by the optional per-call timeout and by
/// cancellation of the run.
///
/// The outer `Err` stops the stage; the inner one is a failed call that the
/// stage logs and drops.
pub(crate) async fn call_external<T, F>(
    service: &str,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
    call: F,
) -> Result<Result<T, ServiceError>, StageError>
where
    F: Future<Output = Result<T, ServiceError>>,
{
    let bounded = async {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .unwrap_or_else(|_| {
                    Err(ServiceError::Timeout {
                        service: service.to_string(),
                        timeout: limit,
                    })
                }),
            None => call.await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StageError::Cancelled),
        result = bounded => Ok(result),
    }
}

/// Wait for every task in a stage's pool.
///
/// A panicking task is re-raised so the runner reports the stage as panicked;
/// otherwise the first error any task returned wins.
pub(crate) async fn join_pool(mut pool: JoinSet<Result<(), StageError>>) -> Result<(), StageError> {
    let mut outcome = Ok(());
    while let Some(joined) = pool.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => {
                if outcome.is_ok() {
                    outcome = Err(StageError::Cancelled);
                }
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn call_external_times_out() {
        let cancel = CancellationToken::new();
        let result = call_external(
            "slow",
            Some(Duration::from_millis(10)),
            &cancel,
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, ServiceError>(1)
            },
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(ServiceError::Timeout { .. })));
    }

    #[tokio::test]
    async fn call_external_observes_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = call_external("any", None, &cancel, async {
            Ok::<_, ServiceError>(1)
        })
        .await;
        assert_eq!(result, Err(StageError::Cancelled));
    }

    #[tokio::test]
    async fn join_pool_keeps_first_error() {
        let mut pool = JoinSet::new();
        pool.spawn(async { Ok(()) });
        pool.spawn(async { Err(StageError::Disconnected) });
        assert_eq!(join_pool(pool).await, Err(StageError::Disconnected));
    }

    #[tokio::test]
    async fn call_external_passes_results_through() {
        let cancel = CancellationToken::new();
        let ok = call_external("any", None, &cancel, async { Ok::<_, ServiceError>(7) }).await;
        assert_eq!(ok, Ok(Ok(7)));
    }
}
