//! `CheckSpam` — a fixed pool of workers classifying messages.
//!
//! Workers compete for items on the shared input queue; whichever is free
//! takes the next message. Output order is therefore arbitrary.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::queue::{QueueReceiver, QueueSender};
use super::runner::Stage;
use super::types::{ClassifiedMessage, MessageId};
use super::{call_external, join_pool};
use crate::error::StageError;
use crate::services::SpamClassifier;

const STAGE: &str = "check_spam";

pub struct CheckSpam {
    classifier: Arc<dyn SpamClassifier>,
    workers: usize,
    call_timeout: Option<Duration>,
}

impl CheckSpam {
    /// `workers` is clamped to at least 1.
    pub fn new(
        classifier: Arc<dyn SpamClassifier>,
        workers: usize,
        call_timeout: Option<Duration>,
    ) -> Self {
        Self {
            classifier,
            workers: workers.max(1),
            call_timeout,
        }
    }
}

#[async_trait]
impl Stage for CheckSpam {
    type Input = MessageId;
    type Output = ClassifiedMessage;

    fn name(&self) -> &'static str {
        STAGE
    }

    async fn run(
        &self,
        input: QueueReceiver<MessageId>,
        output: QueueSender<ClassifiedMessage>,
        cancel: CancellationToken,
    ) -> Result<(), StageError> {
        let mut pool = JoinSet::new();
        for worker in 0..self.workers {
            pool.spawn(classify_loop(
                worker,
                Arc::clone(&self.classifier),
                input.clone(),
                output.clone(),
                cancel.clone(),
                self.call_timeout,
            ));
        }
        drop(input);
        drop(output);

        join_pool(pool).await?;
        info!(stage = STAGE, workers = self.workers, "Spam check finished");
        Ok(())
    }
}

async fn classify_loop(
    worker: usize,
    classifier: Arc<dyn SpamClassifier>,
    input: QueueReceiver<MessageId>,
    output: QueueSender<ClassifiedMessage>,
    cancel: CancellationToken,
    call_timeout: Option<Duration>,
) -> Result<(), StageError> {
    while let Some(id) = input.recv_until(&cancel).await? {
        let verdict = call_external(
            "spam-classifier",
            call_timeout,
            &cancel,
            classifier.has_spam(id),
        )
        .await?;

        match verdict {
            Ok(is_spam) => {
                output
                    .send_until(ClassifiedMessage { id, is_spam }, &cancel)
                    .await?;
            }
            Err(e) => {
                warn!(
                    stage = STAGE,
                    worker,
                    message_id = %id,
                    error = %e,
                    "Dropping message, classification failed"
                );
            }
        }
    }
    Ok(())
}
