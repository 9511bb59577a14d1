//! `SelectMessages` — group users into batches and fetch their message ids.
//!
//! The stage task is the only owner of the batch buffer, so filling and
//! swapping it needs no lock. Every full batch is handed to its own fetch
//! task; a short trailing batch is flushed once the input closes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::queue::{QueueReceiver, QueueSender};
use super::runner::Stage;
use super::types::{MessageId, User};
use super::{call_external, join_pool};
use crate::error::StageError;
use crate::services::MessageStore;

const STAGE: &str = "select_messages";

/// Fixed-size batch accumulator.
///
/// Every batch handed out holds between 1 and `max` items; only the one
/// returned by [`flush`](Self::flush) may be short.
#[derive(Debug)]
pub struct Batcher<T> {
    max: usize,
    buffer: Vec<T>,
}

impl<T> Batcher<T> {
    /// `max` is clamped to at least 1.
    pub fn new(max: usize) -> Self {
        let max = max.max(1);
        Self {
            max,
            buffer: Vec::with_capacity(max),
        }
    }

    /// Add an item. Returns the batch if this item filled it.
    pub fn push(&mut self, item: T) -> Option<Vec<T>> {
        self.buffer.push(item);
        if self.buffer.len() < self.max {
            return None;
        }
        Some(std::mem::replace(
            &mut self.buffer,
            Vec::with_capacity(self.max),
        ))
    }

    /// Take whatever is buffered, if anything.
    pub fn flush(&mut self) -> Option<Vec<T>> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

pub struct SelectMessages {
    store: Arc<dyn MessageStore>,
    max_batch_size: usize,
    call_timeout: Option<Duration>,
}

impl SelectMessages {
    pub fn new(
        store: Arc<dyn MessageStore>,
        max_batch_size: usize,
        call_timeout: Option<Duration>,
    ) -> Self {
        Self {
            store,
            max_batch_size: max_batch_size.max(1),
            call_timeout,
        }
    }

    fn dispatch(
        &self,
        fetches: &mut JoinSet<Result<(), StageError>>,
        batch: Vec<User>,
        output: &QueueSender<MessageId>,
        cancel: &CancellationToken,
    ) {
        debug!(stage = STAGE, batch_size = batch.len(), "Dispatching batch");
        fetches.spawn(fetch_and_forward(
            Arc::clone(&self.store),
            batch,
            output.clone(),
            cancel.clone(),
            self.call_timeout,
        ));
    }
}

#[async_trait]
impl Stage for SelectMessages {
    type Input = User;
    type Output = MessageId;

    fn name(&self) -> &'static str {
        STAGE
    }

    async fn run(
        &self,
        input: QueueReceiver<User>,
        output: QueueSender<MessageId>,
        cancel: CancellationToken,
    ) -> Result<(), StageError> {
        let mut batcher = Batcher::new(self.max_batch_size);
        let mut fetches = JoinSet::new();
        let mut batches = 0usize;

        while let Some(user) = input.recv_until(&cancel).await? {
            if let Some(batch) = batcher.push(user) {
                self.dispatch(&mut fetches, batch, &output, &cancel);
                batches += 1;
            }
        }

        if let Some(batch) = batcher.flush() {
            self.dispatch(&mut fetches, batch, &output, &cancel);
            batches += 1;
        }
        drop(output);

        join_pool(fetches).await?;

        info!(stage = STAGE, batches, "Messages selected");
        Ok(())
    }
}

async fn fetch_and_forward(
    store: Arc<dyn MessageStore>,
    batch: Vec<User>,
    output: QueueSender<MessageId>,
    cancel: CancellationToken,
    call_timeout: Option<Duration>,
) -> Result<(), StageError> {
    let fetched = call_external(
        "message-store",
        call_timeout,
        &cancel,
        store.fetch_messages(&batch),
    )
    .await?;

    let ids = match fetched {
        Ok(ids) => ids,
        Err(e) => {
            let user_ids: Vec<u64> = batch.iter().map(|u| u.id).collect();
            warn!(
                stage = STAGE,
                batch_size = batch.len(),
                user_ids = ?user_ids,
                error = %e,
                "Dropping batch, fetch failed"
            );
            return Ok(());
        }
    };

    for id in ids {
        output.send_until(id, &cancel).await?;
    }
    Ok(())
}
