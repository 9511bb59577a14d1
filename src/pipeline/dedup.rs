//! `SelectUsers` — resolve raw identifiers and forward each distinct user once.
//!
//! A fixed pool of resolver tasks shares the input queue. After a lookup the
//! task checks-and-marks the user id in one critical section; only the task
//! that inserted the id forwards the user, so concurrent resolutions of the
//! same user can never produce two copies.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::queue::{QueueReceiver, QueueSender};
use super::runner::Stage;
use super::types::User;
use super::{call_external, join_pool};
use crate::error::StageError;
use crate::services::UserDirectory;

const STAGE: &str = "select_users";

pub struct SelectUsers {
    directory: Arc<dyn UserDirectory>,
    workers: usize,
    call_timeout: Option<Duration>,
}

impl SelectUsers {
    /// `workers` is clamped to at least 1.
    pub fn new(
        directory: Arc<dyn UserDirectory>,
        workers: usize,
        call_timeout: Option<Duration>,
    ) -> Self {
        Self {
            directory,
            workers: workers.max(1),
            call_timeout,
        }
    }
}

#[async_trait]
impl Stage for SelectUsers {
    type Input = String;
    type Output = User;

    fn name(&self) -> &'static str {
        STAGE
    }

    async fn run(
        &self,
        input: QueueReceiver<String>,
        output: QueueSender<User>,
        cancel: CancellationToken,
    ) -> Result<(), StageError> {
        let seen = Arc::new(Mutex::new(HashSet::new()));

        let mut pool = JoinSet::new();
        for worker in 0..self.workers {
            pool.spawn(resolve_loop(
                worker,
                Arc::clone(&self.directory),
                Arc::clone(&seen),
                input.clone(),
                output.clone(),
                cancel.clone(),
                self.call_timeout,
            ));
        }
        drop(input);
        drop(output);

        join_pool(pool).await?;

        let unique_users = seen.lock().await.len();
        info!(stage = STAGE, unique_users, "Users selected");
        Ok(())
    }
}

async fn resolve_loop(
    worker: usize,
    directory: Arc<dyn UserDirectory>,
    seen: Arc<Mutex<HashSet<u64>>>,
    input: QueueReceiver<String>,
    output: QueueSender<User>,
    cancel: CancellationToken,
    call_timeout: Option<Duration>,
) -> Result<(), StageError> {
    while let Some(identifier) = input.recv_until(&cancel).await? {
        let resolved = call_external(
            "user-directory",
            call_timeout,
            &cancel,
            directory.resolve_user(&identifier),
        )
        .await?;

        let user = match resolved {
            Ok(user) => user,
            Err(e) => {
                warn!(
                    stage = STAGE,
                    worker,
                    identifier = %identifier,
                    error = %e,
                    "Dropping identifier, resolve failed"
                );
                continue;
            }
        };

        if !seen.lock().await.insert(user.id) {
            debug!(stage = STAGE, worker, user_id = user.id, "Duplicate user suppressed");
            continue;
        }

        output.send_until(user, &cancel).await?;
    }
    Ok(())
}
