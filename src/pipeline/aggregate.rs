//! `CombineResults` — restore a deterministic order and format output lines.
//!
//! Nothing is emitted until the input is exhausted.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::queue::{QueueReceiver, QueueSender};
use super::runner::Stage;
use super::types::ClassifiedMessage;
use crate::error::StageError;

const STAGE: &str = "combine_results";

pub struct CombineResults;

/// Spam first, then ascending id. Stable.
pub fn sort_results(results: &mut [ClassifiedMessage]) {
    results.sort_by_key(|m| (!m.is_spam, m.id));
}

#[async_trait]
impl Stage for CombineResults {
    type Input = ClassifiedMessage;
    type Output = String;

    fn name(&self) -> &'static str {
        STAGE
    }

    async fn run(
        &self,
        input: QueueReceiver<ClassifiedMessage>,
        output: QueueSender<String>,
        cancel: CancellationToken,
    ) -> Result<(), StageError> {
        let mut results = Vec::new();
        while let Some(message) = input.recv_until(&cancel).await? {
            results.push(message);
        }

        sort_results(&mut results);
        let spam = results.iter().filter(|m| m.is_spam).count();
        info!(stage = STAGE, total = results.len(), spam, "Results combined");

        for message in &results {
            output.send_until(message.to_line(), &cancel).await?;
        }
        Ok(())
    }
}
