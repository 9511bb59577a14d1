//! End-to-end tests for the four-stage spam pipeline.
//!
//! Every run is wrapped in a timeout so a deadlock fails the test instead of
//! hanging the suite.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use spam_pipeline::config::PipelineConfig;
use spam_pipeline::error::{PipelineError, ServiceError, StageError};
use spam_pipeline::pipeline::{
    MessageId, PipelineBuilder, QueueReceiver, QueueSender, Stage, User, spam_pipeline,
};
use spam_pipeline::services::{
    MessageStore, SimulatedConfig, SimulatedServices, SpamClassifier, UserDirectory,
};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// The worked example: a→1, b→2, c→3; user n owns message n*100; only 200
/// is spam.
struct ExampleServices {
    users: HashMap<&'static str, u64>,
}

impl ExampleServices {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            users: HashMap::from([("a", 1), ("b", 2), ("c", 3)]),
        })
    }
}

#[async_trait]
impl UserDirectory for ExampleServices {
    async fn resolve_user(&self, identifier: &str) -> Result<User, ServiceError> {
        tokio::task::yield_now().await;
        self.users
            .get(identifier)
            .map(|id| User::new(*id, format!("{identifier}@example.com")))
            .ok_or_else(|| ServiceError::NotFound {
                entity: "user".into(),
                id: identifier.into(),
            })
    }
}

#[async_trait]
impl MessageStore for ExampleServices {
    async fn fetch_messages(&self, users: &[User]) -> Result<Vec<MessageId>, ServiceError> {
        tokio::task::yield_now().await;
        Ok(users.iter().map(|u| MessageId(u.id * 100)).collect())
    }
}

#[async_trait]
impl SpamClassifier for ExampleServices {
    async fn has_spam(&self, id: MessageId) -> Result<bool, ServiceError> {
        tokio::task::yield_now().await;
        Ok(id == MessageId(200))
    }
}

fn config(queue_capacity: usize) -> PipelineConfig {
    PipelineConfig {
        queue_capacity,
        max_batch_size: 2,
        worker_count: 5,
        resolver_workers: 4,
        call_timeout: None,
    }
}

async fn run_example(config: &PipelineConfig, identifiers: &[&str]) -> Vec<String> {
    let services = ExampleServices::new();
    let builder = spam_pipeline(config, services.clone(), services.clone(), services);
    let items: Vec<String> = identifiers.iter().map(|s| s.to_string()).collect();
    timeout(TEST_TIMEOUT, builder.collect(items))
        .await
        .expect("pipeline hung")
        .expect("pipeline failed")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worked_example_produces_sorted_lines() {
    for capacity in [0, 1, 10] {
        let lines = run_example(&config(capacity), &["a", "b", "a", "c"]).await;
        assert_eq!(
            lines,
            vec!["true 200", "false 100", "false 300"],
            "capacity={capacity}"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn repeated_runs_are_deterministic() {
    let identifiers = ["c", "a", "b", "b", "a", "c", "a"];
    let first = run_example(&config(2), &identifiers).await;
    for _ in 0..10 {
        assert_eq!(run_example(&config(2), &identifiers).await, first);
    }
}

#[tokio::test]
async fn unknown_identifiers_are_dropped() {
    let lines = run_example(&config(1), &["nobody", "b", "ghost"]).await;
    assert_eq!(lines, vec!["true 200"]);
}

#[tokio::test]
async fn empty_input_yields_no_lines() {
    let lines = run_example(&config(0), &[]).await;
    assert!(lines.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn simulated_services_end_to_end() {
    let sim = SimulatedServices::new(SimulatedConfig {
        user_space: 50,
        messages_per_user: 3,
        spam_modulus: 4,
        max_latency: Duration::from_millis(2),
        failure_rate: 0.0,
    });
    let identifiers: Vec<String> = (0..200).map(|i| format!("login-{}", i % 80)).collect();

    let mut expected_users: Vec<u64> = identifiers.iter().map(|i| sim.user_id_for(i)).collect();
    expected_users.sort_unstable();
    expected_users.dedup();

    let mut expected: Vec<(bool, MessageId)> = expected_users
        .iter()
        .flat_map(|&u| sim.messages_for(u))
        .map(|id| (sim.is_spam(id), id))
        .collect();
    expected.sort_by_key(|(spam, id)| (!spam, *id));
    let expected: Vec<String> = expected
        .into_iter()
        .map(|(spam, id)| format!("{spam} {id}"))
        .collect();

    let services = Arc::new(sim);
    let config = PipelineConfig {
        queue_capacity: 3,
        max_batch_size: 4,
        worker_count: 6,
        resolver_workers: 8,
        call_timeout: Some(Duration::from_secs(1)),
    };
    let lines = timeout(
        TEST_TIMEOUT,
        spam_pipeline(&config, services.clone(), services.clone(), services).collect(identifiers),
    )
    .await
    .expect("pipeline hung")
    .unwrap();

    assert_eq!(lines, expected);
}

/// Classifier that panics on one message.
struct PanickyClassifier;

#[async_trait]
impl SpamClassifier for PanickyClassifier {
    async fn has_spam(&self, id: MessageId) -> Result<bool, ServiceError> {
        if id == MessageId(200) {
            panic!("classifier crashed on {id}");
        }
        Ok(false)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn collaborator_panic_fails_the_run_without_hanging() {
    let services = ExampleServices::new();
    let items: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
    let result = timeout(
        TEST_TIMEOUT,
        spam_pipeline(
            &config(0),
            services.clone(),
            services,
            Arc::new(PanickyClassifier),
        )
        .collect(items),
    )
    .await
    .expect("pipeline hung after a panic");

    match result {
        Err(PipelineError::StagePanicked { stage, reason }) => {
            assert_eq!(stage, "check_spam");
            assert!(reason.contains("classifier crashed on 200"), "{reason}");
        }
        other => panic!("expected StagePanicked, got {other:?}"),
    }
}

/// Directory that never answers.
struct StuckDirectory;

#[async_trait]
impl UserDirectory for StuckDirectory {
    async fn resolve_user(&self, _identifier: &str) -> Result<User, ServiceError> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn cancellation_aborts_a_hung_collaborator() {
    let services = ExampleServices::new();
    let (input, pipeline, output) = spam_pipeline(
        &config(1),
        Arc::new(StuckDirectory),
        services.clone(),
        services,
    )
    .build();
    let cancel = pipeline.cancel_token();
    let run = tokio::spawn(pipeline.run());

    input.send("a".to_string()).await.unwrap();
    drop(input);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!run.is_finished(), "run should be stuck on the directory");

    cancel.cancel();
    let result = timeout(TEST_TIMEOUT, run)
        .await
        .expect("cancel did not unblock the run")
        .unwrap();
    assert!(matches!(result, Err(PipelineError::Cancelled)));
    assert_eq!(output.recv().await, None);
}

#[tokio::test]
async fn call_timeout_drops_the_item_and_finishes() {
    let services = ExampleServices::new();
    let config = PipelineConfig {
        call_timeout: Some(Duration::from_millis(20)),
        ..config(1)
    };
    let lines = timeout(
        TEST_TIMEOUT,
        spam_pipeline(&config, Arc::new(StuckDirectory), services.clone(), services)
            .collect(vec!["a".to_string(), "b".to_string()]),
    )
    .await
    .expect("timeout did not bound the call")
    .unwrap();
    assert!(lines.is_empty());
}

// ── Backpressure ────────────────────────────────────────────────────

type Log = Arc<Mutex<Vec<String>>>;

/// Forwards items, logging each completed send.
struct RecordSends {
    log: Log,
}

#[async_trait]
impl Stage for RecordSends {
    type Input = u32;
    type Output = u32;

    fn name(&self) -> &'static str {
        "record_sends"
    }

    async fn run(
        &self,
        input: QueueReceiver<u32>,
        output: QueueSender<u32>,
        cancel: CancellationToken,
    ) -> Result<(), StageError> {
        while let Some(item) = input.recv_until(&cancel).await? {
            output.send_until(item, &cancel).await?;
            self.log.lock().unwrap().push(format!("sent {item}"));
        }
        Ok(())
    }
}

/// Waits before every receive, logging what it took.
struct SlowConsumer {
    log: Log,
    delay: Duration,
}

#[async_trait]
impl Stage for SlowConsumer {
    type Input = u32;
    type Output = u32;

    fn name(&self) -> &'static str {
        "slow_consumer"
    }

    async fn run(
        &self,
        input: QueueReceiver<u32>,
        output: QueueSender<u32>,
        cancel: CancellationToken,
    ) -> Result<(), StageError> {
        loop {
            tokio::time::sleep(self.delay).await;
            let Some(item) = input.recv_until(&cancel).await? else {
                return Ok(());
            };
            self.log.lock().unwrap().push(format!("recv {item}"));
            output.send_until(item, &cancel).await?;
        }
    }
}

async fn record_backpressure(capacity: usize) -> Vec<String> {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let out = timeout(
        TEST_TIMEOUT,
        PipelineBuilder::new(capacity)
            .stage(RecordSends { log: log.clone() })
            .stage(SlowConsumer {
                log: log.clone(),
                delay: Duration::from_millis(20),
            })
            .collect(0..3u32),
    )
    .await
    .expect("pipeline hung")
    .unwrap();
    assert_eq!(out, vec![0, 1, 2]);
    let events = log.lock().unwrap().clone();
    events
}

// Single-threaded runtime: a consumer logs its receive before the woken
// sender gets to run.
#[tokio::test]
async fn rendezvous_send_waits_for_slow_consumer() {
    let events = record_backpressure(0).await;
    for i in 0..3 {
        let recv = events.iter().position(|e| *e == format!("recv {i}")).unwrap();
        let sent = events.iter().position(|e| *e == format!("sent {i}")).unwrap();
        assert!(recv < sent, "send {i} completed before it was consumed: {events:?}");
    }
}

#[tokio::test]
async fn buffered_sends_run_ahead_of_slow_consumer() {
    let events = record_backpressure(8).await;
    // With room in the queue every send completes before the first receive.
    assert_eq!(&events[..3], &["sent 0", "sent 1", "sent 2"]);
}
