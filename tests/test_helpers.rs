//! Test helpers and utilities for integration tests

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use wharf_messagebus::supervisor::ResourceSnapshot;
use wharf_messagebus::testing::FakeBroker;
use wharf_messagebus::{ConnectionSupervisor, SupervisorConfig, SupervisorState};

const WAIT_LIMIT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[allow(dead_code)]
pub const TEST_QUEUE: &str = "wharf-events";
#[allow(dead_code)]
pub const TEST_INSTANCE: &str = "wharf-test-instance";

/// Plain-AMQP configuration for the in-memory broker
#[allow(dead_code)]
pub fn test_config(max_attempts: u64) -> SupervisorConfig {
    SupervisorConfig::new(
        "localhost",
        5672,
        "guest",
        "guest",
        TEST_QUEUE,
        "",
        true,
        max_attempts,
    )
}

/// A supervisor over a fresh fake broker, not yet connected
#[allow(dead_code)]
pub fn test_supervisor(max_attempts: u64) -> (ConnectionSupervisor, FakeBroker) {
    let broker = FakeBroker::new();
    let supervisor = ConnectionSupervisor::with_instance_id(
        test_config(max_attempts),
        Arc::new(broker.clone()),
        TEST_INSTANCE,
    );
    (supervisor, broker)
}

/// A connected supervisor over a fresh fake broker
#[allow(dead_code)]
pub async fn connected_supervisor() -> (ConnectionSupervisor, FakeBroker) {
    let (supervisor, broker) = test_supervisor(3);
    supervisor.connect().await.unwrap();
    (supervisor, broker)
}

/// Poll the supervisor until `condition` holds, failing after five seconds
#[allow(dead_code)]
pub async fn wait_for_supervisor(
    supervisor: &ConnectionSupervisor,
    description: &str,
    condition: impl Fn(&ResourceSnapshot, &SupervisorState) -> bool,
) {
    let deadline = Instant::now() + WAIT_LIMIT;
    loop {
        let snapshot = supervisor.snapshot().await;
        if condition(&snapshot, &supervisor.state()) {
            return;
        }
        assert!(Instant::now() < deadline, "Timed out waiting for {description}");
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Poll the broker until `condition` holds, failing after five seconds
#[allow(dead_code)]
pub async fn wait_for_broker(
    broker: &FakeBroker,
    description: &str,
    condition: impl Fn(&FakeBroker) -> bool,
) {
    let deadline = Instant::now() + WAIT_LIMIT;
    while !condition(broker) {
        assert!(Instant::now() < deadline, "Timed out waiting for {description}");
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
