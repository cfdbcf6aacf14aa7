//! Background recovery tests
//!
//! Simulates broker-side closes through the fake broker and checks what the
//! close watchers do about them.

mod test_helpers;

use serde_json::json;
use std::time::Duration;
use test_helpers::{connected_supervisor, wait_for_broker, wait_for_supervisor};
use wharf_messagebus::testing::{DialScript, FakeEvent};
use wharf_messagebus::{SupervisorError, SupervisorState};

#[tokio::test]
async fn test_unexpected_channel_close_reopens_channel_in_place() {
    let (supervisor, broker) = connected_supervisor().await;
    let before = supervisor.snapshot().await;

    broker.latest_channel().unwrap().fail("CHANNEL_ERROR - second 'channel.open' seen");
    wait_for_supervisor(&supervisor, "channel reopen", |snapshot, _| {
        snapshot.has_channel() && snapshot.channel != before.channel
    })
    .await;

    let after = supervisor.snapshot().await;
    assert_eq!(after.connection, before.connection);
    assert_eq!(supervisor.state(), SupervisorState::Connected);
    assert_eq!(broker.dial_attempts(), 1);
    assert_eq!(broker.open_channel_attempts(), 2);

    supervisor.publish(&json!({"after": "reopen"})).await.unwrap();
    assert_eq!(broker.published().len(), 1);
}

#[tokio::test]
async fn test_deliberate_channel_close_is_not_recovered() {
    let (supervisor, broker) = connected_supervisor().await;

    broker.latest_channel().unwrap().close_quietly();
    wait_for_supervisor(&supervisor, "channel removal", |snapshot, _| {
        !snapshot.has_channel()
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(broker.open_channel_attempts(), 1);
    assert!(supervisor.snapshot().await.has_connection());
    assert_eq!(supervisor.state(), SupervisorState::Connected);
}

#[tokio::test]
async fn test_failed_channel_reopen_only_logs() {
    let (supervisor, broker) = connected_supervisor().await;
    broker.configure(|b| b.fail_open_channel = true);

    broker.latest_channel().unwrap().fail("CHANNEL_ERROR");
    wait_for_broker(&broker, "channel reopen attempt", |broker| {
        broker.count_events(|e| matches!(e, FakeEvent::OpenChannel { succeeded: false, .. })) == 1
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(supervisor.state(), SupervisorState::Connected);
    let snapshot = supervisor.snapshot().await;
    assert!(snapshot.has_connection());
    assert!(!snapshot.has_channel());

    let err = supervisor.publish(&json!({"a": 1})).await.unwrap_err();
    assert!(matches!(err, SupervisorError::PublishWithoutChannel));
}

#[tokio::test]
async fn test_declare_failure_during_channel_recovery_abandons() {
    let (supervisor, broker) = connected_supervisor().await;
    let mut signal = supervisor.unexpected_close();
    broker.configure(|b| b.fail_declare = true);

    broker.latest_channel().unwrap().fail("CHANNEL_ERROR");
    let state = tokio::time::timeout(Duration::from_secs(5), supervisor.wait_for_termination())
        .await
        .unwrap();

    assert!(matches!(state, SupervisorState::Abandoned(_)));
    assert!(signal.has_changed().unwrap());
    assert!(signal.borrow_and_update().is_terminal());
    assert!(broker.latest_connection().unwrap().is_closed());
    let snapshot = supervisor.snapshot().await;
    assert!(!snapshot.has_connection());
    assert!(snapshot.sealed);
}

#[tokio::test]
async fn test_connection_loss_reconnects_and_reopens_channel() {
    let (supervisor, broker) = connected_supervisor().await;
    let before = supervisor.snapshot().await;

    broker.sever_connection("CONNECTION_FORCED - broker forced connection closure");
    wait_for_supervisor(&supervisor, "reconnect", |snapshot, state| {
        *state == SupervisorState::Connected
            && snapshot.connection > before.connection
            && snapshot.has_channel()
    })
    .await;

    assert_eq!(broker.dial_attempts(), 2);
    assert!(broker.connections()[0].is_closed());
    assert!(!broker.connections()[1].is_closed());

    supervisor.publish(&json!({"after": "reconnect"})).await.unwrap();
    assert_eq!(broker.published().len(), 1);
}

#[tokio::test]
async fn test_caller_signal_stays_quiet_after_recovery() {
    let (supervisor, broker) = connected_supervisor().await;
    let before = supervisor.snapshot().await;

    broker.sever_connection("CONNECTION_FORCED");
    wait_for_supervisor(&supervisor, "reconnect", |snapshot, state| {
        *state == SupervisorState::Connected && snapshot.connection > before.connection
    })
    .await;

    let waited =
        tokio::time::timeout(Duration::from_millis(100), supervisor.wait_for_termination()).await;
    assert!(waited.is_err(), "Recovered supervisor must not terminate");
}

#[tokio::test(start_paused = true)]
async fn test_failed_reconnect_abandons_supervision() {
    let (supervisor, broker) = connected_supervisor().await;
    broker.set_dial(DialScript::FailAlways);

    broker.sever_connection("CONNECTION_FORCED");
    let state = tokio::time::timeout(Duration::from_secs(60), supervisor.wait_for_termination())
        .await
        .unwrap();

    match state {
        SupervisorState::Abandoned(reason) => assert!(reason.contains("CONNECTION_FORCED")),
        other => panic!("Expected Abandoned, got {other:?}"),
    }
    // One dial for the initial connect, three for the failed recovery
    assert_eq!(broker.dial_attempts(), 4);
    let snapshot = supervisor.snapshot().await;
    assert!(!snapshot.has_connection());
    assert!(snapshot.sealed);

    let err = supervisor.connect().await.unwrap_err();
    assert!(matches!(err, SupervisorError::ShutDown));
}

#[tokio::test]
async fn test_channel_failure_after_reconnect_abandons_and_closes_connection() {
    let (supervisor, broker) = connected_supervisor().await;
    broker.configure(|b| b.fail_open_channel = true);

    broker.sever_connection("CONNECTION_FORCED");
    let state = tokio::time::timeout(Duration::from_secs(5), supervisor.wait_for_termination())
        .await
        .unwrap();

    assert!(matches!(state, SupervisorState::Abandoned(_)));
    assert_eq!(broker.dial_attempts(), 2);
    assert!(broker.latest_connection().unwrap().is_closed());
    let snapshot = supervisor.snapshot().await;
    assert!(!snapshot.has_connection());
    assert!(snapshot.sealed);
}

#[tokio::test]
async fn test_connection_lost_again_during_recovery_is_handed_over() {
    let (supervisor, broker) = connected_supervisor().await;
    // The reconnected connection (dial 2) dies while its channel is opening,
    // so a second watcher has to take over the recovery.
    broker.configure(|b| {
        b.sever_on_open = Some(2);
        b.open_channel_delay = Some(Duration::from_millis(200));
    });

    broker.sever_connection("CONNECTION_FORCED");
    wait_for_broker(&broker, "second reconnect", |broker| broker.dial_attempts() >= 3).await;
    wait_for_supervisor(&supervisor, "handed-over recovery", |snapshot, state| {
        *state == SupervisorState::Connected && snapshot.has_channel()
    })
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(supervisor.state(), SupervisorState::Connected);
    let snapshot = supervisor.snapshot().await;
    assert!(snapshot.has_connection());
    assert!(snapshot.has_channel());
    assert!(!snapshot.sealed);
    assert_eq!(broker.dial_attempts(), 3);
    assert!(broker.connections()[1].is_closed());
    assert!(!broker.connections()[2].is_closed());

    supervisor.publish(&json!({"after": "handover"})).await.unwrap();
    assert_eq!(broker.published().len(), 1);
}

#[tokio::test]
async fn test_deliberate_connection_close_moves_to_closed() {
    let (supervisor, broker) = connected_supervisor().await;

    broker.latest_connection().unwrap().close_quietly();
    let state = tokio::time::timeout(Duration::from_secs(5), supervisor.wait_for_termination())
        .await
        .unwrap();

    assert_eq!(state, SupervisorState::Closed);
    assert_eq!(broker.dial_attempts(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_publish_during_recovery_stays_consistent() {
    let (supervisor, broker) = connected_supervisor().await;

    let publisher = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            let mut outcomes = Vec::new();
            for i in 0..200 {
                outcomes.push(supervisor.publish(&json!({"seq": i})).await);
                assert!(supervisor.snapshot().await.is_consistent());
                tokio::task::yield_now().await;
            }
            outcomes
        })
    };

    for _ in 0..3 {
        let before = supervisor.snapshot().await;
        broker.sever_connection("CONNECTION_FORCED");
        wait_for_supervisor(&supervisor, "reconnect", |snapshot, state| {
            *state == SupervisorState::Connected
                && snapshot.connection > before.connection
                && snapshot.has_channel()
        })
        .await;
    }

    let outcomes = publisher.await.unwrap();
    for outcome in &outcomes {
        match outcome {
            Ok(())
            | Err(SupervisorError::PublishWithoutConnection)
            | Err(SupervisorError::PublishOnClosedConnection)
            | Err(SupervisorError::PublishWithoutChannel)
            | Err(SupervisorError::PublishFailed(_)) => {}
            Err(other) => panic!("Unexpected publish error: {other}"),
        }
    }
    let successes = outcomes.iter().filter(|o| o.is_ok()).count();
    assert_eq!(successes, broker.published().len());
    assert_eq!(supervisor.state(), SupervisorState::Connected);
}
