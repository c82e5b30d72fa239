// End-to-end slot scenarios: dispatch, partial responses, window close,
// and per-miner scoring.

use super::mock::{build_validator, test_config, RecordingClient};
use std::sync::Arc;
use std::time::Duration;
use subnet_validator::{AcceptOutcome, MinerUid, ResultCollector, ResultStatus};
use tokio::sync::Mutex;
use tokio::time::sleep;

type SentLog = Arc<Mutex<Vec<(MinerUid, subnet_validator::TaskEnvelope)>>>;

/// Waits (under the paused clock) for the dispatcher to reach a miner,
/// then answers on its behalf with the given quality.
fn respond_as(
    sent: SentLog,
    collector: Arc<ResultCollector>,
    uid: MinerUid,
    quality: f64,
) -> tokio::task::JoinHandle<AcceptOutcome> {
    tokio::spawn(async move {
        loop {
            let envelope = {
                let sent = sent.lock().await;
                sent.iter().find(|(m, _)| *m == uid).map(|(_, t)| t.clone())
            };
            if let Some(task) = envelope {
                return collector
                    .accept(
                        task.slot,
                        task.task_id,
                        uid,
                        serde_json::json!({ "quality": quality }),
                    )
                    .await
                    .unwrap();
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
}

#[tokio::test(start_paused = true)]
async fn test_end_to_end_two_respond_one_times_out() {
    let client = Arc::new(RecordingClient::new());
    let validator = build_validator(test_config(3, 10), client.clone(), &[1, 2, 3]).await;

    let r1 = respond_as(client.sent.clone(), validator.collector.clone(), 1, 0.8);
    let r2 = respond_as(client.sent.clone(), validator.collector.clone(), 2, 0.6);

    validator.coordinator.process_slot(0).await;

    assert_eq!(r1.await.unwrap(), AcceptOutcome::Stored(ResultStatus::Success));
    assert_eq!(r2.await.unwrap(), AcceptOutcome::Stored(ResultStatus::Success));

    // No more than batch_size assignments, one per miner.
    let assignments = validator.ledger.assignments_for(0).await;
    assert_eq!(assignments.len(), 3);

    // Scores: responders keep their quality, the silent miner gets zero.
    let cycle = validator.store.get(0).await.unwrap();
    assert!((cycle.scores[&1] - 0.8).abs() < 1e-9);
    assert!((cycle.scores[&2] - 0.6).abs() < 1e-9);
    assert_eq!(cycle.scores[&3], 0.0);

    // Every miner ends the slot free.
    for uid in [1, 2, 3] {
        assert!(!validator.registry.is_busy(uid).await.unwrap());
    }

    // The silent miner degraded the slot.
    let status = validator.coordinator.status().await;
    assert_eq!(status.slots_processed, 1);
    assert_eq!(status.degraded_slots, 1);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_miner_excluded_from_batch() {
    let client = Arc::new(RecordingClient::failing(&[2]));
    let validator = build_validator(test_config(3, 10), client.clone(), &[1, 2, 3]).await;

    let r1 = respond_as(client.sent.clone(), validator.collector.clone(), 1, 1.0);
    let r3 = respond_as(client.sent.clone(), validator.collector.clone(), 3, 1.0);

    validator.coordinator.process_slot(0).await;
    r1.await.unwrap();
    r3.await.unwrap();

    let assignments = validator.ledger.assignments_for(0).await;
    let assigned: Vec<_> = assignments.iter().map(|a| a.miner_uid).collect();
    assert!(!assigned.contains(&2));
    assert_eq!(assignments.len(), 2);

    // The failed send freed miner 2 immediately; it earned no score.
    assert!(!validator.registry.is_busy(2).await.unwrap());
    let cycle = validator.store.get(0).await.unwrap();
    assert!(!cycle.scores.contains_key(&2));
    assert!((cycle.scores[&1] - 1.0).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_late_and_duplicate_responses_ignored() {
    let client = Arc::new(RecordingClient::new());
    let validator = build_validator(test_config(2, 10), client.clone(), &[1, 2]).await;

    let r1 = respond_as(client.sent.clone(), validator.collector.clone(), 1, 0.9);
    validator.coordinator.process_slot(0).await;
    r1.await.unwrap();

    let task1 = client.envelope_for(1).await.unwrap();
    let task2 = client.envelope_for(2).await.unwrap();

    // Duplicate of miner 1's answer after the window: dropped, original stands.
    let outcome = validator
        .collector
        .accept(task1.slot, task1.task_id, 1, serde_json::json!({"quality": 0.1}))
        .await
        .unwrap();
    assert_eq!(outcome, AcceptOutcome::LateDropped);

    // Miner 2 answering after close is dropped too; its timeout stands.
    let outcome = validator
        .collector
        .accept(task2.slot, task2.task_id, 2, serde_json::json!({"quality": 1.0}))
        .await
        .unwrap();
    assert_eq!(outcome, AcceptOutcome::LateDropped);

    let cycle = validator.store.get(0).await.unwrap();
    assert!((cycle.scores[&1] - 0.9).abs() < 1e-9);
    assert_eq!(cycle.scores[&2], 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_spoofed_response_rejected() {
    let client = Arc::new(RecordingClient::new());
    // Miner 9 is registered but will not be assigned (batch of 1).
    let validator = build_validator(test_config(1, 10), client.clone(), &[1, 9]).await;

    let r1 = respond_as(client.sent.clone(), validator.collector.clone(), 1, 1.0);

    let collector = validator.collector.clone();
    let spoof = tokio::spawn(async move {
        // Let dispatch happen first.
        sleep(Duration::from_millis(50)).await;
        collector.accept(0, 0, 9, serde_json::json!({"quality": 1.0})).await
    });

    validator.coordinator.process_slot(0).await;
    r1.await.unwrap();

    assert!(spoof.await.unwrap().is_err());
    let cycle = validator.store.get(0).await.unwrap();
    assert!(!cycle.scores.contains_key(&9));
}

#[tokio::test(start_paused = true)]
async fn test_reputation_tracks_contributions() {
    let client = Arc::new(RecordingClient::new());
    let validator = build_validator(test_config(2, 10), client.clone(), &[1, 2]).await;

    let r1 = respond_as(client.sent.clone(), validator.collector.clone(), 1, 0.5);
    validator.coordinator.process_slot(0).await;
    r1.await.unwrap();

    // Responder gained its contribution; the timed-out miner gained nothing.
    let miner1 = validator.registry.get(1).await.unwrap();
    let miner2 = validator.registry.get(2).await.unwrap();
    assert!((miner1.reputation - 1.5).abs() < 1e-9);
    assert!((miner2.reputation - 1.0).abs() < 1e-9);
}
