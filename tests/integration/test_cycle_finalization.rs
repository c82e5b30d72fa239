// Cycle accumulation, finalization, and multi-validator agreement.

use super::mock::{build_validator, test_config, RecordingClient};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use subnet_validator::{MinerUid, ScoreError};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn test_run_loop_finalizes_cycle_and_reports() {
    let client = Arc::new(RecordingClient::new());
    let validator = build_validator(test_config(1, 2), client, &[1]).await;
    let mut cycles = validator.coordinator.subscribe_cycles().await;

    validator.oracle.set_slot(2);
    let cancel = CancellationToken::new();
    let runner = {
        let coordinator = validator.coordinator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { coordinator.run(cancel).await })
    };

    // Slot 2 processes, then the oracle advances to slot 3 which completes
    // cycle 1 (slots 2 and 3).
    while validator.coordinator.status().await.slots_processed < 1 {
        sleep(Duration::from_millis(100)).await;
    }
    validator.oracle.set_slot(3);
    while validator.coordinator.status().await.slots_processed < 2 {
        sleep(Duration::from_millis(100)).await;
    }

    let finalized = cycles.recv().await.unwrap();
    assert_eq!(finalized.cycle_id, 1);
    assert_eq!(finalized.slots_aggregated, 2);
    // The lone miner never answered; both slots contribute zero.
    assert_eq!(finalized.scores[&1], 0.0);

    cancel.cancel();
    runner.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_finalized_cycle_is_immutable() {
    let client = Arc::new(RecordingClient::new());
    let validator = build_validator(test_config(1, 2), client, &[1]).await;

    validator.coordinator.process_slot(0).await;
    validator.coordinator.process_slot(1).await;
    assert!(validator.store.is_finalized(0).await);

    let contributions: BTreeMap<MinerUid, f64> = [(1, 1.0)].into_iter().collect();
    let err = validator.store.accumulate(0, &contributions).await.unwrap_err();
    assert!(matches!(err, ScoreError::CycleFinalized(0)));

    // The stored scores survive the rejected write untouched.
    let scores = validator.store.get(0).await.unwrap();
    assert_eq!(scores.scores[&1], 0.0);
    assert_eq!(scores.slots_aggregated, 2);
}

#[tokio::test(start_paused = true)]
async fn test_oracle_outage_stalls_but_never_kills_the_loop() {
    let client = Arc::new(RecordingClient::new());
    let validator = build_validator(test_config(1, 2), client, &[1]).await;

    validator.oracle.set_available(false);
    validator.oracle.set_slot(4);

    let cancel = CancellationToken::new();
    let runner = {
        let coordinator = validator.coordinator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { coordinator.run(cancel).await })
    };

    // Outage: backoff keeps polling, nothing processes.
    sleep(Duration::from_secs(10)).await;
    assert_eq!(validator.coordinator.status().await.slots_processed, 0);

    validator.oracle.set_available(true);
    while validator.coordinator.status().await.slots_processed < 1 {
        sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(validator.coordinator.status().await.last_slot, Some(4));

    cancel.cancel();
    runner.await.unwrap();
}

/// Two independent validators over identical miner responses must produce
/// identical cycle scores; consensus depends on it.
#[tokio::test(start_paused = true)]
async fn test_independent_validators_agree() {
    async fn run_one() -> BTreeMap<MinerUid, f64> {
        let client = Arc::new(RecordingClient::new());
        let validator = build_validator(test_config(3, 1), client.clone(), &[1, 2, 3]).await;

        let collector = validator.collector.clone();
        let sent = client.sent.clone();
        let responder = tokio::spawn(async move {
            let qualities: BTreeMap<MinerUid, f64> =
                [(1, 0.9), (2, 0.4)].into_iter().collect();
            let mut answered = Vec::new();
            loop {
                let pending = {
                    let sent = sent.lock().await;
                    sent.iter()
                        .filter(|(uid, _)| {
                            qualities.contains_key(uid) && !answered.contains(uid)
                        })
                        .map(|(uid, t)| (*uid, t.clone()))
                        .collect::<Vec<_>>()
                };
                for (uid, task) in pending {
                    collector
                        .accept(
                            task.slot,
                            task.task_id,
                            uid,
                            serde_json::json!({ "quality": qualities[&uid] }),
                        )
                        .await
                        .unwrap();
                    answered.push(uid);
                }
                if answered.len() == 2 {
                    return;
                }
                sleep(Duration::from_millis(10)).await;
            }
        });

        validator.coordinator.process_slot(0).await;
        responder.await.unwrap();
        validator.store.get(0).await.unwrap().scores
    }

    let a = run_one().await;
    let b = run_one().await;
    assert_eq!(a, b);
    assert!((a[&1] - 0.9).abs() < 1e-9);
    assert!((a[&2] - 0.4).abs() < 1e-9);
    assert_eq!(a[&3], 0.0);
}
