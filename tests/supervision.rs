mod common;

use async_trait::async_trait;
use common::{app, rig, wait_for_cycles};
use gridpilot::coordinator::ControllerMode;
use gridpilot::supervisor::{FailureAction, HealthCheck, HealthCheckResult, HealthPolicy};
use gridpilot::{ControllerHandle, DecisionOutcome, GracefulShutdown, ShutdownSignal};
use std::sync::Arc;
use std::time::Duration;

struct AlwaysFailing;

#[async_trait]
impl HealthCheck for AlwaysFailing {
    fn name(&self) -> &str {
        "bridge_ping"
    }

    async fn check(&self) -> HealthCheckResult {
        HealthCheckResult::Failed("connection refused".into())
    }
}

fn immediate(action: FailureAction) -> HealthPolicy {
    HealthPolicy {
        grace: Some(Duration::ZERO),
        action,
    }
}

async fn wait_for_record(handle: &ControllerHandle, kind: &str) -> DecisionOutcome {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(record) = handle
                .list_decisions(None)
                .await
                .into_iter()
                .find(|r| r.outcome.kind() == kind)
            {
                return record.outcome;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("decision record never appeared")
}

#[tokio::test]
async fn failing_check_drops_autonomous_to_alert() {
    let rig = rig(&app(ControllerMode::Autonomous));
    rig.watchdog
        .register_check(Arc::new(AlwaysFailing), immediate(FailureAction::PauseAndAlert))
        .await;
    let shutdown = GracefulShutdown::new();
    let handle = rig.handle.clone();
    let task = tokio::spawn(rig.control.run(shutdown.subscribe()));
    wait_for_cycles(&handle, 1).await;

    rig.watchdog.run_once().await;
    let outcome = wait_for_record(&handle, "mode_changed").await;
    let DecisionOutcome::ModeChanged { reason } = outcome else {
        panic!("unexpected outcome {outcome:?}");
    };
    assert!(reason.starts_with("autonomous -> alert"));
    assert!(reason.contains("bridge_ping"));
    assert_eq!(handle.mode().await, ControllerMode::Alert);
    assert!(!rig.emergency.is_stopped());

    let checks = handle.health().await.checks;
    assert_eq!(checks.len(), 1);
    assert!(checks[0].escalated);

    // Escalation fires once per failure streak.
    handle
        .set_mode(ControllerMode::Autonomous, "operator override")
        .await
        .unwrap();
    rig.watchdog.run_once().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.mode().await, ControllerMode::Autonomous);

    shutdown.trigger(ShutdownSignal::Graceful);
    task.await.unwrap();
}

#[tokio::test]
async fn critical_check_latches_the_emergency_stop() {
    let rig = rig(&app(ControllerMode::Alert));
    rig.watchdog
        .register_check(Arc::new(AlwaysFailing), immediate(FailureAction::EmergencyStop))
        .await;
    let shutdown = GracefulShutdown::new();
    let handle = rig.handle.clone();
    let task = tokio::spawn(rig.control.run(shutdown.subscribe()));
    wait_for_cycles(&handle, 1).await;

    rig.watchdog.run_once().await;
    assert!(rig.emergency.is_stopped());
    let outcome = wait_for_record(&handle, "emergency").await;
    let DecisionOutcome::Emergency { reason } = outcome else {
        panic!("unexpected outcome {outcome:?}");
    };
    assert!(reason.contains("bridge_ping"));
    assert!(handle.health().await.emergency.active);

    shutdown.trigger(ShutdownSignal::Graceful);
    task.await.unwrap();
}
