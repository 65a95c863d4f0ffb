mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{app, long, rig, short, tick, wait_for_cycles};
use gridpilot::coordinator::ControllerMode;
use gridpilot::domain::{DecisionOutcome, LevelStatus};
use gridpilot::execution::{CommandKind, CommandPriority, CommandStatus};
use gridpilot::risk::RiskLevel;
use gridpilot::{EmergencyReason, ExecutionVenue, GracefulShutdown, PilotError, ShutdownSignal};
use rust_decimal_macros::dec;

fn kinds(records: &[gridpilot::DecisionRecord]) -> Vec<&'static str> {
    records.iter().map(|r| r.outcome.kind()).collect()
}

#[tokio::test]
async fn autonomous_cycle_activates_levels_inside_the_zone() {
    let mut rig = rig(&app(ControllerMode::Autonomous));
    rig.pool.add(long("near", dec!(5.15))).await.unwrap();
    // 13% below price: outside the activation zone
    rig.pool.add(long("far", dec!(4.50))).await.unwrap();
    rig.venue.push_tick(tick(dec!(5.20))).await;

    let report = rig.control.run_cycle_at(Utc::now()).await;
    assert_eq!(report.decisions, 1);
    assert_eq!(report.commands, 1);

    let records = rig.handle.list_decisions(None).await;
    assert_eq!(kinds(&records), vec!["executed"]);
    let plan = records[0].plan.as_ref().unwrap();
    let ids: Vec<&str> = plan.activate.iter().map(|a| a.level_id.as_str()).collect();
    assert_eq!(ids, vec!["near"]);

    assert_eq!(rig.execution.process_ready().await, 1);
    let active = rig.handle.get_active_levels().await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, "near");

    let breakdown = rig.handle.get_score_breakdown("near").unwrap();
    assert!((0.0..=100.0).contains(&breakdown.aggregate));
    assert!(breakdown.distance_pct < 1.0);
    assert!(rig.handle.get_score_breakdown("missing").is_none());
}

#[tokio::test]
async fn plan_inside_hold_window_is_suppressed() {
    let mut rig = rig(&app(ControllerMode::Autonomous));
    rig.pool.add(long("first", dec!(5.15))).await.unwrap();
    rig.venue.push_tick(tick(dec!(5.20))).await;

    let t0 = Utc::now();
    rig.control.run_cycle_at(t0).await;
    rig.execution.process_ready().await;
    assert_eq!(rig.pool.get("first").await.unwrap().status, LevelStatus::Active);

    rig.pool.add(short("second", dec!(5.25))).await.unwrap();
    let report = rig.control.run_cycle_at(t0 + ChronoDuration::seconds(90)).await;
    assert_eq!(report.commands, 0);
    let last = rig.handle.list_decisions(None).await.pop().unwrap();
    assert!(matches!(last.outcome, DecisionOutcome::Suppressed { .. }));
    assert_eq!(rig.pool.get("second").await.unwrap().status, LevelStatus::Available);

    // Past the minimum plan hold the same change goes through.
    let report = rig.control.run_cycle_at(t0 + ChronoDuration::seconds(301)).await;
    assert_eq!(report.commands, 1);
    let last = rig.handle.list_decisions(None).await.pop().unwrap();
    assert_eq!(last.outcome, DecisionOutcome::Executed);
}

#[tokio::test]
async fn risk_veto_is_recorded_and_nothing_dispatched() {
    let mut config = app(ControllerMode::Autonomous);
    config.risk.max_symbol_exposure = dec!(100);
    let mut rig = rig(&config);
    rig.pool.add(long("big", dec!(5.15))).await.unwrap();
    rig.venue.push_tick(tick(dec!(5.20))).await;

    let report = rig.control.run_cycle_at(Utc::now()).await;
    assert_eq!(report.commands, 0);
    let records = rig.handle.list_decisions(None).await;
    assert_eq!(kinds(&records), vec!["rejected"]);
    assert!(rig.execution.pending().await.is_empty());
}

#[tokio::test]
async fn disabled_mode_observes_without_deciding() {
    let mut rig = rig(&app(ControllerMode::Disabled));
    rig.pool.add(long("near", dec!(5.15))).await.unwrap();
    rig.venue.push_tick(tick(dec!(5.20))).await;

    let report = rig.control.run_cycle_at(Utc::now()).await;
    assert_eq!(report.decisions, 0);
    assert_eq!(report.mode, ControllerMode::Disabled);
    assert!(rig.handle.list_decisions(None).await.is_empty());
    assert_eq!(rig.handle.stats().await.cycles, 1);
}

#[tokio::test]
async fn unconfirmed_alert_plan_expires() {
    let config = app(ControllerMode::Alert);
    let expiry = config.controller.pending_expiry_secs as i64;
    let mut rig = rig(&config);
    rig.pool.add(long("near", dec!(5.15))).await.unwrap();
    rig.venue.push_tick(tick(dec!(5.20))).await;

    let t0 = Utc::now();
    let report = rig.control.run_cycle_at(t0).await;
    assert_eq!(report.commands, 0);
    let pending = rig.handle.pending().await;
    assert_eq!(pending.len(), 1);
    let first = pending[0].id;

    rig.control
        .run_cycle_at(t0 + ChronoDuration::seconds(expiry + 1))
        .await;
    let expired = rig
        .handle
        .list_decisions(None)
        .await
        .into_iter()
        .any(|r| r.outcome == DecisionOutcome::Expired { pending_id: first });
    assert!(expired);
    assert!(rig.handle.pending().await.iter().all(|p| p.id != first));
    assert!(rig.execution.pending().await.is_empty());
}

#[tokio::test]
async fn operator_confirms_and_rejects_through_the_handle() {
    let rig = rig(&app(ControllerMode::Alert));
    rig.pool.add(long("near", dec!(5.15))).await.unwrap();
    rig.venue.push_tick(tick(dec!(5.20))).await;

    let shutdown = GracefulShutdown::new();
    let handle = rig.handle.clone();
    let task = tokio::spawn(rig.control.run(shutdown.subscribe()));

    handle.trigger_cycle().await.unwrap();
    wait_for_cycles(&handle, 2).await;
    let pending = handle.pending().await;
    assert_eq!(pending.len(), 1);
    let id = pending[0].id;

    let commands = handle.confirm_pending_decision(id).await.unwrap();
    assert_eq!(commands.len(), 1);
    assert!(matches!(
        handle.confirm_pending_decision(id).await,
        Err(PilotError::PendingDecisionNotFound(_))
    ));
    assert!(matches!(
        handle.reject_pending_decision(id).await,
        Err(PilotError::PendingDecisionNotFound(_))
    ));

    let records = handle.list_decisions(None).await;
    assert!(records
        .iter()
        .any(|r| r.outcome == DecisionOutcome::Confirmed { pending_id: id }));

    let previous = handle
        .set_mode(ControllerMode::Disabled, "maintenance")
        .await
        .unwrap();
    assert_eq!(previous, ControllerMode::Alert);
    assert_eq!(handle.mode().await, ControllerMode::Disabled);
    assert!(matches!(
        handle.confirm_pending_decision(uuid::Uuid::new_v4()).await,
        Err(PilotError::InvalidState(_))
    ));

    shutdown.trigger(ShutdownSignal::Graceful);
    task.await.unwrap();
    assert!(matches!(
        handle.trigger_cycle().await,
        Err(PilotError::ChannelClosed(_))
    ));
}

#[tokio::test]
async fn operator_rejection_is_recorded() {
    let rig = rig(&app(ControllerMode::Alert));
    rig.pool.add(long("near", dec!(5.15))).await.unwrap();
    rig.venue.push_tick(tick(dec!(5.20))).await;

    let shutdown = GracefulShutdown::new();
    let handle = rig.handle.clone();
    let task = tokio::spawn(rig.control.run(shutdown.subscribe()));

    handle.trigger_cycle().await.unwrap();
    wait_for_cycles(&handle, 2).await;
    let id = handle.pending().await[0].id;
    handle.reject_pending_decision(id).await.unwrap();
    assert!(handle.pending().await.is_empty());
    let last = handle.list_decisions(None).await.pop().unwrap();
    assert_eq!(last.outcome, DecisionOutcome::OperatorRejected { pending_id: id });

    shutdown.trigger(ShutdownSignal::Graceful);
    task.await.unwrap();
}

#[tokio::test]
async fn emergency_closes_open_positions_regardless_of_mode() {
    let mut rig = rig(&app(ControllerMode::Autonomous));
    rig.pool.add(long("near", dec!(5.15))).await.unwrap();
    rig.venue.push_tick(tick(dec!(5.20))).await;

    rig.control.run_cycle_at(Utc::now()).await;
    rig.execution.process_ready().await;
    rig.venue.push_tick(tick(dec!(5.14))).await;
    rig.control.run_cycle_at(Utc::now()).await;
    assert_eq!(rig.pool.get("near").await.unwrap().status, LevelStatus::Filled);

    rig.emergency
        .trigger(EmergencyReason::Manual("operator drill".into()))
        .await;
    let report = rig.control.run_cycle_at(Utc::now()).await;
    assert!(report.emergency);
    let last = rig.handle.list_decisions(None).await.pop().unwrap();
    assert!(matches!(last.outcome, DecisionOutcome::Emergency { .. }));
    // Stop plus one critical close
    assert_eq!(last.commands.len(), 2);

    rig.execution.process_ready().await;
    let fills = rig.venue.poll_fills().await.unwrap();
    rig.execution.reconcile_fills(fills).await;
    assert_eq!(rig.pool.get("near").await.unwrap().status, LevelStatus::Closed);
    assert!(rig.pool.open_positions().await.is_empty());

    // Still latched: the next cycle issues nothing new.
    let report = rig.control.run_cycle_at(Utc::now()).await;
    assert!(report.emergency);
    assert_eq!(report.commands, 0);
}

/// Activate `near` at 5.15 and fill it on a dip to 5.14
async fn rig_with_filled_long(config: &gridpilot::AppConfig) -> common::Rig {
    let mut rig = rig(config);
    rig.pool.add(long("near", dec!(5.15))).await.unwrap();
    rig.venue.push_tick(tick(dec!(5.20))).await;
    rig.control.run_cycle_at(Utc::now()).await;
    rig.execution.process_ready().await;
    rig.venue.push_tick(tick(dec!(5.14))).await;
    rig.control.run_cycle_at(Utc::now()).await;
    assert_eq!(rig.pool.get("near").await.unwrap().status, LevelStatus::Filled);
    rig
}

#[tokio::test]
async fn hard_drawdown_breach_closes_losing_positions() {
    let mut config = app(ControllerMode::Autonomous);
    config.risk.max_drawdown = dec!(5);
    let mut rig = rig_with_filled_long(&config).await;

    // 100 shares from 5.15 to 4.94: 21 down against a 5 drawdown cap
    rig.venue.push_tick(tick(dec!(4.94))).await;
    for _ in 0..3 {
        let report = rig.control.run_cycle_at(Utc::now()).await;
        assert!(!report.emergency);
        rig.execution.process_ready().await;
    }

    let status = rig.pool.get("near").await.unwrap().status;
    assert!(matches!(status, LevelStatus::Closed | LevelStatus::Available), "still {status:?}");
    assert!(rig.pool.open_positions().await.is_empty());
    assert!(rig.risk.positions().await.is_empty());
    assert_eq!(rig.risk.snapshot().await.level, RiskLevel::Critical);
    assert!(!rig.emergency.is_stopped());

    // One forced close across the three cycles
    let forced: Vec<_> = rig
        .handle
        .list_decisions(None)
        .await
        .into_iter()
        .filter(|r| matches!(r.outcome, DecisionOutcome::ForcedClose { .. }))
        .collect();
    assert_eq!(forced.len(), 1);
    assert_eq!(forced[0].commands.len(), 1);
    let DecisionOutcome::ForcedClose { reason } = &forced[0].outcome else {
        unreachable!();
    };
    assert!(reason.contains("drawdown"));

    let close = rig
        .execution
        .history(50)
        .await
        .into_iter()
        .find(|c| c.id == forced[0].commands[0])
        .expect("forced close in history");
    assert_eq!(close.kind, CommandKind::ClosePosition);
    assert_eq!(close.priority, CommandPriority::High);
    assert_eq!(close.status, CommandStatus::Acknowledged);
}

#[tokio::test]
async fn black_swan_move_latches_and_closes_everything() {
    let mut rig = rig_with_filled_long(&app(ControllerMode::Autonomous)).await;

    // Enough samples in the 300s window, then a 7.7% drop from 5.20
    for _ in 0..8 {
        rig.venue.push_tick(tick(dec!(5.20))).await;
    }
    rig.venue.push_tick(tick(dec!(4.80))).await;

    let report = rig.control.run_cycle_at(Utc::now()).await;
    assert!(report.emergency);
    assert!(rig.emergency.is_stopped());
    assert_eq!(rig.risk.level().await, RiskLevel::Emergency);

    let last = rig.handle.list_decisions(None).await.pop().unwrap();
    let DecisionOutcome::Emergency { reason } = &last.outcome else {
        panic!("unexpected outcome {:?}", last.outcome);
    };
    assert!(reason.starts_with("BlackSwan"));
    assert!(reason.contains("TQQQ"));
    // Stop plus one critical close
    assert_eq!(last.commands.len(), 2);

    rig.execution.process_ready().await;
    let fills = rig.venue.poll_fills().await.unwrap();
    rig.execution.reconcile_fills(fills).await;
    assert_eq!(rig.pool.get("near").await.unwrap().status, LevelStatus::Closed);
    assert!(rig.pool.open_positions().await.is_empty());
}
