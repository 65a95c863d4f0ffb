use serde_json::{json, Value};
use tabled::Tabled;

use super::client::ApiClient;
use super::levels::LevelRow;
use super::output::{print_item, print_kv, print_rows, print_success, print_warn, OutputMode};
use super::CtlCommands;
use crate::api::types::{ConfirmResponse, ControlResponse, ModeResponse};
use crate::coordinator::{CycleReport, PendingDecision};
use crate::domain::{DecisionRecord, Level, ScoreRecord};
use crate::error::Result;
use crate::risk::RiskState;

#[derive(Tabled)]
struct DecisionRow {
    at: String,
    cycle: u64,
    symbol: String,
    outcome: String,
    changes: usize,
    commands: usize,
}

impl From<&DecisionRecord> for DecisionRow {
    fn from(r: &DecisionRecord) -> Self {
        Self {
            at: r.at.format("%Y-%m-%d %H:%M:%S").to_string(),
            cycle: r.cycle,
            symbol: r.symbol.clone().unwrap_or_else(|| "-".to_string()),
            outcome: r.outcome.to_string(),
            changes: r.plan.as_ref().map(|p| p.change_count()).unwrap_or(0),
            commands: r.commands.len(),
        }
    }
}

#[derive(Tabled)]
struct PendingRow {
    id: String,
    symbol: String,
    activate: String,
    deactivate: String,
    expires_at: String,
}

impl From<&PendingDecision> for PendingRow {
    fn from(p: &PendingDecision) -> Self {
        let ids = |actions: &[crate::domain::PlanAction]| {
            actions
                .iter()
                .map(|a| a.level_id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };
        Self {
            id: p.id.to_string(),
            symbol: p.symbol.clone(),
            activate: ids(&p.plan.activate),
            deactivate: ids(&p.plan.deactivate),
            expires_at: p.expires_at.format("%H:%M:%S").to_string(),
        }
    }
}

#[derive(Tabled)]
struct SubScoreRow {
    component: &'static str,
    value: String,
}

pub async fn run(client: &ApiClient, command: CtlCommands, mode: OutputMode) -> Result<()> {
    match command {
        CtlCommands::Status => {
            let health: Value = client.get("/health", &[]).await?;
            if mode == OutputMode::Json {
                return print_item(&health);
            }
            print_kv("status", health["status"].as_str().unwrap_or("?"));
            print_kv("mode", health["mode"].as_str().unwrap_or("?"));
            print_kv("risk level", health["risk_level"].as_str().unwrap_or("?"));
            print_kv("emergency", health["emergency"]["active"].as_bool().unwrap_or(false));
            print_kv("pool", &health["pool"]["by_status"]);
            print_kv("queue", &health["execution"]);
            if let Some(components) = health["components"].as_array() {
                for c in components {
                    print_kv(
                        c["name"].as_str().unwrap_or("?"),
                        format!(
                            "{} (missed {})",
                            c["status"].as_str().unwrap_or("?"),
                            c["missed_heartbeats"]
                        ),
                    );
                }
            }
        }
        CtlCommands::Decisions { since, limit } => {
            let mut query = vec![("limit", limit.to_string())];
            if let Some(since) = since {
                query.push(("since", since.to_rfc3339()));
            }
            let records: Vec<DecisionRecord> = client.get("/api/decisions", &query).await?;
            print_rows(&records, DecisionRow::from, mode)?;
        }
        CtlCommands::Pending => {
            let pending: Vec<PendingDecision> = client.get("/api/pending", &[]).await?;
            print_rows(&pending, PendingRow::from, mode)?;
        }
        CtlCommands::Risk => {
            let state: RiskState = client.get("/api/risk", &[]).await?;
            print_item(&state)?;
        }
        CtlCommands::Active => {
            let levels: Vec<Level> = client.get("/api/levels/active", &[]).await?;
            print_rows(&levels, LevelRow::from, mode)?;
        }
        CtlCommands::Score { level_id } => {
            let record: ScoreRecord = client.get(&format!("/api/scores/{level_id}"), &[]).await?;
            if mode == OutputMode::Json {
                return print_item(&record);
            }
            print_kv("level", &record.level_id);
            print_kv("aggregate", format!("{:.1}", record.aggregate));
            print_kv("distance %", format!("{:.3}", record.distance_pct));
            let rows: Vec<SubScoreRow> = record
                .sub_scores
                .named()
                .into_iter()
                .map(|(component, value)| SubScoreRow {
                    component,
                    value: format!("{value:.3}"),
                })
                .collect();
            println!("{}", tabled::Table::new(rows));
            for note in &record.notes {
                print_warn(note);
            }
        }
        CtlCommands::Mode { mode: target, reason } => {
            let resp: ModeResponse = client
                .post("/api/mode", Some(json!({ "mode": target, "reason": reason })))
                .await?;
            print_success(&format!("mode {} -> {}", resp.previous, resp.current));
        }
        CtlCommands::Confirm { id } => {
            let resp: ConfirmResponse = client
                .post(&format!("/api/pending/{id}/confirm"), None)
                .await?;
            print_success(&format!(
                "confirmed {}: {} command(s) queued",
                resp.pending_id,
                resp.command_ids.len()
            ));
        }
        CtlCommands::Reject { id } => {
            let resp: ControlResponse = client
                .post(&format!("/api/pending/{id}/reject"), None)
                .await?;
            print_success(&resp.message);
        }
        CtlCommands::Cycle => {
            let report: CycleReport = client.post("/api/cycle", None).await?;
            print_item(&report)?;
        }
        CtlCommands::ResetEmergency => {
            let resp: ControlResponse = client.post("/api/emergency/reset", None).await?;
            print_success(&resp.message);
        }
    }
    Ok(())
}
