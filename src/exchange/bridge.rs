//! Production venue: JSON over HTTP to the trading bot's control endpoint.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::traits::{
    CloseRequest, ExecutionVenue, FillReport, OrderRequest, Position, VenueAck, VenueKind,
};
use crate::domain::{Candle, Level, Resolution, Tick};
use crate::error::{PilotError, Result};

const DEFAULT_BRIDGE_URL: &str = "http://127.0.0.1:8765";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub base_url: String,
    pub request_timeout_ms: u64,
    /// Sent as a bearer token when set
    pub api_token: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BRIDGE_URL.to_string(),
            request_timeout_ms: 10_000,
            api_token: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AckBody {
    #[serde(alias = "order_id", alias = "venue_id")]
    id: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Clone)]
pub struct BridgeVenue {
    http: Client,
    base_url: String,
    api_token: Option<String>,
}

impl BridgeVenue {
    pub fn new(config: &BridgeConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("gridpilot/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_millis(config.request_timeout_ms.max(1)))
            .build()
            .map_err(|e| PilotError::Internal(format!("failed to build bridge HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn request_json(
        &self,
        method: Method,
        path: &str,
        query: Option<&[(&str, String)]>,
        body: Option<Value>,
    ) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.http.request(method.clone(), &url);

        if let Some(query) = query {
            req = req.query(query);
        }
        if let Some(token) = &self.api_token {
            req = req.bearer_auth(token);
        }
        if let Some(body) = body {
            req = req.header(CONTENT_TYPE, "application/json").json(&body);
        }

        let started = Instant::now();
        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                PilotError::AdapterTimeout {
                    operation: format!("{} {}", method, path),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                }
            } else {
                PilotError::AdapterFailure(format!("{} {}: {}", method, path, e))
            }
        })?;
        let status = resp.status();
        let text = resp.text().await?;
        debug!(%method, path, status = status.as_u16(), elapsed_ms = started.elapsed().as_millis() as u64, "bridge call");

        if !status.is_success() {
            warn!(%method, path, status = status.as_u16(), "bridge call rejected");
            return Err(PilotError::AdapterFailure(format!(
                "bridge {} {} failed: status={} body={}",
                method, path, status, text
            )));
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_str(&text)
            .map_err(|e| PilotError::AdapterFailure(format!("invalid bridge JSON response: {}", e)))
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: Option<&[(&str, String)]>,
        body: Option<Value>,
    ) -> Result<T> {
        let value = self.request_json(method, path, query, body).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn ack(&self, path: &str, body: Value) -> Result<VenueAck> {
        let ack: AckBody = self.request(Method::POST, path, None, Some(body)).await?;
        let mut out = VenueAck::new(ack.id);
        out.message = ack.message;
        Ok(out)
    }

    fn level_body(level: &Level) -> Value {
        json!({
            "level_id": level.id,
            "symbol": level.symbol,
            "side": level.side,
            "entry_price": level.price,
            "exit_price": level.exit_price,
            "stop_price": level.stop_price,
            "shares": level.shares,
        })
    }
}

#[async_trait]
impl ExecutionVenue for BridgeVenue {
    fn kind(&self) -> VenueKind {
        VenueKind::Bridge
    }

    async fn activate_level(&self, level: &Level) -> Result<VenueAck> {
        self.ack("/levels/activate", Self::level_body(level)).await
    }

    async fn deactivate_level(&self, level: &Level) -> Result<VenueAck> {
        self.ack("/levels/deactivate", json!({ "level_id": level.id, "symbol": level.symbol }))
            .await
    }

    async fn stop_trade(&self, level: &Level) -> Result<VenueAck> {
        self.ack("/trades/stop", json!({ "level_id": level.id, "symbol": level.symbol }))
            .await
    }

    async fn close_position(&self, request: &CloseRequest) -> Result<VenueAck> {
        self.ack("/positions/close", serde_json::to_value(request)?).await
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<VenueAck> {
        self.ack("/orders", serde_json::to_value(order)?).await
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        self.request_json(Method::POST, &format!("/orders/{}/cancel", order_id), None, None)
            .await?;
        Ok(())
    }

    async fn get_position(&self, symbol: &str) -> Result<Position> {
        self.request(Method::GET, &format!("/positions/{}", symbol), None, None)
            .await
    }

    async fn get_candles(
        &self,
        symbol: &str,
        window: usize,
        resolution: Resolution,
    ) -> Result<Vec<Candle>> {
        let query = [
            ("symbol", symbol.to_string()),
            ("window", window.to_string()),
            ("resolution", resolution.as_str().to_string()),
        ];
        self.request(Method::GET, "/candles", Some(&query), None).await
    }

    async fn poll_ticks(&self) -> Result<Vec<Tick>> {
        let value = self.request_json(Method::GET, "/ticks", None, None).await?;
        if value.is_null() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_value(value)?)
    }

    async fn poll_fills(&self) -> Result<Vec<FillReport>> {
        let value = self.request_json(Method::GET, "/fills", None, None).await?;
        if value.is_null() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_value(value)?)
    }

    async fn ping(&self) -> Result<()> {
        self.request_json(Method::GET, "/health", None, None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Side;
    use rust_decimal_macros::dec;

    #[test]
    fn trims_trailing_slash() {
        let venue = BridgeVenue::new(&BridgeConfig {
            base_url: "http://bot.local:9000/".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(venue.base_url(), "http://bot.local:9000");
    }

    #[test]
    fn level_body_carries_prices() {
        let level = Level::new("L1", "TQQQ", Side::Long, dec!(5.15), dec!(5.25), 100);
        let body = BridgeVenue::level_body(&level);
        assert_eq!(body["level_id"], "L1");
        assert_eq!(body["side"], "long");
        assert_eq!(body["shares"], 100);
    }

    #[test]
    fn ack_accepts_order_id_alias() {
        let ack: AckBody = serde_json::from_str(r#"{"order_id":"abc"}"#).unwrap();
        assert_eq!(ack.id, "abc");
    }

    #[tokio::test]
    async fn unreachable_bridge_is_adapter_failure() {
        let venue = BridgeVenue::new(&BridgeConfig {
            base_url: "http://127.0.0.1:1".into(),
            request_timeout_ms: 500,
            api_token: None,
        })
        .unwrap();
        let err = venue.ping().await.unwrap_err();
        assert!(err.is_adapter_failure());
    }
}
