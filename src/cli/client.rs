//! HTTP client for the control API

use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;

use crate::error::{PilotError, Result};

pub struct ApiClient {
    http: Client,
    base_url: String,
    token: Option<String>,
    operator: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str, token: Option<String>, operator: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("gridpilot-cli/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PilotError::Internal(format!("failed to build API client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            operator,
        })
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.http.request(method.clone(), &url).query(query);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        if let Some(operator) = &self.operator {
            req = req.header("x-operator", operator);
        }
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        // /health answers 503 with a full body during an emergency
        if !status.is_success() && !(path == "/health" && status.as_u16() == 503) {
            return Err(PilotError::AdapterFailure(format!(
                "{} {} failed: status={} body={}",
                method, path, status, text
            )));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let value = self.call(Method::GET, path, query, None).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn post<T: DeserializeOwned>(&self, path: &str, body: Option<Value>) -> Result<T> {
        let value = self.call(Method::POST, path, &[], body).await?;
        Ok(serde_json::from_value(value)?)
    }
}
