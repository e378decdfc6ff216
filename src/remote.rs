use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::LOCATION;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::debug;

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

const PREFER_MINIMAL: &str = "return=minimal";

/// Result of an accepted remote mutation. `id` is only present when the
/// backend volunteered one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteOutcome {
    pub id: Option<String>,
    pub response: String,
}

#[async_trait]
pub trait RemoteComplaintStore: Send + Sync {
    async fn insert(&self, body: &Value) -> AppResult<RemoteOutcome>;
    async fn update(&self, backend_id: &str, body: &Value) -> AppResult<RemoteOutcome>;
}

/// PostgREST-style table endpoint. Requests never ask for the written row
/// back, so insert-only access policies are enough.
pub struct HttpRemoteStore {
    http: Client,
    endpoint: String,
    api_key: Option<SecretString>,
}

impl HttpRemoteStore {
    pub fn new(
        base_url: &str,
        table: &str,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> AppResult<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: format!("{}/rest/v1/{}", base_url.trim_end_matches('/'), table),
            api_key,
        })
    }

    pub fn from_config(config: &AppConfig) -> AppResult<Option<Self>> {
        let Some(base_url) = config.remote_url.as_deref() else {
            return Ok(None);
        };
        Self::new(
            base_url,
            &config.remote_table,
            config.remote_api_key.clone(),
            Duration::from_secs(config.remote_timeout_secs),
        )
        .map(Some)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header("Prefer", PREFER_MINIMAL);
        match &self.api_key {
            Some(key) => request
                .header("apikey", key.expose_secret())
                .bearer_auth(key.expose_secret()),
            None => request,
        }
    }
}

#[async_trait]
impl RemoteComplaintStore for HttpRemoteStore {
    async fn insert(&self, body: &Value) -> AppResult<RemoteOutcome> {
        let response = self
            .authorized(self.http.post(&self.endpoint))
            .json(body)
            .send()
            .await?;
        if response.status() == StatusCode::CONFLICT {
            let text = response.text().await.unwrap_or_default();
            debug!(target: "remote_sync", "insert conflicted; row already exists remotely");
            return Ok(RemoteOutcome {
                id: body.get("id").and_then(Value::as_str).map(str::to_string),
                response: format!("409 {text}").trim_end().to_string(),
            });
        }
        classify(response).await
    }

    async fn update(&self, backend_id: &str, body: &Value) -> AppResult<RemoteOutcome> {
        let response = self
            .authorized(self.http.patch(&self.endpoint))
            .query(&[("id", format!("eq.{backend_id}"))])
            .json(body)
            .send()
            .await?;
        classify(response).await
    }
}

async fn classify(response: Response) -> AppResult<RemoteOutcome> {
    let status = response.status();
    let location_id = response
        .headers()
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
        .and_then(id_from_location);
    let text = response.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(AppError::Remote {
            status: status.as_u16(),
            body: text,
        });
    }
    let id = id_from_body(&text).or(location_id);
    Ok(RemoteOutcome {
        id,
        response: format!("{} {text}", status.as_u16()).trim_end().to_string(),
    })
}

fn id_from_body(text: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(text).ok()?;
    let row = match &parsed {
        Value::Array(rows) => rows.first()?,
        other => other,
    };
    match row.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// `Location: /complaints?id=eq.<id>` as returned for minimal inserts.
fn id_from_location(location: &str) -> Option<String> {
    let (_, rest) = location.split_once("id=eq.")?;
    let id = rest.split('&').next()?.trim();
    (!id.is_empty()).then(|| id.to_string())
}
