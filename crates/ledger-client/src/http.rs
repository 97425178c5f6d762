//! HTTP implementation of the ledger contract.

use crate::{LedgerError, LedgerResult, LedgerService, RemoteSessionConfirmation};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use timebank_database::{
    Balance, PendingTransaction, TimeLedgerEntry, TransactionKind,
};
use tokio::sync::RwLock;
use tracing::debug;

/// HTTP client configuration.
#[derive(Debug, Clone)]
pub struct HttpLedgerConfig {
    /// Base URL for the ledger API.
    pub api_url: String,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for HttpLedgerConfig {
    fn default() -> Self {
        Self {
            api_url: "https://ledger.timebank.dev".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Transaction submission payload.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitTransactionRequest<'a> {
    transaction_id: &'a str,
    account_id: &'a str,
    kind: &'a str,
    seconds_delta: i64,
    description: &'a str,
    metadata: &'a std::collections::HashMap<String, String>,
    source: &'a str,
    device_identifier: &'a str,
    created_at: DateTime<Utc>,
}

/// Session start payload.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartSessionRequest<'a> {
    duration_seconds: i64,
    device_identifier: &'a str,
}

/// Ledger entry as returned by the server.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LedgerEntryPayload {
    id: String,
    account_id: String,
    kind: String,
    seconds_delta: i64,
    #[serde(default)]
    description: String,
    balance_after_seconds: i64,
    recorded_at: DateTime<Utc>,
}

impl LedgerEntryPayload {
    fn into_entry(self) -> LedgerResult<TimeLedgerEntry> {
        let kind = TransactionKind::parse(&self.kind).ok_or_else(|| {
            LedgerError::InvalidResponse(format!("unknown entry kind: {}", self.kind))
        })?;
        Ok(TimeLedgerEntry {
            id: self.id,
            account_id: self.account_id,
            kind,
            seconds_delta: self.seconds_delta,
            description: self.description,
            balance_after_seconds: self.balance_after_seconds,
            recorded_at: self.recorded_at,
        })
    }
}

/// Balance as returned by the server.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalancePayload {
    account_id: String,
    current_seconds: i64,
    lifetime_earned_seconds: i64,
    lifetime_spent_seconds: i64,
    daily_limit_seconds: i64,
    weekly_limit_seconds: i64,
    updated_at: DateTime<Utc>,
}

impl From<BalancePayload> for Balance {
    fn from(p: BalancePayload) -> Self {
        Balance {
            account_id: p.account_id,
            current_seconds: p.current_seconds,
            lifetime_earned_seconds: p.lifetime_earned_seconds,
            lifetime_spent_seconds: p.lifetime_spent_seconds,
            daily_limit_seconds: p.daily_limit_seconds,
            weekly_limit_seconds: p.weekly_limit_seconds,
            updated_at: p.updated_at,
        }
    }
}

/// Session confirmation payload.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartSessionResponse {
    session_id: String,
    balance: BalancePayload,
    entry: LedgerEntryPayload,
}

/// Production ledger client over HTTPS.
pub struct HttpLedgerClient {
    config: HttpLedgerConfig,
    client: Client,
    auth_token: RwLock<Option<String>>,
}

impl HttpLedgerClient {
    /// Create a new client.
    pub fn new(config: HttpLedgerConfig) -> LedgerResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LedgerError::Transport(e.to_string()))?;

        Ok(Self {
            config,
            client,
            auth_token: RwLock::new(None),
        })
    }

    /// Update the bearer token after authentication or refresh.
    pub async fn set_auth_token(&self, token: &str) {
        *self.auth_token.write().await = Some(token.to_string());
    }

    async fn bearer(&self) -> String {
        self.auth_token
            .read()
            .await
            .clone()
            .unwrap_or_default()
    }

    /// Map a non-success HTTP status to the error taxonomy.
    async fn status_error(response: reqwest::Response) -> LedgerError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_client_error() && status != StatusCode::REQUEST_TIMEOUT {
            LedgerError::Rejected(format!("HTTP {status}: {body}"))
        } else {
            LedgerError::Transport(format!("HTTP {status}: {body}"))
        }
    }
}

#[async_trait]
impl LedgerService for HttpLedgerClient {
    async fn submit_transaction(
        &self,
        tx: &PendingTransaction,
    ) -> LedgerResult<TimeLedgerEntry> {
        let url = format!("{}/v1/transactions", self.config.api_url);
        let request = SubmitTransactionRequest {
            transaction_id: &tx.id,
            account_id: &tx.account_id,
            kind: tx.kind.as_str(),
            seconds_delta: tx.seconds_delta,
            description: &tx.description,
            metadata: &tx.metadata,
            source: tx.source.as_str(),
            device_identifier: &tx.device_identifier,
            created_at: tx.created_at,
        };

        debug!(tx_id = %tx.id, seconds_delta = tx.seconds_delta, "Submitting transaction");

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.bearer().await)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        let payload: LedgerEntryPayload = response
            .json()
            .await
            .map_err(|e| LedgerError::InvalidResponse(e.to_string()))?;
        payload.into_entry()
    }

    async fn get_balance(&self, account_id: &str) -> LedgerResult<Balance> {
        let url = format!("{}/v1/accounts/{}/balance", self.config.api_url, account_id);

        let response = self
            .client
            .get(&url)
            .bearer_auth(self.bearer().await)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        let payload: BalancePayload = response
            .json()
            .await
            .map_err(|e| LedgerError::InvalidResponse(e.to_string()))?;
        Ok(payload.into())
    }

    async fn get_recent_entries(
        &self,
        account_id: &str,
        limit: u32,
    ) -> LedgerResult<Vec<TimeLedgerEntry>> {
        let url = format!(
            "{}/v1/accounts/{}/entries?limit={}",
            self.config.api_url, account_id, limit
        );

        let response = self
            .client
            .get(&url)
            .bearer_auth(self.bearer().await)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        let payloads: Vec<LedgerEntryPayload> = response
            .json()
            .await
            .map_err(|e| LedgerError::InvalidResponse(e.to_string()))?;
        payloads.into_iter().map(|p| p.into_entry()).collect()
    }

    async fn start_session_remote(
        &self,
        account_id: &str,
        duration_seconds: i64,
        device_identifier: &str,
    ) -> LedgerResult<RemoteSessionConfirmation> {
        let url = format!(
            "{}/v1/accounts/{}/sessions",
            self.config.api_url, account_id
        );
        let request = StartSessionRequest {
            duration_seconds,
            device_identifier,
        };

        debug!(account_id = %account_id, duration_seconds, "Starting remote session");

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.bearer().await)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        let payload: StartSessionResponse = response
            .json()
            .await
            .map_err(|e| LedgerError::InvalidResponse(e.to_string()))?;

        Ok(RemoteSessionConfirmation {
            session_id: payload.session_id,
            balance_after: payload.balance.into(),
            entry: payload.entry.into_entry()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = HttpLedgerConfig::default();
        assert_eq!(config.timeout_secs, 30);
        assert!(config.api_url.starts_with("https://"));
    }

    #[tokio::test]
    async fn test_client_creation_and_token() {
        let client = HttpLedgerClient::new(HttpLedgerConfig::default()).unwrap();
        assert_eq!(client.bearer().await, "");

        client.set_auth_token("token-1").await;
        assert_eq!(client.bearer().await, "token-1");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transport_error() {
        let client = HttpLedgerClient::new(HttpLedgerConfig {
            api_url: "http://127.0.0.1:1".to_string(),
            timeout_secs: 1,
        })
        .unwrap();

        let err = client.get_balance("acct-1").await.unwrap_err();
        assert!(err.is_transport());
    }
}
