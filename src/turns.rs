//! Turn fetching
//!
//! When a reply has finished playing the session asks a [`TurnListener`] to
//! pick up whatever conversational state the service produced for it.

use url::Url;

use crate::config::ServerConfig;
use crate::{Error, Result};

/// Called once per drained reply
pub trait TurnListener: Send + Sync {
    /// The reply for `target` finished playing
    fn on_turn_drained(&self, target: &str);
}

impl<F> TurnListener for F
where
    F: Fn(&str) + Send + Sync,
{
    fn on_turn_drained(&self, target: &str) {
        self(target);
    }
}

/// Fetches the message history of a flow over HTTP
#[derive(Debug, Clone)]
pub struct MessageFetcher {
    client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
}

impl MessageFetcher {
    /// Create a fetcher for the configured API
    #[must_use]
    pub fn new(server: &ServerConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: server.api_url.trim_end_matches('/').to_string(),
            api_key: server.api_key.clone(),
        }
    }

    /// Monitor endpoint listing the messages of `flow_id`
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the API URL is invalid
    pub fn messages_url(&self, flow_id: &str) -> Result<Url> {
        let base = format!("{}/api/v1/monitor/messages", self.api_url);
        Url::parse_with_params(&base, [("flow_id", flow_id)])
            .map_err(|e| Error::Config(format!("invalid api url '{}': {e}", self.api_url)))
    }

    /// Fetch the messages recorded for `flow_id`
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the response is not a JSON list
    pub async fn fetch(&self, flow_id: &str) -> Result<Vec<serde_json::Value>> {
        let url = self.messages_url(flow_id)?;
        tracing::debug!(%url, "fetching flow messages");

        let mut request = self.client.get(url);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Connection(format!(
                "message fetch failed {status}: {body}"
            )));
        }

        let messages: Vec<serde_json::Value> = response.json().await?;
        Ok(messages)
    }
}

impl TurnListener for MessageFetcher {
    fn on_turn_drained(&self, target: &str) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(flow = target, "no runtime available, skipping message fetch");
            return;
        };

        let fetcher = self.clone();
        let flow = target.to_string();
        runtime.spawn(async move {
            match fetcher.fetch(&flow).await {
                Ok(messages) => {
                    tracing::info!(flow = %flow, count = messages.len(), "fetched flow messages");
                }
                Err(e) => {
                    tracing::warn!(flow = %flow, error = %e, "failed to fetch flow messages");
                }
            }
        });
    }
}
