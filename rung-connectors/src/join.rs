//! Join push notifications
//!
//! Sends a push through the Join messaging API. Without an API key the
//! notifier logs and does nothing.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::time::timeout;
use tracing::{debug, info};

use rung_exec::{ExecError, ExecResult, Notifier};

const JOIN_PUSH_URL: &str = "https://joinjoaomgcd.appspot.com/_ah/api/messaging/v1/sendPush";

const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Join push notifier.
pub struct JoinNotifier {
    client: Client,
    api_key: Option<String>,
    device_id: String,
}

impl JoinNotifier {
    /// `device_id` empty means every device on the account.
    pub fn new(api_key: Option<String>, device_id: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.filter(|k| !k.is_empty()),
            device_id: device_id.unwrap_or_default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    fn query<'a>(&'a self, api_key: &'a str, title: &'a str, text: &'a str) -> [(&'static str, &'a str); 4] {
        [
            ("apikey", api_key),
            ("title", title),
            ("text", text),
            ("deviceId", self.device_id.as_str()),
        ]
    }
}

#[async_trait]
impl Notifier for JoinNotifier {
    async fn notify(&self, title: &str, text: &str) -> ExecResult<()> {
        let Some(api_key) = self.api_key.as_deref() else {
            debug!(%title, "Join API key not set, skipping notification");
            return Ok(());
        };

        let request = self.client.get(JOIN_PUSH_URL).query(&self.query(api_key, title, text));
        let response = timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS), request.send())
            .await
            .map_err(|_| ExecError::Timeout("Join push".to_string()))?
            .map_err(|e| ExecError::Sink(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ExecError::Sink(format!("Join returned HTTP {}", response.status())));
        }

        info!(%title, "Notification sent");
        Ok(())
    }
}
