use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;

use super::{LedgerError, LedgerReader};
use crate::types::{ChannelId, LedgerChannel};

/// Reads channels from a ledger indexer exposing `GET /channels/{id}`.
pub struct HttpLedgerReader {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpLedgerReader {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, LedgerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::Unavailable(format!("failed to build client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl LedgerReader for HttpLedgerReader {
    async fn read_channel(
        &self,
        channel_id: ChannelId,
    ) -> Result<Option<LedgerChannel>, LedgerError> {
        let url = format!("{}/channels/0x{}", self.endpoint, hex::encode(channel_id.as_bytes()));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let channel: LedgerChannel = response
                    .json()
                    .await
                    .map_err(|e| LedgerError::Malformed(e.to_string()))?;
                if channel.channel_id != channel_id {
                    return Err(LedgerError::Malformed(format!(
                        "asked for {channel_id:?}, got {:?}",
                        channel.channel_id
                    )));
                }
                Ok(Some(channel))
            }
            status => {
                tracing::warn!(
                    status = %status,
                    url = %url,
                    "ledger returned non-success response"
                );
                Err(LedgerError::Unavailable(format!("ledger responded {status}")))
            }
        }
    }
}
