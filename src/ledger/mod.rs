//! Read-only access to authoritative channel facts.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{ChannelId, LedgerChannel};

pub mod http;
pub mod memory;

pub use http::HttpLedgerReader;
pub use memory::MemoryLedger;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("ledger unreachable: {0}")]
    Unavailable(String),
    #[error("ledger returned malformed channel data: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait LedgerReader: Send + Sync {
    /// Returns `None` if the ledger does not know the channel.
    async fn read_channel(
        &self,
        channel_id: ChannelId,
    ) -> Result<Option<LedgerChannel>, LedgerError>;
}
