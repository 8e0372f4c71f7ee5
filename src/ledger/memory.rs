use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::{LedgerError, LedgerReader};
use crate::types::{ChannelId, LedgerChannel};

/// Ledger held in memory, for local runs and tests.
#[derive(Default)]
pub struct MemoryLedger {
    channels: DashMap<ChannelId, LedgerChannel>,
    offline: AtomicBool,
    reads: AtomicUsize,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, channel: LedgerChannel) {
        self.channels.insert(channel.channel_id, channel);
    }

    pub fn remove(&self, channel_id: &ChannelId) {
        self.channels.remove(channel_id);
    }

    /// Makes every subsequent read fail as if the ledger were unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerReader for MemoryLedger {
    async fn read_channel(
        &self,
        channel_id: ChannelId,
    ) -> Result<Option<LedgerChannel>, LedgerError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("ledger is offline".to_string()));
        }
        Ok(self.channels.get(&channel_id).map(|c| c.value().clone()))
    }
}
