use async_trait::async_trait;
use ethers::types::{H256, U256};
use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use super::authorize::{bounded, Authorized, Authorizer, Metered, RecordSource};
use crate::{
    ledger::LedgerReader,
    types::{
        CallContext, ChannelError, ChannelId, ChannelRecord, LedgerChannel, PaymentClaim,
    },
    utils::crypto::verify_claim,
    validator::IncomeValidator,
};

pub const CHANNEL_PREFIX: &str = "/channel/";

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Clone, Debug)]
pub struct ChannelSettings {
    /// Only channels opened for this group are served.
    pub group_id: H256,
    /// Seconds after which a stored record is re-read from the ledger.
    pub refresh_interval_secs: u64,
    /// Channels expiring within this many seconds are treated as expired.
    pub expiration_threshold_secs: u64,
}

impl Metered for ChannelRecord {
    type Claim = PaymentClaim;

    fn claimed(claim: &PaymentClaim) -> U256 {
        claim.amount
    }

    fn consumed(&self) -> U256 {
        self.authorized_amount
    }

    fn limit(&self) -> U256 {
        self.deposit
    }

    fn exceeded(&self, claimed: U256) -> ChannelError {
        ChannelError::InsufficientDeposit {
            claimed,
            deposit: self.deposit,
        }
    }

    fn accept(&mut self, claim: &PaymentClaim) {
        self.authorized_amount = claim.amount;
        self.signature = Some(claim.signature.clone());
    }
}

/// Merges ledger facts into the stored view.
///
/// A higher ledger nonce means the previous channel state was claimed, so
/// authorization starts again from zero. A lagging ledger never rolls the
/// stored nonce back.
pub(crate) fn reconcile(
    stored: Option<ChannelRecord>,
    ledger: &LedgerChannel,
    now: u64,
) -> ChannelRecord {
    match stored {
        None => ChannelRecord::from_ledger(ledger, now),
        Some(record) if ledger.nonce > record.nonce => {
            tracing::info!(
                channel_id = ?ledger.channel_id,
                old_nonce = %record.nonce,
                new_nonce = %ledger.nonce,
                "channel nonce advanced on ledger"
            );
            ChannelRecord::from_ledger(ledger, now)
        }
        Some(mut record) => {
            if ledger.nonce == record.nonce {
                record.deposit = ledger.deposit;
            }
            record.sender = ledger.sender;
            record.recipient = ledger.recipient;
            record.signer = ledger.signer;
            record.group_id = ledger.group_id;
            record.expiration = ledger.expiration;
            record.refreshed_at = now;
            record
        }
    }
}

/// Owns channel records: every write to them goes through this service.
pub struct PaymentChannelService {
    authorizer: Authorizer,
    ledger: Arc<dyn LedgerReader>,
    settings: ChannelSettings,
}

impl PaymentChannelService {
    pub fn new(
        authorizer: Authorizer,
        ledger: Arc<dyn LedgerReader>,
        settings: ChannelSettings,
    ) -> Self {
        Self {
            authorizer,
            ledger,
            settings,
        }
    }

    pub fn settings(&self) -> &ChannelSettings {
        &self.settings
    }

    pub fn key(channel_id: &ChannelId) -> String {
        format!("{}0x{}", CHANNEL_PREFIX, hex::encode(channel_id.as_bytes()))
    }

    fn is_stale(&self, record: &ChannelRecord, now: u64) -> bool {
        now.saturating_sub(record.refreshed_at) >= self.settings.refresh_interval_secs
    }

    async fn read_ledger(&self, channel_id: ChannelId) -> Result<LedgerChannel, ChannelError> {
        bounded(
            self.authorizer.operation_timeout(),
            "ledger read",
            self.ledger.read_channel(channel_id),
        )
        .await?
        .ok_or(ChannelError::ChannelNotFound(channel_id))
    }

    /// Current view of a channel. Never writes.
    ///
    /// The stored record is returned while fresh. Otherwise the ledger is
    /// consulted; if it cannot be reached a stored record is still served,
    /// since callers only read from it.
    pub async fn get_channel(&self, channel_id: ChannelId) -> Result<ChannelRecord, ChannelError> {
        let key = Self::key(&channel_id);
        let stored = bounded(
            self.authorizer.operation_timeout(),
            "storage read",
            self.authorizer.typed::<ChannelRecord>().get(&key),
        )
        .await?
        .map(|v| v.value);

        let now = unix_now();
        match stored {
            Some(record) if !self.is_stale(&record, now) => Ok(record),
            stored => match self.read_ledger(channel_id).await {
                Ok(ledger) => Ok(reconcile(stored, &ledger, now)),
                Err(ChannelError::BackendUnavailable(reason)) => match stored {
                    Some(record) => {
                        tracing::warn!(
                            channel_id = ?channel_id,
                            %reason,
                            "serving stored channel while ledger is unavailable"
                        );
                        Ok(record)
                    }
                    None => Err(ChannelError::BackendUnavailable(reason)),
                },
                Err(e) => Err(e),
            },
        }
    }

    /// Authorizes `claim.amount - authorized_amount` as this call's income.
    pub async fn authorize_increment(
        &self,
        claim: &PaymentClaim,
        validator: &dyn IncomeValidator,
        context: &CallContext,
    ) -> Result<Authorized<ChannelRecord>, ChannelError> {
        let key = Self::key(&claim.channel_id);
        let source = LedgerSource { service: self };
        self.authorizer
            .authorize(&key, &source, claim, validator, context)
            .await
    }
}

struct LedgerSource<'a> {
    service: &'a PaymentChannelService,
}

#[async_trait]
impl RecordSource<ChannelRecord> for LedgerSource<'_> {
    async fn resolve(
        &self,
        stored: Option<ChannelRecord>,
        claim: &PaymentClaim,
    ) -> Result<ChannelRecord, ChannelError> {
        let service = self.service;
        let settings = &service.settings;
        let now = unix_now();

        let record = match stored {
            Some(record)
                if !service.is_stale(&record, now)
                    && claim.nonce == record.nonce
                    && claim.amount <= record.deposit
                    && !record.is_expired(now, settings.expiration_threshold_secs) =>
            {
                record
            }
            stored => {
                // Nothing is written unless this read succeeds.
                let ledger = service.read_ledger(claim.channel_id).await?;
                reconcile(stored, &ledger, now)
            }
        };

        if record.group_id != settings.group_id {
            return Err(ChannelError::GroupMismatch(claim.channel_id));
        }
        if record.is_expired(now, settings.expiration_threshold_secs) {
            return Err(ChannelError::ChannelExpired(claim.channel_id));
        }
        if claim.nonce != record.nonce {
            return Err(ChannelError::NonceMismatch {
                claimed: claim.nonce,
                current: record.nonce,
            });
        }
        // The signer may have changed since the lock-free check.
        verify_claim(claim, record.signer)?;
        Ok(record)
    }
}
