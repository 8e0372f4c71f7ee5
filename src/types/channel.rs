use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};

pub type ChannelId = H256;

/// Local view of one payment channel, merged from the ledger and the amounts
/// authorized by this gateway.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub channel_id: ChannelId,
    pub sender: Address,
    pub recipient: Address,
    pub signer: Address,
    pub group_id: H256,
    pub deposit: U256,
    pub nonce: U256,
    pub authorized_amount: U256,
    /// Unix seconds.
    pub expiration: u64,
    #[serde(default)]
    pub signature: Option<Vec<u8>>,
    /// Unix seconds of the last successful ledger read.
    pub refreshed_at: u64,
}

impl ChannelRecord {
    /// Seeds a record from ledger facts. Nothing is authorized yet.
    pub fn from_ledger(ledger: &LedgerChannel, now: u64) -> Self {
        Self {
            channel_id: ledger.channel_id,
            sender: ledger.sender,
            recipient: ledger.recipient,
            signer: ledger.signer,
            group_id: ledger.group_id,
            deposit: ledger.deposit,
            nonce: ledger.nonce,
            authorized_amount: U256::zero(),
            expiration: ledger.expiration,
            signature: None,
            refreshed_at: now,
        }
    }

    pub fn is_expired(&self, now: u64, threshold: u64) -> bool {
        self.expiration <= now.saturating_add(threshold)
    }
}

/// Authoritative channel facts as reported by the ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerChannel {
    pub channel_id: ChannelId,
    pub sender: Address,
    pub recipient: Address,
    pub signer: Address,
    pub group_id: H256,
    pub deposit: U256,
    pub nonce: U256,
    pub expiration: u64,
}

/// Per-user free call counter, scoped to a service group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeCallRecord {
    pub user: Address,
    pub group_id: H256,
    pub calls_used: U256,
    #[serde(skip)]
    pub quota: U256,
}

/// A signed cumulative claim extracted from a call.
#[derive(Clone, Debug)]
pub struct PaymentClaim {
    pub channel_id: ChannelId,
    pub nonce: U256,
    pub amount: U256,
    pub signature: Vec<u8>,
}

/// A signed cumulative free call count.
#[derive(Clone, Debug)]
pub struct FreeCallClaim {
    pub user: Address,
    pub call_count: U256,
    pub signature: Vec<u8>,
}

/// Call metadata made available to pricing policies.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallContext {
    pub method: String,
    pub path: String,
    pub invoice_id: Option<String>,
}

#[derive(Clone, Debug)]
pub struct IncomeData<'a> {
    /// Difference between the claimed cumulative amount and the amount
    /// previously authorized on the channel.
    pub income: U256,
    pub context: &'a CallContext,
}

/// Attached to a forwarded request once its claim is authorized.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsumedIncome {
    pub channel_id: Option<ChannelId>,
    pub income: U256,
    pub authorized_total: U256,
}
