use async_trait::async_trait;
use ethers::types::{Address, H256, U256};

use super::authorize::{Authorized, Authorizer, Metered, RecordSource};
use crate::{
    types::{CallContext, ChannelError, FreeCallClaim, FreeCallRecord},
    validator::FixedPriceValidator,
};

pub const FREE_CALL_PREFIX: &str = "/free-call/";

impl Metered for FreeCallRecord {
    type Claim = FreeCallClaim;

    fn claimed(claim: &FreeCallClaim) -> U256 {
        claim.call_count
    }

    fn consumed(&self) -> U256 {
        self.calls_used
    }

    fn limit(&self) -> U256 {
        self.quota
    }

    fn exceeded(&self, claimed: U256) -> ChannelError {
        ChannelError::FreeCallQuotaExceeded {
            claimed,
            quota: self.quota,
        }
    }

    fn accept(&mut self, claim: &FreeCallClaim) {
        self.calls_used = claim.call_count;
    }
}

/// Counts free calls per user against a fixed quota, one call at a time.
pub struct FreeCallService {
    authorizer: Authorizer,
    group_id: H256,
    quota: U256,
    validator: FixedPriceValidator,
}

impl FreeCallService {
    pub fn new(authorizer: Authorizer, group_id: H256, quota: U256) -> Self {
        Self {
            authorizer,
            group_id,
            quota,
            validator: FixedPriceValidator::unit(),
        }
    }

    pub fn group_id(&self) -> H256 {
        self.group_id
    }

    pub fn key(&self, user: &Address) -> String {
        format!(
            "{}0x{}/0x{}",
            FREE_CALL_PREFIX,
            hex::encode(self.group_id.as_bytes()),
            hex::encode(user.as_bytes())
        )
    }

    pub async fn authorize_call(
        &self,
        claim: &FreeCallClaim,
        context: &CallContext,
    ) -> Result<Authorized<FreeCallRecord>, ChannelError> {
        let key = self.key(&claim.user);
        self.authorizer
            .authorize(&key, self, claim, &self.validator, context)
            .await
    }
}

#[async_trait]
impl RecordSource<FreeCallRecord> for FreeCallService {
    async fn resolve(
        &self,
        stored: Option<FreeCallRecord>,
        claim: &FreeCallClaim,
    ) -> Result<FreeCallRecord, ChannelError> {
        let mut record = stored.unwrap_or_else(|| FreeCallRecord {
            user: claim.user,
            group_id: self.group_id,
            calls_used: U256::zero(),
            quota: self.quota,
        });
        // The quota is configuration, not state.
        record.quota = self.quota;
        Ok(record)
    }
}
