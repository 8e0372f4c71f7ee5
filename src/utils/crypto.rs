use ethers::types::{Address, RecoveryMessage, Signature, H256, U256};

use crate::types::{ChannelError, FreeCallClaim, PaymentClaim};

const CLAIM_PREFIX: &[u8] = b"__paygate_claim";
const FREE_CALL_PREFIX: &[u8] = b"__paygate_free_call";

pub trait U256Ext {
    fn to_be_bytes_vec(&self) -> Vec<u8>;
}

impl U256Ext for U256 {
    fn to_be_bytes_vec(&self) -> Vec<u8> {
        let mut bytes = [0u8; 32];
        self.to_big_endian(&mut bytes);
        bytes.to_vec()
    }
}

/// Bytes a channel sender signs to authorize a cumulative `amount`.
pub fn create_message(channel_id: H256, nonce: U256, amount: U256) -> Vec<u8> {
    let mut message = Vec::with_capacity(CLAIM_PREFIX.len() + 96);
    message.extend_from_slice(CLAIM_PREFIX);
    message.extend_from_slice(channel_id.as_bytes());
    message.extend_from_slice(&nonce.to_be_bytes_vec());
    message.extend_from_slice(&amount.to_be_bytes_vec());
    message
}

pub fn create_free_call_message(user: Address, group_id: H256, call_count: U256) -> Vec<u8> {
    let mut message = Vec::with_capacity(FREE_CALL_PREFIX.len() + 84);
    message.extend_from_slice(FREE_CALL_PREFIX);
    message.extend_from_slice(user.as_bytes());
    message.extend_from_slice(group_id.as_bytes());
    message.extend_from_slice(&call_count.to_be_bytes_vec());
    message
}

/// Recovers the address that signed `message` (EIP-191 personal message).
pub fn recover_signer(message: &[u8], signature: &[u8]) -> Result<Address, ChannelError> {
    let signature = Signature::try_from(signature).map_err(|_| ChannelError::InvalidSignature)?;
    signature
        .recover(RecoveryMessage::Data(message.to_vec()))
        .map_err(|e| {
            tracing::debug!(error = ?e, "signature recovery failed");
            ChannelError::InvalidSignature
        })
}

pub fn verify_claim(claim: &PaymentClaim, signer: Address) -> Result<(), ChannelError> {
    let message = create_message(claim.channel_id, claim.nonce, claim.amount);
    let recovered = recover_signer(&message, &claim.signature)?;
    if recovered != signer {
        tracing::debug!(recovered = ?recovered, expected = ?signer, "claim signer mismatch");
        return Err(ChannelError::InvalidSignature);
    }
    Ok(())
}

/// Free calls are signed by the user they are counted against.
pub fn verify_free_call(claim: &FreeCallClaim, group_id: H256) -> Result<(), ChannelError> {
    let message = create_free_call_message(claim.user, group_id, claim.call_count);
    if recover_signer(&message, &claim.signature)? != claim.user {
        return Err(ChannelError::InvalidSignature);
    }
    Ok(())
}
