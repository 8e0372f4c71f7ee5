use axum::{
    extract::{Path, State},
    Json,
};
use ethers::types::H256;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::{state::PaymentChannelService, types::ChannelError};

fn parse_channel_id(raw: &str) -> Result<H256, ChannelError> {
    let bytes = hex::decode(raw.trim_start_matches("0x"))
        .map_err(|e| ChannelError::InvalidChannelId(e.to_string()))?;
    if bytes.len() != 32 {
        return Err(ChannelError::InvalidChannelId("expected 32 bytes".into()));
    }
    Ok(H256::from_slice(&bytes))
}

/// What a client needs to sign its next cumulative claim.
pub async fn channel_state_handler(
    State(channels): State<Arc<PaymentChannelService>>,
    Path(channel_id): Path<String>,
) -> Result<Json<Value>, ChannelError> {
    let channel = channels.get_channel(parse_channel_id(&channel_id)?).await?;
    Ok(Json(json!({
        "channel_id": format!("0x{}", hex::encode(channel.channel_id.as_bytes())),
        "nonce": channel.nonce.to_string(),
        "authorized_amount": channel.authorized_amount.to_string(),
        "deposit": channel.deposit.to_string(),
        "signer": format!("{:?}", channel.signer),
        "expiration": channel.expiration,
        "signature": channel.signature.map(hex::encode),
    })))
}
