use axum::http::HeaderMap;
use ethers::types::{Address, H256, U256};

use crate::types::{CallContext, ChannelError, FreeCallClaim, PaymentClaim};

pub const PAYMENT_TYPE: &str = "X-Payment-Type";
pub const CHANNEL_ID: &str = "X-Channel-Id";
pub const CHANNEL_NONCE: &str = "X-Channel-Nonce";
pub const CHANNEL_AMOUNT: &str = "X-Channel-Amount";
pub const SIGNATURE: &str = "X-Signature";
pub const FREE_CALL_USER: &str = "X-Free-Call-User";
pub const FREE_CALL_COUNT: &str = "X-Free-Call-Count";
pub const INVOICE_ID: &str = "X-Invoice-Id";

/// Payment proof carried by one call.
#[derive(Clone, Debug)]
pub enum PaymentHeaders {
    Escrow(PaymentClaim),
    FreeCall(FreeCallClaim),
}

fn required<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, ChannelError> {
    headers
        .get(name)
        .ok_or(ChannelError::MissingHeader(name))?
        .to_str()
        .map_err(|_| malformed(name, "not visible ASCII"))
}

fn malformed(header: &'static str, reason: impl Into<String>) -> ChannelError {
    ChannelError::MalformedHeader {
        header,
        reason: reason.into(),
    }
}

fn decode_hex(header: &'static str, value: &str) -> Result<Vec<u8>, ChannelError> {
    hex::decode(value.trim_start_matches("0x")).map_err(|e| malformed(header, e.to_string()))
}

fn parse_u256(header: &'static str, value: &str) -> Result<U256, ChannelError> {
    U256::from_dec_str(value.trim()).map_err(|e| malformed(header, format!("{e:?}")))
}

fn parse_channel_id(value: &str) -> Result<H256, ChannelError> {
    let bytes = decode_hex(CHANNEL_ID, value)?;
    if bytes.len() != 32 {
        return Err(malformed(CHANNEL_ID, "expected 32 bytes"));
    }
    Ok(H256::from_slice(&bytes))
}

fn parse_address(header: &'static str, value: &str) -> Result<Address, ChannelError> {
    let bytes = decode_hex(header, value)?;
    if bytes.len() != 20 {
        return Err(malformed(header, "expected 20 bytes"));
    }
    Ok(Address::from_slice(&bytes))
}

impl PaymentHeaders {
    pub fn parse(headers: &HeaderMap) -> Result<Self, ChannelError> {
        let payment_type = match headers.get(PAYMENT_TYPE) {
            Some(value) => value
                .to_str()
                .map_err(|_| malformed(PAYMENT_TYPE, "not visible ASCII"))?,
            None => "escrow",
        };

        let signature = decode_hex(SIGNATURE, required(headers, SIGNATURE)?)?;
        match payment_type {
            "escrow" => Ok(PaymentHeaders::Escrow(PaymentClaim {
                channel_id: parse_channel_id(required(headers, CHANNEL_ID)?)?,
                nonce: parse_u256(CHANNEL_NONCE, required(headers, CHANNEL_NONCE)?)?,
                amount: parse_u256(CHANNEL_AMOUNT, required(headers, CHANNEL_AMOUNT)?)?,
                signature,
            })),
            "free-call" => Ok(PaymentHeaders::FreeCall(FreeCallClaim {
                user: parse_address(FREE_CALL_USER, required(headers, FREE_CALL_USER)?)?,
                call_count: parse_u256(FREE_CALL_COUNT, required(headers, FREE_CALL_COUNT)?)?,
                signature,
            })),
            other => Err(malformed(PAYMENT_TYPE, format!("unknown payment type {other}"))),
        }
    }
}

pub fn call_context(method: &str, path: &str, headers: &HeaderMap) -> CallContext {
    CallContext {
        method: method.to_string(),
        path: path.to_string(),
        invoice_id: headers
            .get(INVOICE_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    }
}
