use axum::{Extension, Json};
use serde_json::{json, Value};

use crate::types::ConsumedIncome;

pub async fn protected_handler(consumed: Option<Extension<ConsumedIncome>>) -> Json<Value> {
    match consumed {
        Some(Extension(consumed)) => Json(json!({
            "message": "Access granted!",
            "income": consumed.income.to_string(),
            "authorized_total": consumed.authorized_total.to_string(),
        })),
        None => Json(json!({ "message": "Access granted!" })),
    }
}
