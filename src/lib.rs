//! Payment-channel gate for metered HTTP services.
//!
//! Every protected call carries a signed cumulative claim on a payment
//! channel. The gate checks the signature, authorizes exactly the call's price
//! as new income under a per-channel lock, and only then forwards the call.

use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use ethers::types::U256;
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;

pub mod config;
pub mod handlers;
pub mod ledger;
pub mod lock;
pub mod middleware;
pub mod observer;
pub mod state;
pub mod storage;
pub mod types;
pub mod utils;
pub mod validator;

use crate::{
    config::{ConfigError, GatewayConfig, StorageKind},
    handlers::{channel_state_handler, protected_handler},
    ledger::{HttpLedgerReader, LedgerError, LedgerReader},
    lock::{LocalLocker, Locker, StorageLocker},
    middleware::{bypass_middleware, payment_middleware, PaymentGate},
    observer::{PaymentObserver, TracingObserver},
    state::{Authorizer, FreeCallService, PaymentChannelService},
    storage::{AtomicStorage, MemStorage, SqliteStorage, StorageError},
    validator::{IncomeValidator, MethodPriceValidator, PriceHandle},
};

#[derive(Error, Debug)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Storage, the SQLite handle kept for shutdown, and the matching locker.
type Backend = (Arc<dyn AtomicStorage>, Option<SqliteStorage>, Arc<dyn Locker>);

/// The assembled gateway. Built once at startup, torn down by [`Components::shutdown`].
pub struct Components {
    config: GatewayConfig,
    storage: Arc<dyn AtomicStorage>,
    sqlite: Option<SqliteStorage>,
    prices: PriceHandle,
    observer: Arc<dyn PaymentObserver>,
    /// `None` when the ledger is disabled.
    gate: Option<PaymentGate>,
}

impl Components {
    /// Builds every component from configuration, connecting to the configured
    /// ledger endpoint.
    pub fn build(config: GatewayConfig) -> Result<Self, StartupError> {
        config.validate()?;
        let ledger: Option<Arc<dyn LedgerReader>> =
            match (&config.ledger.endpoint, config.ledger.enabled) {
                (Some(endpoint), true) => Some(Arc::new(HttpLedgerReader::new(
                    endpoint.clone(),
                    config.operation_timeout(),
                )?)),
                _ => None,
            };
        Self::assemble(config, ledger)
    }

    /// Like [`Components::build`] but reads channels from `ledger`, so no
    /// ledger endpoint needs to be configured.
    pub fn with_ledger(
        config: GatewayConfig,
        ledger: Arc<dyn LedgerReader>,
    ) -> Result<Self, StartupError> {
        config.validate_settings()?;
        Self::assemble(config, Some(ledger))
    }

    fn assemble(
        config: GatewayConfig,
        ledger: Option<Arc<dyn LedgerReader>>,
    ) -> Result<Self, StartupError> {
        let lock_settings = config.lock_settings();
        let (storage, sqlite, locker): Backend = match config.storage.kind {
            StorageKind::Memory => (
                Arc::new(MemStorage::new()),
                None,
                Arc::new(LocalLocker::new(lock_settings.clone())),
            ),
            StorageKind::Sqlite => {
                let sqlite = SqliteStorage::open(&config.storage.path)?;
                let shared: Arc<dyn AtomicStorage> = Arc::new(sqlite.clone());
                (
                    shared.clone(),
                    Some(sqlite),
                    Arc::new(StorageLocker::new(shared, lock_settings.clone())),
                )
            }
        };
        tracing::info!(kind = ?config.storage.kind, "payment channel storage ready");

        let prices = PriceHandle::new(config.pricing.table());
        let observer: Arc<dyn PaymentObserver> = Arc::new(TracingObserver);

        let gate = match ledger.filter(|_| config.ledger.enabled) {
            Some(ledger) => {
                tracing::info!("ledger is enabled: payment validation active");
                let authorizer = Authorizer::new(
                    storage.clone(),
                    locker,
                    config.cas_retries,
                    config.operation_timeout(),
                    lock_settings.wait_bound() + config.operation_timeout(),
                );
                let channels = Arc::new(PaymentChannelService::new(
                    authorizer.clone(),
                    ledger,
                    config.channel_settings()?,
                ));
                let free_calls = config.free_call.enabled.then(|| {
                    Arc::new(FreeCallService::new(
                        authorizer,
                        channels.settings().group_id,
                        U256::from(config.free_call.quota),
                    ))
                });
                Some(PaymentGate {
                    channels,
                    free_calls,
                    validator: Arc::new(MethodPriceValidator::new(prices.clone())),
                    observer: observer.clone(),
                })
            }
            None => {
                tracing::info!("ledger is disabled: no payment validation");
                None
            }
        };

        Ok(Self {
            config,
            storage,
            sqlite,
            prices,
            observer,
            gate,
        })
    }

    /// Replaces the pricing policy.
    pub fn with_validator(mut self, validator: Arc<dyn IncomeValidator>) -> Self {
        if let Some(gate) = self.gate.as_mut() {
            gate.validator = validator;
        }
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn PaymentObserver>) -> Self {
        if let Some(gate) = self.gate.as_mut() {
            gate.observer = observer.clone();
        }
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn storage(&self) -> Arc<dyn AtomicStorage> {
        self.storage.clone()
    }

    /// Runtime price updates go through this handle.
    pub fn prices(&self) -> &PriceHandle {
        &self.prices
    }

    pub fn gate(&self) -> Option<&PaymentGate> {
        self.gate.as_ref()
    }

    /// Puts every route of `router` behind payment enforcement.
    pub fn protect(&self, router: Router) -> Router {
        match &self.gate {
            Some(gate) => router.layer(from_fn_with_state(gate.clone(), payment_middleware)),
            None => router.layer(from_fn_with_state(
                self.observer.clone(),
                bypass_middleware,
            )),
        }
    }

    /// Unmetered routes serving channel state to clients. Empty when the
    /// ledger is disabled.
    pub fn state_router(&self) -> Router {
        match &self.gate {
            Some(gate) => Router::new()
                .route("/channels/:id/state", get(channel_state_handler))
                .with_state(gate.channels.clone()),
            None => Router::new(),
        }
    }

    pub fn create_protected_router(&self) -> Router {
        self.protect(Router::new().route("/protected", post(protected_handler)))
            .merge(self.state_router())
            .layer(TraceLayer::new_for_http())
    }

    pub async fn shutdown(self) {
        if let Some(sqlite) = &self.sqlite {
            if let Err(e) = sqlite.checkpoint().await {
                tracing::warn!(error = %e, "failed to checkpoint storage on shutdown");
            }
        }
        tracing::info!("payment gateway shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ledger::MemoryLedger,
        middleware::headers::{
            CHANNEL_AMOUNT, CHANNEL_ID, CHANNEL_NONCE, FREE_CALL_COUNT, FREE_CALL_USER,
            PAYMENT_TYPE, SIGNATURE,
        },
        types::LedgerChannel,
        utils::crypto::{create_free_call_message, create_message},
    };
    use axum::{
        body::Body,
        http::{self, HeaderMap, HeaderValue, Request, StatusCode},
    };
    use ethers::{
        signers::{LocalWallet, Signer},
        types::{Address, H256},
    };
    use std::{
        str::FromStr,
        time::{SystemTime, UNIX_EPOCH},
    };
    use tower::util::ServiceExt;

    // Helper function to create a test wallet with a known private key
    fn create_test_wallet() -> LocalWallet {
        LocalWallet::from_str("1234567890123456789012345678901234567890123456789012345678901234")
            .unwrap()
    }

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    fn create_test_channel(wallet: &LocalWallet, deposit: u64) -> LedgerChannel {
        LedgerChannel {
            channel_id: H256::random(),
            sender: wallet.address(),
            recipient: Address::random(),
            signer: wallet.address(),
            group_id: H256::zero(),
            deposit: U256::from(deposit),
            nonce: U256::zero(),
            expiration: now() + 86_400,
        }
    }

    fn test_config(price: u64) -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.pricing.price = price;
        config.free_call.enabled = true;
        config.free_call.quota = 2;
        config
    }

    fn create_app(channel: &LedgerChannel, price: u64) -> Router {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.insert(channel.clone());
        Components::with_ledger(test_config(price), ledger)
            .unwrap()
            .create_protected_router()
    }

    async fn create_signed_headers(
        wallet: &LocalWallet,
        channel: &LedgerChannel,
        amount: u64,
    ) -> HeaderMap {
        let message = create_message(channel.channel_id, channel.nonce, U256::from(amount));
        let signature = wallet.sign_message(&message).await.unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            CHANNEL_ID,
            HeaderValue::from_str(&channel_id_hex(channel)).unwrap(),
        );
        headers.insert(
            CHANNEL_NONCE,
            HeaderValue::from_str(&channel.nonce.to_string()).unwrap(),
        );
        headers.insert(CHANNEL_AMOUNT, HeaderValue::from_str(&amount.to_string()).unwrap());
        headers.insert(
            SIGNATURE,
            HeaderValue::from_str(&hex::encode(signature.to_vec())).unwrap(),
        );
        headers
    }

    fn channel_id_hex(channel: &LedgerChannel) -> String {
        format!("0x{}", hex::encode(channel.channel_id.as_bytes()))
    }

    async fn send_test_request(app: Router, headers: HeaderMap) -> axum::response::Response {
        let request = Request::builder()
            .method(http::Method::POST)
            .uri("/protected")
            .body(Body::from("test data"))
            .unwrap();

        let request = {
            let (mut parts, body) = request.into_parts();
            parts.headers = headers;
            Request::from_parts(parts, body)
        };

        app.oneshot(request).await.unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_valid_request() {
        let wallet = create_test_wallet();
        let channel = create_test_channel(&wallet, 100);
        let app = create_app(&channel, 10);

        let headers = create_signed_headers(&wallet, &channel, 10).await;
        let response = send_test_request(app, headers).await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["income"], "10");
        assert_eq!(body["authorized_total"], "10");
    }

    #[tokio::test]
    async fn test_invalid_signature() {
        let wallet = create_test_wallet();
        let channel = create_test_channel(&wallet, 100);
        let app = create_app(&channel, 10);

        let mut headers = create_signed_headers(&wallet, &channel, 10).await;
        let other = LocalWallet::new(&mut rand::thread_rng());
        let forged = other
            .sign_message(create_message(channel.channel_id, channel.nonce, U256::from(10)))
            .await
            .unwrap();
        headers.insert(SIGNATURE, HeaderValue::from_str(&hex::encode(forged.to_vec())).unwrap());

        let response = send_test_request(app, headers).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"], "invalid_signature");
    }

    #[tokio::test]
    async fn test_missing_headers() {
        let wallet = create_test_wallet();
        let channel = create_test_channel(&wallet, 100);
        let app = create_app(&channel, 10);

        for header_name in [SIGNATURE, CHANNEL_ID, CHANNEL_NONCE, CHANNEL_AMOUNT] {
            let mut headers = create_signed_headers(&wallet, &channel, 10).await;
            headers.remove(header_name);

            let response = send_test_request(app.clone(), headers).await;
            assert_eq!(
                response.status(),
                StatusCode::UNAUTHORIZED,
                "Request missing {} should be unauthorized",
                header_name
            );
        }

        let mut headers = create_signed_headers(&wallet, &channel, 10).await;
        headers.insert(SIGNATURE, HeaderValue::from_static("invalid-signature"));
        let response = send_test_request(app, headers).await;
        assert_eq!(
            response.status(),
            StatusCode::BAD_REQUEST,
            "Request with malformed signature should be bad request"
        );
    }

    #[tokio::test]
    async fn test_insufficient_deposit() {
        let wallet = create_test_wallet();
        let channel = create_test_channel(&wallet, 5);
        let app = create_app(&channel, 10);

        let headers = create_signed_headers(&wallet, &channel, 10).await;
        let response = send_test_request(app, headers).await;

        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[tokio::test]
    async fn test_replayed_claim_rejected() {
        let wallet = create_test_wallet();
        let channel = create_test_channel(&wallet, 100);
        let app = create_app(&channel, 10);

        let headers = create_signed_headers(&wallet, &channel, 10).await;
        let response = send_test_request(app.clone(), headers.clone()).await;
        assert_eq!(response.status(), StatusCode::OK, "First request should succeed");

        let response = send_test_request(app.clone(), headers).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"], "negative_income");

        let headers = create_signed_headers(&wallet, &channel, 20).await;
        let response = send_test_request(app, headers).await;
        assert_eq!(response.status(), StatusCode::OK, "Next increment should succeed");
    }

    #[tokio::test]
    async fn test_wrong_price_rejected() {
        let wallet = create_test_wallet();
        let channel = create_test_channel(&wallet, 100);
        let app = create_app(&channel, 10);

        let headers = create_signed_headers(&wallet, &channel, 15).await;
        let response = send_test_request(app, headers).await;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["error"], "price_mismatch");
        assert_eq!(body["message"], "income 15 does not equal to price 10");
    }

    #[tokio::test]
    async fn test_disabled_ledger_forwards_everything() {
        let mut config = GatewayConfig::default();
        config.ledger.enabled = false;
        let app = Components::build(config).unwrap().create_protected_router();

        let response = send_test_request(app, HeaderMap::new()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_free_calls_up_to_quota() {
        let wallet = create_test_wallet();
        let channel = create_test_channel(&wallet, 100);
        let app = create_app(&channel, 10);

        for (count, expected) in [
            (1u64, StatusCode::OK),
            (2, StatusCode::OK),
            (3, StatusCode::FORBIDDEN),
        ] {
            let message =
                create_free_call_message(wallet.address(), H256::zero(), U256::from(count));
            let signature = wallet.sign_message(&message).await.unwrap();

            let mut headers = HeaderMap::new();
            headers.insert(PAYMENT_TYPE, HeaderValue::from_static("free-call"));
            headers.insert(
                FREE_CALL_USER,
                HeaderValue::from_str(&format!("{:?}", wallet.address())).unwrap(),
            );
            headers.insert(FREE_CALL_COUNT, HeaderValue::from_str(&count.to_string()).unwrap());
            headers.insert(
                SIGNATURE,
                HeaderValue::from_str(&hex::encode(signature.to_vec())).unwrap(),
            );

            let response = send_test_request(app.clone(), headers).await;
            assert_eq!(response.status(), expected, "free call {count}");
        }
    }

    #[tokio::test]
    async fn test_channel_state_follows_authorizations() {
        let wallet = create_test_wallet();
        let channel = create_test_channel(&wallet, 100);
        let app = create_app(&channel, 10);

        let headers = create_signed_headers(&wallet, &channel, 10).await;
        let response = send_test_request(app.clone(), headers.clone()).await;
        assert_eq!(response.status(), StatusCode::OK);

        let request = Request::builder()
            .method(http::Method::GET)
            .uri(format!("/channels/{}/state", channel_id_hex(&channel)))
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["nonce"], "0");
        assert_eq!(body["authorized_amount"], "10");
        assert_eq!(body["deposit"], "100");
        assert_eq!(
            body["signature"],
            headers[SIGNATURE].to_str().unwrap().to_string()
        );

        let request = Request::builder()
            .method(http::Method::GET)
            .uri(format!("/channels/0x{}/state", hex::encode([0x77u8; 32])))
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let request = Request::builder()
            .method(http::Method::GET)
            .uri("/channels/not-hex/state")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_with_ledger_validates_config() {
        let mut config = test_config(10);
        config.lock.max_attempts = 0;
        let result = Components::with_ledger(config, Arc::new(MemoryLedger::new()));
        assert!(matches!(result, Err(StartupError::Config(_))));
    }
}
