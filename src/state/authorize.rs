use async_trait::async_trait;
use ethers::types::U256;
use serde::{de::DeserializeOwned, Serialize};
use std::{future::Future, sync::Arc, time::Duration};

use crate::{
    lock::Locker,
    storage::{AtomicStorage, TypedStorage},
    types::{CallContext, ChannelError, IncomeData},
    validator::IncomeValidator,
};

/// A stored record tracking a cumulative, monotonically growing quantity
/// (authorized money on a channel, or calls used out of a free quota).
pub trait Metered: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    type Claim: Send + Sync;

    fn claimed(claim: &Self::Claim) -> U256;

    fn consumed(&self) -> U256;

    fn limit(&self) -> U256;

    /// Error reported when a claim goes beyond [`Metered::limit`].
    fn exceeded(&self, claimed: U256) -> ChannelError;

    /// Records an approved claim.
    fn accept(&mut self, claim: &Self::Claim);
}

/// Produces the current record under the lock, from storage and whatever
/// outside facts it needs.
#[async_trait]
pub trait RecordSource<R: Metered>: Send + Sync {
    async fn resolve(&self, stored: Option<R>, claim: &R::Claim) -> Result<R, ChannelError>;
}

#[derive(Debug, Clone)]
pub struct Authorized<R> {
    pub record: R,
    pub income: U256,
}

/// Runs `fut`, mapping an elapsed `timeout` to `BackendUnavailable`.
pub(crate) async fn bounded<T, E, F>(
    timeout: Duration,
    what: &str,
    fut: F,
) -> Result<T, ChannelError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<ChannelError>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(ChannelError::BackendUnavailable(format!(
            "{what} timed out after {timeout:?}"
        ))),
    }
}

/// The lock, load, validate, compare-and-swap pipeline shared by paid and
/// free calls.
#[derive(Clone)]
pub struct Authorizer {
    storage: Arc<dyn AtomicStorage>,
    locker: Arc<dyn Locker>,
    cas_retries: u32,
    operation_timeout: Duration,
    lock_timeout: Duration,
}

impl Authorizer {
    pub fn new(
        storage: Arc<dyn AtomicStorage>,
        locker: Arc<dyn Locker>,
        cas_retries: u32,
        operation_timeout: Duration,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            storage,
            locker,
            cas_retries,
            operation_timeout,
            lock_timeout,
        }
    }

    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    pub(crate) fn typed<R: Metered>(&self) -> TypedStorage<R> {
        TypedStorage::new(self.storage.clone())
    }

    pub async fn authorize<R, S>(
        &self,
        key: &str,
        source: &S,
        claim: &R::Claim,
        validator: &dyn IncomeValidator,
        context: &CallContext,
    ) -> Result<Authorized<R>, ChannelError>
    where
        R: Metered,
        S: RecordSource<R> + ?Sized,
    {
        let guard = match tokio::time::timeout(self.lock_timeout, self.locker.lock(key)).await {
            Ok(guard) => guard?,
            Err(_) => {
                return Err(ChannelError::LockTimeout {
                    key: key.to_string(),
                    attempts: self.locker.attempt_budget(),
                })
            }
        };

        let result = self
            .authorize_locked(key, source, claim, validator, context)
            .await;

        if let Err(e) = guard.unlock().await {
            tracing::warn!(key = %key, error = %e, "failed to release lock, lease will expire");
        }
        result
    }

    async fn authorize_locked<R, S>(
        &self,
        key: &str,
        source: &S,
        claim: &R::Claim,
        validator: &dyn IncomeValidator,
        context: &CallContext,
    ) -> Result<Authorized<R>, ChannelError>
    where
        R: Metered,
        S: RecordSource<R> + ?Sized,
    {
        let records = self.typed::<R>();
        let claimed = R::claimed(claim);

        for attempt in 0..=self.cas_retries {
            let stored = bounded(self.operation_timeout, "storage read", records.get(key)).await?;
            let record = source
                .resolve(stored.as_ref().map(|v| v.value.clone()), claim)
                .await?;

            let authorized = record.consumed();
            if claimed < authorized {
                return Err(ChannelError::NegativeIncome { claimed, authorized });
            }
            if claimed > record.limit() {
                return Err(record.exceeded(claimed));
            }

            let income = claimed - authorized;
            if let Err(rejection) = validator.validate(&IncomeData { income, context }) {
                if income.is_zero() {
                    // Resubmitted claim: report it as the replay it is.
                    return Err(ChannelError::NegativeIncome { claimed, authorized });
                }
                return Err(rejection);
            }

            let mut next = record;
            next.accept(claim);
            let swapped = bounded(
                self.operation_timeout,
                "storage write",
                records.compare_and_swap(key, stored.as_ref(), &next),
            )
            .await?;

            if swapped {
                tracing::debug!(
                    key = %key,
                    income = %income,
                    total = %claimed,
                    "income authorized"
                );
                return Ok(Authorized {
                    record: next,
                    income,
                });
            }
            tracing::warn!(key = %key, attempt, "record changed under lock, retrying");
        }

        tracing::error!(key = %key, "compare-and-swap kept failing under lock");
        Err(ChannelError::ConcurrencyViolation(key.to_string()))
    }
}
