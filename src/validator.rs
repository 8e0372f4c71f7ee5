//! Pricing policies deciding whether a call's income pays for it.

use ethers::types::U256;
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};

use crate::types::{ChannelError, IncomeData};

/// Checks that a call was paid correctly by the channel sender.
///
/// Implementations may price calls differently, per method or per invoice,
/// using whatever the [`CallContext`](crate::types::CallContext) carries.
pub trait IncomeValidator: Send + Sync {
    fn validate(&self, data: &IncomeData<'_>) -> Result<(), ChannelError>;
}

/// Approves only an income exactly equal to the price.
#[derive(Clone, Debug)]
pub struct FixedPriceValidator {
    price: U256,
}

impl FixedPriceValidator {
    pub fn new(price: U256) -> Self {
        Self { price }
    }

    /// One unit per call, used for call counting.
    pub fn unit() -> Self {
        Self::new(U256::one())
    }
}

impl IncomeValidator for FixedPriceValidator {
    fn validate(&self, data: &IncomeData<'_>) -> Result<(), ChannelError> {
        check_exact(data.income, self.price)
    }
}

fn check_exact(income: U256, price: U256) -> Result<(), ChannelError> {
    if income != price {
        return Err(ChannelError::PriceMismatch { income, price });
    }
    Ok(())
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PriceTable {
    pub default_price: U256,
    /// Request path to price.
    pub method_prices: HashMap<String, U256>,
}

impl PriceTable {
    pub fn fixed(price: U256) -> Self {
        Self {
            default_price: price,
            method_prices: HashMap::new(),
        }
    }

    pub fn price_for(&self, path: &str) -> U256 {
        self.method_prices
            .get(path)
            .copied()
            .unwrap_or(self.default_price)
    }
}

/// Shared handle through which the configuration side swaps prices at runtime.
#[derive(Clone, Debug, Default)]
pub struct PriceHandle {
    table: Arc<RwLock<PriceTable>>,
}

impl PriceHandle {
    pub fn new(table: PriceTable) -> Self {
        Self {
            table: Arc::new(RwLock::new(table)),
        }
    }

    /// Consistent copy of the current table.
    pub fn snapshot(&self) -> PriceTable {
        self.table.read().clone()
    }

    pub fn replace(&self, table: PriceTable) {
        *self.table.write() = table;
        tracing::info!("price table replaced");
    }
}

/// Prices each call by its request path, falling back to the default price.
#[derive(Clone, Debug)]
pub struct MethodPriceValidator {
    prices: PriceHandle,
}

impl MethodPriceValidator {
    pub fn new(prices: PriceHandle) -> Self {
        Self { prices }
    }
}

impl IncomeValidator for MethodPriceValidator {
    fn validate(&self, data: &IncomeData<'_>) -> Result<(), ChannelError> {
        // A single read lock keeps the whole validation on one table version.
        let price = self.prices.table.read().price_for(&data.context.path);
        check_exact(data.income, price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CallContext;

    fn data(income: u64, context: &CallContext) -> IncomeData<'_> {
        IncomeData {
            income: U256::from(income),
            context,
        }
    }

    #[test]
    fn test_fixed_price_requires_exact_income() {
        let validator = FixedPriceValidator::new(U256::from(10));
        let ctx = CallContext::default();

        assert!(validator.validate(&data(10, &ctx)).is_ok());
        assert!(matches!(
            validator.validate(&data(9, &ctx)),
            Err(ChannelError::PriceMismatch { .. })
        ));
        // Overpayment is rejected too.
        assert!(matches!(
            validator.validate(&data(11, &ctx)),
            Err(ChannelError::PriceMismatch { .. })
        ));
    }

    #[test]
    fn test_method_prices_follow_table_updates() {
        let mut table = PriceTable::fixed(U256::from(10));
        table
            .method_prices
            .insert("/expensive".to_string(), U256::from(50));
        let handle = PriceHandle::new(table);
        let validator = MethodPriceValidator::new(handle.clone());

        let cheap = CallContext {
            path: "/cheap".to_string(),
            ..Default::default()
        };
        let expensive = CallContext {
            path: "/expensive".to_string(),
            ..Default::default()
        };
        assert!(validator.validate(&data(10, &cheap)).is_ok());
        assert!(validator.validate(&data(50, &expensive)).is_ok());
        assert!(validator.validate(&data(10, &expensive)).is_err());

        handle.replace(PriceTable::fixed(U256::from(3)));
        assert!(validator.validate(&data(3, &expensive)).is_ok());
        assert_eq!(handle.snapshot().default_price, U256::from(3));
    }
}
