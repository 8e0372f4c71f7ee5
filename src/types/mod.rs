pub mod channel;
pub mod error;

pub use channel::{
    CallContext, ChannelId, ChannelRecord, ConsumedIncome, FreeCallClaim, FreeCallRecord,
    IncomeData, LedgerChannel, PaymentClaim,
};
pub use error::{ChannelError, ErrorClass};
