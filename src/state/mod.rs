pub mod authorize;
pub mod channel;
pub mod free_call;

pub use authorize::{Authorized, Authorizer, Metered, RecordSource};
pub use channel::{ChannelSettings, PaymentChannelService};
pub use free_call::FreeCallService;
