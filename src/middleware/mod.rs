pub mod auth;
pub mod headers;

pub use auth::{bypass_middleware, payment_middleware, PaymentGate};
pub use headers::PaymentHeaders;
