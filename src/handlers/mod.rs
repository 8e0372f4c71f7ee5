pub mod channel_state;
pub mod protected;

pub use channel_state::channel_state_handler;
pub use protected::protected_handler;
