pub mod atomic;
pub mod error;
pub mod exit;
pub mod log_assert;
pub mod net_protocol;
pub mod retry;
pub mod timeout_future;
