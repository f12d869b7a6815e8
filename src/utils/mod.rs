//! Small shared utilities.

pub mod cancel;
pub mod redact;
pub mod tokens;

pub use cancel::{CancelHandle, new_cancel_handle};
pub use redact::redact_sensitive;
pub use tokens::estimate_tokens;
