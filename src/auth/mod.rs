//! Request authentication for the external channel.

mod signature;

pub use signature::{SignatureOutcome, SignatureParams, SignatureVerifier, hash_key, sign_request};
