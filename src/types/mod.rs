//! Core data model: canonical chat shapes, routing descriptors, billing and
//! conversation entities shared by every pipeline step.

mod audit;
mod billing;
mod capability;
mod chat;
mod conversation;
mod upstream;

pub use audit::*;
pub use billing::*;
pub use capability::*;
pub use chat::*;
pub use conversation::*;
pub use upstream::*;
