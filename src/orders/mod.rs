//! Print-mail provider integration.

pub mod client;
pub mod types;

pub use client::{OrderSubmitter, PostcardSubmitter};
pub use types::{EffectiveMode, OrderResponse, OrderResult};
