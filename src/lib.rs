//! fammail: turns emailed postcard requests into print-mail orders.

pub mod channels;
pub mod config;
pub mod error;
pub mod llm;
pub mod orders;
pub mod pipeline;
pub mod retry;
pub mod store;
