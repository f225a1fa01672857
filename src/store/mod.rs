//! Persistence layer: libSQL-backed order ledger.

pub mod libsql_backend;
pub mod migrations;
pub mod model;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use model::{NewOrderRecord, OrderMode, OrderRecord, OrderStatus};
pub use traits::OrderStore;
