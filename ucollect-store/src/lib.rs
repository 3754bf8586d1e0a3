pub mod allowlist;
pub mod audit;
pub mod clock;
pub mod diffstore;
pub mod reconcile;
pub mod schema;
pub mod txn;

pub use allowlist::PluginAllowlist;
pub use audit::{AuditItem, AuditQueue};
pub use clock::ClockSource;
pub use diffstore::{Address, AddressEntry, DiffAddrStore};
pub use txn::ReentrantTxn;
