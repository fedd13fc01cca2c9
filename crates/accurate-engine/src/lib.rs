//! Accurate rating and accounting engine
//!
//! All services live on one [`Engine`] value, each module adding an
//! `impl Engine` block:
//!
//! - `rating` - rating plan lookup and call pricing
//! - `accounts`, `balances` - debits, max debits, refunds, shared groups
//! - `actions`, `triggers`, `scheduler` - action groups, thresholds and plans
//! - `aliases`, `users` - request rewriting before rating
//! - `derived` - charger runs, session runs and max session time
//! - `cdrs`, `replication` - the CDR server
//! - `stats` - CDR statistics queues
//! - `lcr` - least cost routing
//! - `simple_accounts`, `versions`
//! - `responder` - the RPC method table
//!
//! Concurrent access to one account goes through the [`guardian::Guardian`]
//! key lock.

pub mod accounts;
pub mod actions;
pub mod aliases;
pub mod balances;
pub mod cdrs;
pub mod derived;
pub mod engine;
pub mod guardian;
pub mod lcr;
pub mod pool;
pub mod rating;
pub mod replication;
pub mod responder;
pub mod scheduler;
pub mod simple_accounts;
pub mod stats;
pub mod triggers;
pub mod users;
pub mod versions;

#[cfg(test)]
pub(crate) mod test_fixtures;

pub use cdrs::{AttrRateCdrs, AttrStoreSmCost};
pub use engine::Engine;
pub use pool::CdrPool;
pub use simple_accounts::{AttrNewSimpleAccount, AttrSimpleAccountValue};
