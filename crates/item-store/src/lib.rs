//! Storage for the reservation service.
//!
//! The Item Store is the only shared mutable resource of the reservation
//! subsystem. Every disposition change goes through one of the conditional
//! operations on [`ItemStore`], each of which is a single atomic
//! match-old-state/set-new-state step in the backend: a write lock held across
//! guard and update in [`InMemoryStore`], a single guarded `UPDATE` statement
//! in [`PostgresStore`].

pub mod error;
pub mod item;
pub mod memory;
pub mod order;
pub mod postgres;
pub mod query;
pub mod session;
pub mod store;

pub use common::{CheckoutSessionId, HolderId, ItemId, Money, OrderId};
pub use error::{Result, StoreError};
pub use item::{Disposition, ItemRecord, NewItem};
pub use memory::InMemoryStore;
pub use order::{InsertOutcome, OrderLine, OrderRecord};
pub use postgres::PostgresStore;
pub use query::ItemQuery;
pub use session::CheckoutSessionRecord;
pub use store::{CheckoutSessionStore, ItemStore, ItemStoreExt, OrderStore};
