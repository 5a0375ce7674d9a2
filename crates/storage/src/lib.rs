#![forbid(unsafe_code)]

//! Ordered byte-store backends for the canopy node store.
//!
//! The tree never talks to a database directly; it goes through the
//! [`Database`] trait, an opaque ordered keyspace with atomic batch commit.
//! Two implementations are provided: [`MemDb`] for tests and ephemeral use,
//! and [`RedbDb`] for durable storage on redb.

pub mod backend;
pub mod memory;
pub mod redb_store;

pub use backend::{BatchOp, Database, DbIter, WriteBatch};
pub use memory::MemDb;
pub use redb_store::RedbDb;
