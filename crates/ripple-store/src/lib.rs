//! Document storage for the ripple sync layer.
//!
//! The server never talks to a database directly: every read and write goes
//! through a [`StorageAdapter`]. Two backends ship with the crate:
//!
//! - [`MemoryAdapter`], volatile and used by tests and `memory://` deployments.
//! - [`SqliteAdapter`], durable, pooled with `r2d2`, schema managed by
//!   embedded migrations.
//!
//! [`AdapterRegistry`] maps a connector string such as `sqlite://ripple.db`
//! to the matching backend.

mod adapter;
mod error;
mod memory;
mod registry;
pub mod sqlite;

pub use adapter::StorageAdapter;
pub use error::StoreError;
pub use memory::MemoryAdapter;
pub use registry::AdapterRegistry;
pub use sqlite::{DbRuntimeSettings, SqliteAdapter};
