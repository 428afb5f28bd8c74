//! Client for the ripple sync server.
//!
//! [`Client`] owns one session: it requests admission, keeps a long poll
//! open while any callback is registered, and fans delivered events out to
//! those callbacks with per-callback duplicate suppression. On top of it,
//! [`Collection`] and [`Item`] mirror server documents and converge by
//! consuming the same event stream.

mod client;
mod error;
mod mirror;

pub use client::{CallbackId, Client, ClientBuilder, EventCallback};
pub use error::{ClientError, Result};
pub use mirror::{ChangeCallback, Collection, Item};
