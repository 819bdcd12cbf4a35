//! Datastore proxies.
//!
//! Each proxy implements [`Datastore`](crate::Datastore) over another
//! implementation and forwards every method it does not override, so they
//! compose into a stack: read-only over integrity over the backend.

pub mod integrity;
pub mod readonly;
