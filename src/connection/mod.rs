//! Shared broker connections.
//!
//! One physical connection per broker URL set and registry, shared by any
//! number of reference-counted owners, each with its own lifecycle callbacks.

mod callbacks;
mod registry;
mod shared;

pub use callbacks::{CallbackFn, CallbackKind};
pub use registry::ConnectionRegistry;
pub use shared::SharedConnection;
