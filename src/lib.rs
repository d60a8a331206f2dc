//! chatstate is the global reactive state core of a messaging client.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns the normalized entity store, per-tab UI state, the closed
//!   action set and its handlers, memoized selectors, bindings, persistence
//!   and cross-tab sync messages.
//! - [`runtime`] drives a [`core::store::Store`] from an async event loop,
//!   runs the side effects actions request and publishes snapshots.
//! - [`api`] defines the backend seam and its HTTP/JSON client.
//! - [`utils`] holds the action journal and URL helpers.
//!
//! The binary (`src/main.rs`) routes through [`crate::cli::main`], which
//! replays journals, inspects the persisted blob and runs headless sessions.

pub mod api;
pub mod cli;
pub mod core;
pub mod runtime;
pub mod utils;
