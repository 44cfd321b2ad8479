//! asyncimage - an asynchronous image loading engine.
//!
//! Resolves image identifiers through a memory cache, local disk and a
//! network fetcher, coalescing concurrent requests for the same identifier
//! into one fetch and running fetches on a bounded, deadline-aware
//! scheduler with per-target cancellation.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Domain layer containing entities, errors, and port definitions.
pub mod domain;
/// Infrastructure layer containing the loader and its adapters.
pub mod infrastructure;

/// Current version of the library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = "asyncimage";
