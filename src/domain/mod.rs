//! Domain layer with core entities and port definitions.

/// Entity definitions.
pub mod entities;
/// Error types.
pub mod errors;
/// Port definitions.
pub mod ports;

pub use entities::{Completion, ImageId, LoadLocation, LoadOutcome, Target, TargetId};
pub use errors::{LoadError, SetupError};
pub use ports::{DiskStorePort, ImageCachePort, ImageDecoder, ImageFetcher};
