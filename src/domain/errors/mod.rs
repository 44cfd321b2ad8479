//! Domain error types.

mod load_error;
mod setup_error;

pub use load_error::LoadError;
pub use setup_error::SetupError;
