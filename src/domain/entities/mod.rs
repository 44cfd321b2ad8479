//! Domain entity definitions.

mod completion;
mod image;
mod target;

pub use completion::Completion;
pub use image::{Image, ImageId, LoadLocation, LoadOutcome, ResolvedImage};
pub use target::{Target, TargetId, TargetRef};
