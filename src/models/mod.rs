//! Data models

mod image;
mod namespace;
mod task;
mod trash;

pub use image::*;
pub use namespace::*;
pub use task::*;
pub use trash::*;
