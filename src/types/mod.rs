//! Core types for weft.

pub mod artifact;
pub mod chunk;
pub mod message;
pub mod upload;
pub mod usage;

pub use artifact::*;
pub use chunk::*;
pub use message::*;
pub use upload::*;
pub use usage::*;
