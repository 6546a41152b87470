//! Schema definitions and discovery

pub mod definition;
pub mod loader;

pub use definition::*;
pub use loader::*;
