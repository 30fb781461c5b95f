//! The food classifier architecture.
mod layers;
mod resnet;
mod state;

pub use layers::*;
pub use resnet::*;
pub use state::{Leaf, StateExporter, StateLoader, StateModule};
