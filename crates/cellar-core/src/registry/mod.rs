//! Registries of the document nodes the engine tracks.

mod cells;
mod inputs;

pub use cells::{Cell, CellRegistry};
pub use inputs::InputRegistry;
