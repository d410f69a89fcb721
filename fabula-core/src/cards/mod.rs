//! Card data model: world cards, plot cards, and their normalization rules.

pub mod normalize;
pub mod plot;
pub mod world;

pub use normalize::{normalize_plot_card, normalize_world_card, CardError};
pub use plot::PlotCard;
pub use world::{CardKind, CardSource, MemoryWindow, WorldCard};
