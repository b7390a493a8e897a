//! Wire shapes for the generation backend's JSON endpoints.

pub mod catalog;
pub mod civitai;
pub mod gallery;
pub mod generation;

pub use catalog::CatalogEntry;
pub use civitai::{CivitaiModel, CivitaiVersion, PopularModel};
pub use gallery::GeneratedImage;
pub use generation::{GenerationRequest, ImageMetadata, Upscale};
