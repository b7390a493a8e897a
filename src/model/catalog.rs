use serde_derive::Deserialize;
use serde_derive::Serialize;
use std::fmt;

use crate::model::generation::ImageMetadata;

/// A model, VAE, LoRA or negative embedding the backend can load.
#[derive(Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl fmt::Debug for CatalogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize)]
pub struct ModelsResponse {
    #[serde(default)]
    pub models: Vec<CatalogEntry>,
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize)]
pub struct VaesResponse {
    #[serde(default)]
    pub vaes: Vec<CatalogEntry>,
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize)]
pub struct LorasResponse {
    #[serde(default)]
    pub loras: Vec<CatalogEntry>,
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize)]
pub struct EmbeddingsResponse {
    #[serde(default)]
    pub embeddings: Vec<CatalogEntry>,
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize)]
pub struct SamplersResponse {
    #[serde(default)]
    pub samplers: Vec<String>,
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize)]
pub struct LastMetadataResponse {
    #[serde(default)]
    pub success: bool,
    pub metadata: Option<ImageMetadata>,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(default)]
    pub message: String,
}
