//! Selectable options for the generation form, loaded once per mount.

use tracing::{debug, info, warn};

use crate::api::{self, CatalogApi};
use crate::generator::{GeneratorForm, SAMPLERS};
use crate::model::catalog::CatalogEntry;
use crate::model::generation::ImageMetadata;

#[derive(Default, Debug, Clone, PartialEq)]
pub struct Catalog {
    pub models: Vec<CatalogEntry>,
    pub vaes: Vec<CatalogEntry>,
    pub loras: Vec<CatalogEntry>,
    pub embeddings: Vec<CatalogEntry>,
    pub samplers: Vec<String>,
}

#[derive(Default, Debug, Clone, PartialEq)]
pub struct CatalogSnapshot {
    pub catalog: Catalog,
    pub last_metadata: Option<ImageMetadata>,
}

fn settle<T: Default>(what: &str, result: api::Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            warn!("Failed to load {what}: {e}");
            T::default()
        }
    }
}

fn samplers_or_builtin(samplers: Vec<String>) -> Vec<String> {
    if samplers.is_empty() {
        SAMPLERS.iter().map(|s| s.to_string()).collect()
    } else {
        samplers
    }
}

impl Catalog {
    /// Fetches every list and the last session concurrently; a failed list
    /// stays empty.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn load<C: CatalogApi>(client: &C) -> CatalogSnapshot {
        let (catalog, last_metadata) =
            futures::join!(Self::fetch_lists(client), client.last_metadata());
        CatalogSnapshot {
            catalog,
            last_metadata: settle("last metadata", last_metadata),
        }
    }

    /// Reloads the lists only, e.g. after a marketplace download. Last fetch wins.
    pub async fn refresh<C: CatalogApi>(&mut self, client: &C) {
        *self = Self::fetch_lists(client).await;
    }

    async fn fetch_lists<C: CatalogApi>(client: &C) -> Catalog {
        let (models, vaes, loras, embeddings, samplers) = futures::join!(
            client.models(),
            client.vaes(),
            client.loras(),
            client.negative_embeddings(),
            client.samplers()
        );

        let catalog = Catalog {
            models: settle("models", models),
            vaes: settle("VAEs", vaes),
            loras: settle("LoRAs", loras),
            embeddings: settle("negative embeddings", embeddings),
            samplers: samplers_or_builtin(settle("samplers", samplers)),
        };
        info!(
            "Catalog loaded: {} models, {} VAEs, {} LoRAs, {} embeddings",
            catalog.models.len(),
            catalog.vaes.len(),
            catalog.loras.len(),
            catalog.embeddings.len()
        );
        catalog
    }

    pub fn model(&self, id: &str) -> Option<&CatalogEntry> {
        self.models.iter().find(|m| m.id == id)
    }

    /// Points empty or unknown model/VAE selections at the first entry offered.
    pub fn select_defaults(&self, form: &mut GeneratorForm) {
        if let Some(first) = self.models.first() {
            if self.model(form.model()).is_none() {
                form.set_model(first.id.clone());
            }
        }
        if let Some(first) = self.vaes.first() {
            if !self.vaes.iter().any(|v| v.id == form.vae()) {
                form.set_vae(first.id.clone());
            }
        }
        if !self.samplers.iter().any(|s| s == form.sampler()) {
            if let Some(first) = self.samplers.first() {
                form.set_sampler(first.clone());
            }
        }
    }
}

impl CatalogSnapshot {
    /// Mount step: defaults from the catalog, then the remembered session.
    pub fn apply(&self, form: &mut GeneratorForm) {
        self.catalog.select_defaults(form);
        if let Some(metadata) = &self.last_metadata {
            debug!("Resuming last session");
            form.restore_from(metadata);
        }
    }
}
