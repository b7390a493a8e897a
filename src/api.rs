//! HTTP client for the generation backend.
//!
//! Each group of endpoints is exposed through a small trait so the components
//! built on top of it can be driven by any implementation, not only [`Backend`].

use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use normpath::PathExt;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cmp::min;
use std::fs::{self, File};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::model::catalog::{
    CatalogEntry, EmbeddingsResponse, HealthResponse, LastMetadataResponse, LorasResponse,
    ModelsResponse, SamplersResponse, VaesResponse,
};
use crate::model::civitai::{
    CivitaiModel, DownloadRequest, DownloadResponse, PopularModels, PopularResponse,
    SearchResponse,
};
use crate::model::gallery::{GalleryResponse, GeneratedImage};
use crate::model::generation::{GenerateResponse, GenerationRequest, ImageMetadata};
use crate::{Config, MarketplaceType};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("{endpoint} answered with status {status}")]
    Status { status: StatusCode, endpoint: String },
    #[error("{0}")]
    Backend(String),
    #[error("invalid backend url '{0}'; make sure it starts with http")]
    InvalidUrl(String),
    #[error("invalid image filename '{0}'")]
    InvalidFilename(String),
    #[error("{} already exists, not downloading", .0.to_string_lossy())]
    AlreadyExists(PathBuf),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ApiError {
    /// Text to show the user: the backend's own words when it gave any.
    pub fn user_message(&self, fallback: &str) -> String {
        match self {
            ApiError::Backend(message) => message.clone(),
            _ => fallback.to_string(),
        }
    }
}

pub type Result<T> = core::result::Result<T, ApiError>;

pub trait GenerationApi {
    /// Submits one request and yields the URL of the produced image.
    fn generate(&self, request: &GenerationRequest)
        -> impl Future<Output = Result<String>> + Send;
}

pub trait CatalogApi {
    fn models(&self) -> impl Future<Output = Result<Vec<CatalogEntry>>> + Send;
    fn vaes(&self) -> impl Future<Output = Result<Vec<CatalogEntry>>> + Send;
    fn loras(&self) -> impl Future<Output = Result<Vec<CatalogEntry>>> + Send;
    fn negative_embeddings(&self) -> impl Future<Output = Result<Vec<CatalogEntry>>> + Send;
    fn samplers(&self) -> impl Future<Output = Result<Vec<String>>> + Send;
    /// Parameters of the most recent generation, if the backend remembers one.
    fn last_metadata(&self) -> impl Future<Output = Result<Option<ImageMetadata>>> + Send;
}

pub trait GalleryApi {
    fn gallery(&self) -> impl Future<Output = Result<Vec<GeneratedImage>>> + Send;
}

pub trait MarketplaceApi {
    fn search(
        &self,
        query: &str,
        model_type: MarketplaceType,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<CivitaiModel>>> + Send;
    fn popular(&self) -> impl Future<Output = Result<PopularModels>> + Send;
    /// Asks the backend to fetch a model version; yields its success message.
    fn download(
        &self,
        model_id: i64,
        version_id: i64,
        model_type: MarketplaceType,
    ) -> impl Future<Output = Result<String>> + Send;
}

impl GenerateResponse {
    pub fn into_image_url(self) -> Result<String> {
        if let Some(error) = self.error {
            return Err(ApiError::Backend(error));
        }
        if self.success == Some(false) {
            return Err(ApiError::Backend("Generation failed".to_string()));
        }
        self.image_url
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| ApiError::Backend("Backend returned no image url".to_string()))
    }
}

impl GalleryResponse {
    pub fn into_images(self) -> Result<Vec<GeneratedImage>> {
        if !self.success {
            return Err(ApiError::Backend(
                self.error
                    .unwrap_or_else(|| "Failed to load gallery".to_string()),
            ));
        }
        Ok(self.images)
    }
}

impl DownloadResponse {
    pub fn into_message(self) -> Result<String> {
        if self.success {
            Ok(self
                .message
                .unwrap_or_else(|| "Model downloaded".to_string()))
        } else {
            Err(ApiError::Backend(
                self.error.unwrap_or_else(|| "Unknown error".to_string()),
            ))
        }
    }
}

#[derive(Clone, Debug)]
pub struct Backend {
    pub client: reqwest::Client,
    base: Url,
}

impl Backend {
    #[tracing::instrument(level = "debug")]
    pub fn new(config: &Config) -> Result<Self> {
        let base = Url::parse(&config.backend_url)
            .ok()
            .filter(|url| !url.cannot_be_a_base() && url.scheme().starts_with("http"))
            .ok_or_else(|| ApiError::InvalidUrl(config.backend_url.clone()))?;
        let client = reqwest::Client::builder().build()?;
        debug!("Constructed client for {base}");
        Ok(Backend { client, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Appends path segments to the base url, keeping any prefix it carries.
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub fn image_endpoint(&self, filename: &str) -> Result<Url> {
        if !is_plain_filename(filename) {
            return Err(ApiError::InvalidFilename(filename.to_string()));
        }
        self.endpoint(&["api", "image", filename])
    }

    /// Turns an image url as returned by the backend into an absolute one.
    pub fn resolve(&self, url: &str) -> String {
        resolve_against(&self.base, url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        trace!("GET {url}");
        let response = self.client.get(url.clone()).send().await?;
        Self::decode(url, response).await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: Url,
        body: &B,
    ) -> Result<T> {
        trace!("POST {url}");
        let response = self.client.post(url.clone()).json(body).send().await?;
        Self::decode(url, response).await
    }

    async fn decode<T: DeserializeOwned>(url: Url, response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            warn!("{url} answered with status {status}");
            return Err(ApiError::Status {
                status,
                endpoint: url.to_string(),
            });
        }
        response
            .json::<T>()
            .await
            .inspect_err(|e| debug!("Failed to parse JSON from URL: {url}. Error: {e}"))
            .map_err(ApiError::from)
    }

    #[tracing::instrument(level = "debug")]
    pub async fn health(&self) -> Result<HealthResponse> {
        self.get_json(self.endpoint(&["health"])?).await
    }

    /// Streams `/api/image/<filename>` into `directory`, never overwriting.
    #[tracing::instrument(level = "debug")]
    pub async fn download_image(&self, filename: &str, directory: &Path) -> Result<PathBuf> {
        let url = self.image_endpoint(filename)?;
        fs::create_dir_all(directory)?;
        let directory = directory.normalize()?.into_path_buf();
        let final_path = directory.join(filename);
        debug!("Final path: {}", final_path.to_string_lossy());

        if final_path.exists() {
            info!("{} already exists", final_path.to_string_lossy());
            return Err(ApiError::AlreadyExists(final_path));
        }

        let response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(ApiError::Status {
                status: response.status(),
                endpoint: url.to_string(),
            });
        }

        let total_size = response.content_length();
        let pb = match total_size {
            Some(total) => {
                let pb = ProgressBar::new(total);
                if let Ok(style) = ProgressStyle::default_bar()
                    .template("{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
                {
                    pb.set_style(style.progress_chars("#>-"));
                }
                pb
            }
            None => ProgressBar::new_spinner(),
        };

        let mut file = File::create(&final_path)?;
        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(item) = stream.next().await {
            let chunk = item?;
            file.write_all(&chunk)?;
            downloaded += chunk.len() as u64;
            pb.set_position(total_size.map_or(downloaded, |t| min(downloaded, t)));
        }

        pb.finish_with_message(format!(
            "Downloaded {} to {}",
            url,
            final_path.to_string_lossy()
        ));
        Ok(final_path)
    }
}

impl GenerationApi for Backend {
    #[tracing::instrument(level = "debug", skip(request), fields(seed = request.seed))]
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let url = self.endpoint(&["api", "generate"])?;
        let response: GenerateResponse = self.post_json(url, request).await?;
        if let Some(parameters) = &response.parameters {
            debug!("Backend echoed parameters: {parameters}");
        }
        response.into_image_url()
    }
}

impl CatalogApi for Backend {
    #[tracing::instrument(level = "debug")]
    async fn models(&self) -> Result<Vec<CatalogEntry>> {
        let body: ModelsResponse = self.get_json(self.endpoint(&["api", "models"])?).await?;
        Ok(body.models)
    }

    #[tracing::instrument(level = "debug")]
    async fn vaes(&self) -> Result<Vec<CatalogEntry>> {
        let body: VaesResponse = self.get_json(self.endpoint(&["api", "vaes"])?).await?;
        Ok(body.vaes)
    }

    #[tracing::instrument(level = "debug")]
    async fn loras(&self) -> Result<Vec<CatalogEntry>> {
        let body: LorasResponse = self.get_json(self.endpoint(&["api", "loras"])?).await?;
        Ok(body.loras)
    }

    #[tracing::instrument(level = "debug")]
    async fn negative_embeddings(&self) -> Result<Vec<CatalogEntry>> {
        let body: EmbeddingsResponse = self
            .get_json(self.endpoint(&["api", "negative-embeddings"])?)
            .await?;
        Ok(body.embeddings)
    }

    #[tracing::instrument(level = "debug")]
    async fn samplers(&self) -> Result<Vec<String>> {
        let body: SamplersResponse = self.get_json(self.endpoint(&["api", "samplers"])?).await?;
        Ok(body.samplers)
    }

    #[tracing::instrument(level = "debug")]
    async fn last_metadata(&self) -> Result<Option<ImageMetadata>> {
        let body: LastMetadataResponse = self
            .get_json(self.endpoint(&["api", "last-metadata"])?)
            .await?;
        Ok(body.metadata.filter(|_| body.success))
    }
}

impl GalleryApi for Backend {
    #[tracing::instrument(level = "trace")]
    async fn gallery(&self) -> Result<Vec<GeneratedImage>> {
        let body: GalleryResponse = self.get_json(self.endpoint(&["api", "gallery"])?).await?;
        body.into_images()
    }
}

impl MarketplaceApi for Backend {
    #[tracing::instrument(level = "debug")]
    async fn search(
        &self,
        query: &str,
        model_type: MarketplaceType,
        limit: u32,
    ) -> Result<Vec<CivitaiModel>> {
        let mut url = self.endpoint(&["api", "civitai", "search"])?;
        url.query_pairs_mut()
            .append_pair("query", query)
            .append_pair("model_type", model_type.as_ref())
            .append_pair("limit", &limit.to_string());
        let body: SearchResponse = self.get_json(url).await?;
        Ok(body.models)
    }

    #[tracing::instrument(level = "debug")]
    async fn popular(&self) -> Result<PopularModels> {
        let body: PopularResponse = self
            .get_json(self.endpoint(&["api", "civitai", "popular"])?)
            .await?;
        Ok(body.popular)
    }

    #[tracing::instrument(level = "debug")]
    async fn download(
        &self,
        model_id: i64,
        version_id: i64,
        model_type: MarketplaceType,
    ) -> Result<String> {
        let url = self.endpoint(&["api", "civitai", "download"])?;
        let request = DownloadRequest {
            model_id,
            version_id,
            model_type,
        };
        let body: DownloadResponse = self.post_json(url, &request).await?;
        body.into_message()
    }
}

fn is_plain_filename(filename: &str) -> bool {
    !filename.is_empty()
        && Path::new(filename).file_name().and_then(|f| f.to_str()) == Some(filename)
        && filename != ".."
}

fn resolve_against(base: &Url, url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        return url.to_string();
    }
    base.join(url)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| url.to_string())
}
