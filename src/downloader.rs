//! Search and download models from the marketplace through the backend.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::MarketplaceApi;
use crate::model::civitai::{CivitaiModel, PopularModels};
use crate::MarketplaceType;

/// How long a successful download's message stays before the search resets.
pub const RESET_DELAY: Duration = Duration::from_secs(2);
/// Default number of results asked for per search.
pub const SEARCH_LIMIT: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackKind {
    Success,
    Failure,
}

/// A banner message together with whether it reports success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feedback {
    pub kind: FeedbackKind,
    pub text: String,
}

impl Feedback {
    pub fn success(text: impl Into<String>) -> Self {
        Feedback {
            kind: FeedbackKind::Success,
            text: text.into(),
        }
    }

    pub fn failure(text: impl Into<String>) -> Self {
        Feedback {
            kind: FeedbackKind::Failure,
            text: text.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.kind == FeedbackKind::Success
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloaderState {
    pub query: String,
    pub model_type: MarketplaceType,
    pub limit: u32,
    pub models: Vec<CivitaiModel>,
    pub popular: Option<PopularModels>,
    pub show_popular: bool,
    pub loading: bool,
    /// Model currently being downloaded; one at a time.
    pub downloading: Option<i64>,
    pub feedback: Option<Feedback>,
}

impl Default for DownloaderState {
    fn default() -> Self {
        DownloaderState {
            query: String::new(),
            model_type: MarketplaceType::default(),
            limit: SEARCH_LIMIT,
            models: Vec::new(),
            popular: None,
            show_popular: false,
            loading: false,
            downloading: None,
            feedback: None,
        }
    }
}

impl DownloaderState {
    pub fn can_search(&self) -> bool {
        !self.loading && !self.query.trim().is_empty()
    }

    pub fn is_downloading(&self, model_id: i64) -> bool {
        self.downloading == Some(model_id)
    }

    fn reset_search(&mut self) {
        self.models.clear();
        self.query.clear();
        self.show_popular = false;
    }
}

/// Clears a busy flag when dropped, so an abandoned request does not
/// leave the downloader locked.
struct BusyGuard<'a> {
    state: &'a Mutex<DownloaderState>,
    clear: fn(&mut DownloaderState),
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        (self.clear)(&mut lock(self.state));
    }
}

type DownloadedCallback = Box<dyn Fn() + Send + Sync>;

pub struct ModelDownloader<C> {
    client: C,
    state: Arc<Mutex<DownloaderState>>,
    pending_reset: Option<JoinHandle<()>>,
    on_model_downloaded: Option<DownloadedCallback>,
}

fn lock(state: &Mutex<DownloaderState>) -> MutexGuard<'_, DownloaderState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<C: MarketplaceApi> ModelDownloader<C> {
    pub fn new(client: C) -> Self {
        ModelDownloader {
            client,
            state: Arc::new(Mutex::new(DownloaderState::default())),
            pending_reset: None,
            on_model_downloaded: None,
        }
    }

    /// Called once per successful download so catalogs can be refreshed.
    pub fn on_model_downloaded(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_model_downloaded = Some(Box::new(callback));
        self
    }

    pub fn state(&self) -> DownloaderState {
        lock(&self.state).clone()
    }

    pub fn set_query(&self, query: impl Into<String>) {
        lock(&self.state).query = query.into();
    }

    pub fn set_model_type(&self, model_type: MarketplaceType) {
        lock(&self.state).model_type = model_type;
    }

    /// Zero falls back to [`SEARCH_LIMIT`].
    pub fn set_limit(&self, limit: u32) {
        lock(&self.state).limit = if limit == 0 { SEARCH_LIMIT } else { limit };
    }

    /// Runs a search for the current query. Does nothing for a blank query.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn search(&self) {
        let (query, model_type, limit) = {
            let mut state = lock(&self.state);
            if !state.can_search() {
                return;
            }
            state.loading = true;
            state.feedback = None;
            state.show_popular = false;
            (state.query.trim().to_string(), state.model_type, state.limit)
        };
        let _busy = BusyGuard {
            state: &self.state,
            clear: |state| state.loading = false,
        };

        let result = self.client.search(&query, model_type, limit).await;

        let mut state = lock(&self.state);
        match result {
            Ok(models) => {
                info!("Search for '{query}' found {} models", models.len());
                state.feedback = Some(if models.is_empty() {
                    Feedback::failure("No models found")
                } else {
                    Feedback::success(format!("Found {} models", models.len()))
                });
                state.models = models;
            }
            Err(e) => {
                warn!("Error searching models: {e}");
                state.feedback = Some(Feedback::failure("Search error"));
            }
        }
    }

    /// Switches to the curated list; clears search results.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn load_popular(&self) {
        {
            let mut state = lock(&self.state);
            if state.loading {
                return;
            }
            state.loading = true;
        }
        let _busy = BusyGuard {
            state: &self.state,
            clear: |state| state.loading = false,
        };

        let result = self.client.popular().await;

        let mut state = lock(&self.state);
        match result {
            Ok(popular) => {
                state.popular = Some(popular);
                state.show_popular = true;
                state.models.clear();
            }
            Err(e) => {
                warn!("Error loading popular models: {e}");
                state.feedback = Some(Feedback::failure("Error loading popular models"));
            }
        }
    }

    /// Downloads the first listed version of a model from the current results.
    pub async fn download_latest(&mut self, model_id: i64) -> bool {
        let version_id = lock(&self.state)
            .models
            .iter()
            .find(|m| m.id == model_id)
            .and_then(|m| m.latest_version())
            .map(|v| v.id);
        match version_id {
            Some(version_id) => self.download(model_id, version_id).await,
            None => false,
        }
    }

    /// Returns whether the backend reported success.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn download(&mut self, model_id: i64, version_id: i64) -> bool {
        let model_type = {
            let mut state = lock(&self.state);
            if state.downloading.is_some() {
                debug!("Download already running for {:?}", state.downloading);
                return false;
            }
            state.downloading = Some(model_id);
            state.feedback = None;
            state.model_type
        };
        let busy = BusyGuard {
            state: &self.state,
            clear: |state| state.downloading = None,
        };

        let result = self.client.download(model_id, version_id, model_type).await;
        drop(busy);

        let succeeded = {
            let mut state = lock(&self.state);
            match result {
                Ok(message) => {
                    info!("Downloaded model {model_id} version {version_id}: {message}");
                    state.feedback = Some(Feedback::success(message));
                    true
                }
                Err(e) => {
                    warn!("Error downloading model {model_id}: {e}");
                    state.feedback = Some(Feedback::failure(match &e {
                        crate::ApiError::Backend(message) => format!("Error: {message}"),
                        _ => "Download error".to_string(),
                    }));
                    false
                }
            }
        };

        if succeeded {
            if let Some(callback) = &self.on_model_downloaded {
                callback();
            }
            self.schedule_reset();
        }
        succeeded
    }

    fn schedule_reset(&mut self) {
        if let Some(previous) = self.pending_reset.take() {
            previous.abort();
        }
        let state = self.state.clone();
        self.pending_reset = Some(tokio::spawn(async move {
            tokio::time::sleep(RESET_DELAY).await;
            lock(&state).reset_search();
            debug!("Search reset after download");
        }));
    }
}

impl<C> Drop for ModelDownloader<C> {
    fn drop(&mut self) {
        if let Some(pending) = self.pending_reset.take() {
            pending.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{self, ApiError};
    use crate::model::civitai::{CivitaiVersion, PopularModel};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeMarketplace {
        results: Vec<CivitaiModel>,
        fail_search: bool,
        download_error: Option<String>,
        delay: Option<Duration>,
        searches: Mutex<Vec<(String, MarketplaceType, u32)>>,
        downloads: Mutex<Vec<(i64, i64, MarketplaceType)>>,
    }

    impl MarketplaceApi for FakeMarketplace {
        async fn search(
            &self,
            query: &str,
            model_type: MarketplaceType,
            limit: u32,
        ) -> api::Result<Vec<CivitaiModel>> {
            self.searches
                .lock()
                .unwrap()
                .push((query.to_string(), model_type, limit));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_search {
                return Err(ApiError::Backend("civitai unreachable".to_string()));
            }
            Ok(self.results.clone())
        }

        async fn popular(&self) -> api::Result<PopularModels> {
            let mut popular = BTreeMap::new();
            popular.insert(
                "Checkpoints".to_string(),
                vec![PopularModel {
                    name: "DreamShaper 7".to_string(),
                    civitai_id: Some(112902),
                    ..Default::default()
                }],
            );
            Ok(popular)
        }

        async fn download(
            &self,
            model_id: i64,
            version_id: i64,
            model_type: MarketplaceType,
        ) -> api::Result<String> {
            self.downloads
                .lock()
                .unwrap()
                .push((model_id, version_id, model_type));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match &self.download_error {
                Some(error) => Err(ApiError::Backend(error.clone())),
                None => Ok("Model saved to models/lora".to_string()),
            }
        }
    }

    fn model(id: i64, version: i64) -> CivitaiModel {
        CivitaiModel {
            id,
            name: format!("model {id}"),
            versions: vec![CivitaiVersion {
                id: version,
                name: "v1".to_string(),
                download_url: None,
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn blank_query_never_searches() {
        let downloader = ModelDownloader::new(FakeMarketplace::default());
        downloader.set_query("   ");
        assert!(!downloader.state().can_search());

        downloader.search().await;

        assert!(downloader.client.searches.lock().unwrap().is_empty());
        assert_eq!(downloader.state().feedback, None);
    }

    #[tokio::test]
    async fn empty_result_reports_no_models_found() {
        let downloader = ModelDownloader::new(FakeMarketplace::default());
        downloader.set_query("anime");
        downloader.set_model_type(MarketplaceType::Lora);

        downloader.search().await;

        let state = downloader.state();
        assert!(state.models.is_empty());
        assert_eq!(state.feedback, Some(Feedback::failure("No models found")));
        assert!(!state.loading);
        assert_eq!(
            *downloader.client.searches.lock().unwrap(),
            [("anime".to_string(), MarketplaceType::Lora, SEARCH_LIMIT)]
        );
    }

    #[tokio::test]
    async fn search_forwards_the_chosen_limit() {
        let downloader = ModelDownloader::new(FakeMarketplace::default());
        downloader.set_query("pixel art");
        downloader.set_limit(25);
        downloader.search().await;

        downloader.set_limit(0);
        downloader.search().await;

        let searches = downloader.client.searches.lock().unwrap();
        assert_eq!(searches[0].2, 25);
        assert_eq!(searches[1].2, SEARCH_LIMIT);
    }

    #[tokio::test]
    async fn search_error_is_a_failure_banner() {
        let downloader = ModelDownloader::new(FakeMarketplace {
            fail_search: true,
            ..Default::default()
        });
        downloader.set_query("proteus");

        downloader.search().await;

        let feedback = downloader.state().feedback.unwrap();
        assert!(!feedback.is_success());
        assert_eq!(feedback.text, "Search error");
    }

    #[tokio::test]
    async fn new_search_leaves_popular_view() {
        let downloader = ModelDownloader::new(FakeMarketplace {
            results: vec![model(1, 10), model(2, 20)],
            ..Default::default()
        });

        downloader.load_popular().await;
        let state = downloader.state();
        assert!(state.show_popular);
        assert!(state.popular.is_some());

        downloader.set_query("dreamshaper");
        downloader.search().await;

        let state = downloader.state();
        assert!(!state.show_popular);
        assert_eq!(state.models.len(), 2);
        assert_eq!(state.feedback, Some(Feedback::success("Found 2 models")));
    }

    #[tokio::test]
    async fn popular_clears_search_results() {
        let downloader = ModelDownloader::new(FakeMarketplace {
            results: vec![model(1, 10)],
            ..Default::default()
        });
        downloader.set_query("anything");
        downloader.search().await;

        downloader.load_popular().await;

        let state = downloader.state();
        assert!(state.models.is_empty());
        assert!(state.show_popular);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_download_notifies_and_resets_after_delay() {
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = notified.clone();
        let mut downloader = ModelDownloader::new(FakeMarketplace {
            results: vec![model(123, 456)],
            ..Default::default()
        })
        .on_model_downloaded(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        downloader.set_query("anime");
        downloader.set_model_type(MarketplaceType::Lora);
        downloader.search().await;

        assert!(downloader.download(123, 456).await);

        let state = downloader.state();
        assert_eq!(
            state.feedback,
            Some(Feedback::success("Model saved to models/lora"))
        );
        assert_eq!(state.downloading, None);
        assert_eq!(state.query, "anime");
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert_eq!(
            *downloader.client.downloads.lock().unwrap(),
            [(123, 456, MarketplaceType::Lora)]
        );

        tokio::time::sleep(RESET_DELAY + Duration::from_millis(10)).await;

        let state = downloader.state();
        assert!(state.query.is_empty());
        assert!(state.models.is_empty());
        assert!(!state.show_popular);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_download_keeps_results_and_shows_backend_error() {
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = notified.clone();
        let mut downloader = ModelDownloader::new(FakeMarketplace {
            results: vec![model(7, 70)],
            download_error: Some("version not found".to_string()),
            ..Default::default()
        })
        .on_model_downloaded(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        downloader.set_query("detail");
        downloader.search().await;

        assert!(!downloader.download_latest(7).await);

        let state = downloader.state();
        assert_eq!(
            state.feedback,
            Some(Feedback::failure("Error: version not found"))
        );
        assert_eq!(state.models.len(), 1);
        assert_eq!(notified.load(Ordering::SeqCst), 0);
        assert!(downloader.pending_reset.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_download_does_not_block_the_next_one() {
        let mut downloader = ModelDownloader::new(FakeMarketplace {
            delay: Some(Duration::from_secs(60)),
            ..Default::default()
        });

        let abandoned =
            tokio::time::timeout(Duration::from_secs(1), downloader.download(1, 10)).await;
        assert!(abandoned.is_err());
        assert_eq!(downloader.state().downloading, None);

        assert!(downloader.download(2, 20).await);
        assert_eq!(
            *downloader.client.downloads.lock().unwrap(),
            [
                (1, 10, MarketplaceType::Checkpoint),
                (2, 20, MarketplaceType::Checkpoint)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_search_can_be_retried() {
        let downloader = ModelDownloader::new(FakeMarketplace {
            results: vec![model(3, 30)],
            delay: Some(Duration::from_secs(60)),
            ..Default::default()
        });
        downloader.set_query("landscape");

        let abandoned = tokio::time::timeout(Duration::from_secs(1), downloader.search()).await;
        assert!(abandoned.is_err());
        let state = downloader.state();
        assert!(!state.loading);
        assert!(state.can_search());

        downloader.search().await;
        assert_eq!(downloader.state().models.len(), 1);
        assert_eq!(downloader.client.searches.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn model_without_versions_cannot_be_downloaded() {
        let mut downloader = ModelDownloader::new(FakeMarketplace {
            results: vec![CivitaiModel {
                id: 9,
                name: "empty".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        });
        downloader.set_query("empty");
        downloader.search().await;

        assert!(!downloader.download_latest(9).await);
        assert!(downloader.client.downloads.lock().unwrap().is_empty());
    }
}
