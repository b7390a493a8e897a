//! Polled view of the images the backend has generated.
//!
//! Every refresh replaces the whole list. Refreshes are tagged with a
//! monotonically increasing id and a response older than the last one applied
//! is dropped, so a slow poll can never overwrite a newer list. The selected
//! image is tracked by filename; when a refresh no longer contains it the
//! detail panel closes.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::api::{self, Backend, GalleryApi};
use crate::model::gallery::GeneratedImage;
use crate::model::generation::ImageMetadata;

pub const POLL_INTERVAL: Duration = Duration::from_secs(3);
pub const COPY_ACK_WINDOW: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum GalleryState {
    #[default]
    Idle,
    Loading,
    Populated,
    Empty,
    Error(String),
}

/// Transient "copied" acknowledgement. Copying again restarts the window.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyAck {
    until: Option<Instant>,
}

impl CopyAck {
    pub fn trigger(&mut self, now: Instant) {
        self.until = Some(now + COPY_ACK_WINDOW);
    }

    pub fn is_active(&self, now: Instant) -> bool {
        self.until.map_or(false, |until| now < until)
    }

    pub fn clear(&mut self) {
        self.until = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyField {
    Prompt,
    NegativePrompt,
}

#[derive(Debug, Default)]
pub struct Gallery {
    state: GalleryState,
    images: Vec<GeneratedImage>,
    selected: Option<String>,
    copy_ack: CopyAck,
    issued: u64,
    applied: u64,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &GalleryState {
        &self.state
    }

    /// Tiles in backend order. A failed refresh keeps the last good list.
    pub fn images(&self) -> &[GeneratedImage] {
        &self.images
    }

    /// Marks a refresh as started and returns its id for [`Gallery::apply`].
    pub fn begin_refresh(&mut self) -> u64 {
        self.issued += 1;
        self.state = GalleryState::Loading;
        self.issued
    }

    /// Applies the outcome of refresh `id`; returns false when it was stale.
    pub fn apply(&mut self, id: u64, result: api::Result<Vec<GeneratedImage>>) -> bool {
        if id <= self.applied {
            debug!("Dropping stale gallery response {id}, {} already applied", self.applied);
            return false;
        }
        self.applied = id;
        match result {
            Ok(images) => {
                self.state = if images.is_empty() {
                    GalleryState::Empty
                } else {
                    GalleryState::Populated
                };
                self.images = images;
                self.reconcile_selection();
            }
            Err(e) => {
                warn!("Failed to load gallery: {e}");
                self.state = GalleryState::Error(e.user_message("Error loading gallery"));
            }
        }
        true
    }

    fn reconcile_selection(&mut self) {
        let Some(filename) = &self.selected else {
            return;
        };
        if self.find(filename).is_none() {
            info!("{filename} is no longer in the gallery, closing details");
            self.dismiss();
        }
    }

    fn find(&self, filename: &str) -> Option<&GeneratedImage> {
        self.images.iter().find(|image| image.filename == filename)
    }

    /// Opens the detail panel for `filename`; unknown names are ignored.
    pub fn select(&mut self, filename: &str) -> bool {
        if self.find(filename).is_none() {
            return false;
        }
        if self.selected.as_deref() != Some(filename) {
            self.copy_ack.clear();
        }
        self.selected = Some(filename.to_string());
        true
    }

    pub fn dismiss(&mut self) {
        self.selected = None;
        self.copy_ack.clear();
    }

    pub fn selected(&self) -> Option<&GeneratedImage> {
        self.selected.as_deref().and_then(|filename| self.find(filename))
    }

    pub fn selected_metadata(&self) -> Option<&ImageMetadata> {
        self.selected().and_then(|image| image.metadata.as_ref())
    }

    /// Returns the literal text to put on the clipboard and starts the
    /// acknowledgement window.
    pub fn copy(&mut self, field: CopyField) -> Option<String> {
        let metadata = self.selected_metadata()?;
        let text = match field {
            CopyField::Prompt => metadata.prompt.clone(),
            CopyField::NegativePrompt => metadata.negative_prompt.clone(),
        };
        self.copy_ack.trigger(Instant::now());
        Some(text)
    }

    pub fn copied(&self) -> bool {
        self.copy_ack.is_active(Instant::now())
    }
}

/// Owns the gallery state and keeps it in sync with the backend.
pub struct GallerySync<C> {
    client: Arc<C>,
    gallery: Arc<Mutex<Gallery>>,
}

impl<C> Clone for GallerySync<C> {
    fn clone(&self) -> Self {
        GallerySync {
            client: self.client.clone(),
            gallery: self.gallery.clone(),
        }
    }
}

impl<C: GalleryApi + Send + Sync + 'static> GallerySync<C> {
    pub fn new(client: C) -> Self {
        GallerySync {
            client: Arc::new(client),
            gallery: Arc::new(Mutex::new(Gallery::new())),
        }
    }

    pub fn gallery(&self) -> MutexGuard<'_, Gallery> {
        self.gallery
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// One poll: fetch and replace the list wholesale.
    pub async fn refresh(&self) -> bool {
        let id = self.gallery().begin_refresh();
        let result = self.client.gallery().await;
        self.gallery().apply(id, result)
    }

    /// Starts polling every `every`, beginning immediately. Polling stops
    /// when the returned handle is dropped.
    pub fn start(&self, every: Duration) -> PollHandle {
        let sync = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                sync.refresh().await;
            }
        });
        debug!("Gallery polling started every {every:?}");
        PollHandle { task }
    }
}

impl GallerySync<Backend> {
    /// Saves the image behind `filename` into `directory`, bytes untouched.
    pub async fn download(&self, filename: &str, directory: &Path) -> api::Result<PathBuf> {
        self.client.download_image(filename, directory).await
    }
}

#[must_use = "polling stops as soon as the handle is dropped"]
pub struct PollHandle {
    task: JoinHandle<()>,
}

impl PollHandle {
    pub fn stop(self) {}

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
