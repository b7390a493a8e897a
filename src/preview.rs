use std::fmt;

/// What the preview area shows right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreviewView {
    Placeholder,
    Image {
        /// The url exactly as the backend returned it.
        url: String,
        /// Absolute link for saving the image.
        download_url: String,
        filename: Option<String>,
    },
}

/// Most recent image generated in this session; last write wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preview {
    image_url: Option<String>,
}

impl Preview {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn show(&mut self, image_url: impl Into<String>) {
        self.image_url = Some(image_url.into());
    }

    pub fn image_url(&self) -> Option<&str> {
        self.image_url.as_deref()
    }

    /// `resolve` maps a possibly relative url to an absolute one.
    pub fn render(&self, resolve: impl Fn(&str) -> String) -> PreviewView {
        match &self.image_url {
            None => PreviewView::Placeholder,
            Some(url) => PreviewView::Image {
                url: url.clone(),
                download_url: resolve(url),
                filename: url
                    .split(&['?', '#'][..])
                    .next()
                    .and_then(|path| path.rsplit('/').next())
                    .filter(|name| !name.is_empty())
                    .map(str::to_string),
            },
        }
    }
}

impl fmt::Display for PreviewView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreviewView::Placeholder => {
                write!(f, "No image yet. Set the parameters and generate one.")
            }
            PreviewView::Image {
                url, download_url, ..
            } => write!(f, "Preview: {url}\nDownload: {download_url}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::tests::{FakeGenerator, FixedSeeds};
    use crate::generator::{Generator, GeneratorForm};
    use crate::{Backend, Config};
    use std::sync::{Arc, Mutex};

    #[test]
    fn empty_session_shows_placeholder() {
        assert_eq!(Preview::new().render(str::to_string), PreviewView::Placeholder);
    }

    #[test]
    fn latest_image_wins() {
        let mut preview = Preview::new();
        preview.show("/api/image/first.png");
        preview.show("/api/image/second.png?v=2");
        match preview.render(str::to_string) {
            PreviewView::Image { url, filename, .. } => {
                assert_eq!(url, "/api/image/second.png?v=2");
                assert_eq!(filename.as_deref(), Some("second.png"));
            }
            other => panic!("unexpected view {other:?}"),
        }
    }

    #[tokio::test]
    async fn generated_fox_lands_in_preview() {
        let backend = Backend::new(&Config::default()).unwrap();
        let preview = Arc::new(Mutex::new(Preview::new()));
        let panel = preview.clone();
        let generator = Generator::with_seeds(
            FakeGenerator::replying("/api/image/fox123.png"),
            FixedSeeds::new([250_000]),
        )
        .on_image_generated(move |url| panel.lock().unwrap().show(url));

        let mut form = GeneratorForm::new();
        form.set_prompt("a red fox");
        form.set_steps(20);
        form.set_guidance_scale(7.5);
        form.set_seed(0);
        form.set_width(512);
        form.set_height(512);
        let generated = generator.submit(&form).await.unwrap();

        assert_ne!(generated.request.seed, 0);
        let view = preview.lock().unwrap().render(|url| backend.resolve(url));
        assert_eq!(
            view,
            PreviewView::Image {
                url: "/api/image/fox123.png".to_string(),
                download_url: "http://localhost:8000/api/image/fox123.png".to_string(),
                filename: Some("fox123.png".to_string()),
            }
        );
    }
}
