use serde_derive::Deserialize;
use serde_derive::Serialize;
use std::fmt;

use crate::model::generation::ImageMetadata;

#[derive(Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub filename: String,
    pub url: String,
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ImageMetadata>,
}

impl fmt::Debug for GeneratedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GeneratedImage {} ({})", self.filename, self.url)
    }
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize)]
pub struct GalleryResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub images: Vec<GeneratedImage>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gallery_keeps_backend_order() {
        let body = r#"{
            "success": true,
            "images": [
                {"filename": "b.png", "url": "/api/image/b.png", "timestamp": 1700000002.5},
                {"filename": "a.png", "url": "/api/image/a.png", "timestamp": 1700000001,
                 "metadata": {"prompt": "a lighthouse", "model": "sdxl", "seed": 7,
                              "steps": 20, "guidance_scale": 7.5, "width": 512, "height": 512}}
            ]
        }"#;
        let parsed: GalleryResponse = serde_json::from_str(body).unwrap();
        let names: Vec<_> = parsed.images.iter().map(|i| i.filename.as_str()).collect();
        assert_eq!(names, ["b.png", "a.png"]);
        assert!(parsed.images[0].metadata.is_none());
        assert_eq!(
            parsed.images[1].metadata.as_ref().map(|m| m.prompt.as_str()),
            Some("a lighthouse")
        );
    }
}
