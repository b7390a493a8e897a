use serde_derive::Deserialize;
use serde_derive::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::MarketplaceType;

const CIVITAI_MODEL_PAGE: &str = "https://civitai.com/models";

/// Civitai sends `null` for many optional fields; read those as empty.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + serde::Deserialize<'de>,
{
    Ok(<Option<T> as serde::Deserialize>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CivitaiModel {
    pub id: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_field: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub download_count: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub rating: f64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub versions: Vec<CivitaiVersion>,
}

impl CivitaiModel {
    /// Download count in thousands, e.g. `12K`.
    pub fn downloads_label(&self) -> String {
        format!("{:.0}K", self.download_count as f64 / 1000.0)
    }

    pub fn rating_label(&self) -> String {
        format!("{:.1}", self.rating)
    }

    pub fn latest_version(&self) -> Option<&CivitaiVersion> {
        self.versions.first()
    }
}

impl fmt::Debug for CivitaiModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Model {}: {} ({} versions)",
            self.id,
            self.name,
            self.versions.len()
        )
    }
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CivitaiVersion {
    pub id: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopularModel {
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
    #[serde(default)]
    pub downloads: Option<i64>,
    #[serde(default)]
    pub civitai_id: Option<i64>,
}

impl PopularModel {
    pub fn page_url(&self) -> Option<String> {
        self.civitai_id
            .map(|id| format!("{CIVITAI_MODEL_PAGE}/{id}"))
    }

    pub fn downloads_label(&self) -> Option<String> {
        self.downloads
            .filter(|d| *d > 0)
            .map(|d| format!("{:.0}K", d as f64 / 1000.0))
    }
}

pub type PopularModels = BTreeMap<String, Vec<PopularModel>>;

#[derive(Default, Debug, Clone, PartialEq, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub models: Vec<CivitaiModel>,
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize)]
pub struct PopularResponse {
    #[serde(default)]
    pub popular: PopularModels,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadRequest {
    pub model_id: i64,
    pub version_id: i64,
    pub model_type: MarketplaceType,
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize)]
pub struct DownloadResponse {
    #[serde(default)]
    pub success: bool,
    pub message: Option<String>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn search_result_uses_camel_case_counts() {
        let body = json!({
            "models": [{
                "id": 4201,
                "name": "Realistic Vision",
                "description": "photo",
                "type": "Checkpoint",
                "downloadCount": 123456,
                "rating": 4.87,
                "versions": [{"id": 130072, "name": "v6.0", "downloadUrl": "https://civitai.com/api/download/models/130072"}]
            }]
        });
        let parsed: SearchResponse = serde_json::from_value(body).unwrap();
        let model = &parsed.models[0];
        assert_eq!(model.downloads_label(), "123K");
        assert_eq!(model.rating_label(), "4.9");
        assert_eq!(model.latest_version().map(|v| v.id), Some(130072));
    }

    #[test]
    fn null_fields_do_not_break_the_search() {
        let body = json!({
            "models": [
                {
                    "id": 1,
                    "name": "X",
                    "description": null,
                    "type": null,
                    "downloadCount": null,
                    "rating": null,
                    "versions": [{"id": 11, "name": null, "downloadUrl": null}]
                },
                {"id": 2, "name": null, "versions": null}
            ]
        });
        let parsed: SearchResponse = serde_json::from_value(body).unwrap();
        assert_eq!(parsed.models.len(), 2);

        let first = &parsed.models[0];
        assert_eq!(first.description, "");
        assert_eq!(first.type_field, None);
        assert_eq!(first.downloads_label(), "0K");
        assert_eq!(first.latest_version().map(|v| v.name.as_str()), Some(""));

        assert_eq!(parsed.models[1].name, "");
        assert!(parsed.models[1].latest_version().is_none());
    }

    #[test]
    fn popular_entries_link_to_their_page() {
        let body = json!({
            "popular": {
                "Checkpoints": [{"name": "DreamShaper 7", "civitai_id": 112902, "downloads": 1000000}],
                "LoRAs": [{"name": "Add Details", "description": "fine detail"}]
            }
        });
        let parsed: PopularResponse = serde_json::from_value(body).unwrap();
        let checkpoint = &parsed.popular["Checkpoints"][0];
        assert_eq!(
            checkpoint.page_url().as_deref(),
            Some("https://civitai.com/models/112902")
        );
        assert_eq!(checkpoint.downloads_label().as_deref(), Some("1000K"));
        assert_eq!(parsed.popular["LoRAs"][0].page_url(), None);
    }

    #[test]
    fn download_request_body() {
        let body = serde_json::to_value(DownloadRequest {
            model_id: 123,
            version_id: 456,
            model_type: MarketplaceType::Lora,
        })
        .unwrap();
        assert_eq!(
            body,
            json!({"model_id": 123, "version_id": 456, "model_type": "LoRA"})
        );
    }
}
