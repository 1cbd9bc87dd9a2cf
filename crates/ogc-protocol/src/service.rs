//! Service identification/provider metadata.
//!
//! Loaded from `config/service-metadata.json`; every field has a default so
//! a missing file still yields a valid capabilities document.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceMetadata {
    pub title: String,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub keywords: Vec<String>,
    pub provider_name: String,
    pub provider_site: String,
    pub contact_name: String,
    pub contact_email: String,
    pub fees: String,
    pub access_constraints: String,
}

impl Default for ServiceMetadata {
    fn default() -> Self {
        Self {
            title: "Tile Cache Server".to_string(),
            abstract_text: "Cached tiles published via OGC WMTS and WMS".to_string(),
            keywords: vec!["WMTS".to_string(), "WMS".to_string(), "tiles".to_string()],
            provider_name: "Tile Cache Server".to_string(),
            provider_site: String::new(),
            contact_name: String::new(),
            contact_email: String::new(),
            fees: "none".to_string(),
            access_constraints: "none".to_string(),
        }
    }
}
