//! Coordinate Reference System identifiers.
//!
//! Coordinate transformation is delegated to the external renderer, so this
//! type only normalizes identifiers and answers axis-order questions needed
//! by the OGC document builders.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A normalized CRS identifier of the form `EPSG:nnnn`.
///
/// Accepts any EPSG code; unlike a closed enum, unknown codes pass through
/// untouched because the renderer owns the projection math.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CrsId(String);

impl CrsId {
    /// Web Mercator.
    pub fn epsg_3857() -> Self {
        CrsId("EPSG:3857".to_string())
    }

    /// WGS84 geographic.
    pub fn epsg_4326() -> Self {
        CrsId("EPSG:4326".to_string())
    }

    /// Normalize a CRS string from a request or config file.
    ///
    /// Accepts `EPSG:3857`, `epsg:3857`, a bare numeric code `3857`,
    /// the legacy `EPSG:900913` alias, `CRS:84`, and OGC URN forms like
    /// `urn:ogc:def:crs:EPSG::3857`. Returns None for anything else.
    pub fn normalize(s: &str) -> Option<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return None;
        }
        let upper = trimmed.to_uppercase();

        if upper == "CRS:84" {
            return Some(Self::epsg_4326());
        }
        if upper == "EPSG:900913" {
            return Some(Self::epsg_3857());
        }
        if let Some(code) = upper.strip_prefix("EPSG:") {
            return code.parse::<u32>().ok().map(|c| CrsId(format!("EPSG:{}", c)));
        }
        if upper.starts_with("URN:OGC:DEF:CRS:EPSG:") {
            return upper
                .rsplit(':')
                .next()
                .and_then(|code| code.parse::<u32>().ok())
                .map(|c| CrsId(format!("EPSG:{}", c)));
        }
        trimmed.parse::<u32>().ok().map(|c| CrsId(format!("EPSG:{}", c)))
    }

    /// The numeric EPSG code.
    pub fn epsg_code(&self) -> u32 {
        self.0
            .strip_prefix("EPSG:")
            .and_then(|c| c.parse().ok())
            .unwrap_or(0)
    }

    /// The OGC URN form, used in capability documents.
    pub fn urn(&self) -> String {
        format!("urn:ogc:def:crs:EPSG::{}", self.epsg_code())
    }

    /// Whether this is Web Mercator.
    pub fn is_web_mercator(&self) -> bool {
        self.epsg_code() == 3857
    }

    /// Whether the CRS natural axis order puts northing/latitude first.
    ///
    /// WMS 1.3.0 bounding boxes swap coordinates for these. Geographic
    /// CRSes (4326, 4269) and the Swedish SWEREF99 grids (3006-3018)
    /// are northing-first.
    pub fn northing_first(&self) -> bool {
        matches!(self.epsg_code(), 4326 | 4269 | 3006..=3018)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CrsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(CrsId::normalize("EPSG:3857").unwrap().as_str(), "EPSG:3857");
        assert_eq!(CrsId::normalize("epsg:3006").unwrap().as_str(), "EPSG:3006");
        assert_eq!(CrsId::normalize("3857").unwrap().as_str(), "EPSG:3857");
        assert_eq!(CrsId::normalize("CRS:84").unwrap().as_str(), "EPSG:4326");
        assert_eq!(
            CrsId::normalize("EPSG:900913").unwrap().as_str(),
            "EPSG:3857"
        );
        assert_eq!(
            CrsId::normalize("urn:ogc:def:crs:EPSG::3857")
                .unwrap()
                .as_str(),
            "EPSG:3857"
        );
        assert!(CrsId::normalize("bogus").is_none());
        assert!(CrsId::normalize("").is_none());
    }

    #[test]
    fn test_axis_order() {
        assert!(CrsId::epsg_4326().northing_first());
        assert!(CrsId::normalize("EPSG:3006").unwrap().northing_first());
        assert!(!CrsId::epsg_3857().northing_first());
    }

    #[test]
    fn test_urn() {
        assert_eq!(
            CrsId::epsg_3857().urn(),
            "urn:ogc:def:crs:EPSG::3857"
        );
    }
}
