//! OGC WMTS protocol implementation.
//!
//! Capabilities documents are assembled from normalized records; GetTile
//! itself is handled by the server's tile pipeline, this module only parses
//! the KVP binding.

use crate::xml::xml_escape;
use crate::ServiceMetadata;
use std::collections::HashMap;
use tile_common::{BoundingBox, CrsId};

/// A published layer, normalized by the cache inventory.
#[derive(Debug, Clone)]
pub struct WmtsLayerEntry {
    /// Unique identifier: `<normalizedProject>_<normalizedLayer>`.
    pub identifier: String,
    pub title: String,
    /// Routing keys used by the REST binding.
    pub project_key: String,
    pub layer_key: String,
    pub tile_matrix_set_id: String,
    pub native_crs: CrsId,
    pub wgs84_bbox: Option<BoundingBox>,
    pub native_bbox: Option<BoundingBox>,
    pub format: String,
}

/// One matrix of a normalized tile-matrix set, origin always in `(x, y)`.
#[derive(Debug, Clone)]
pub struct WmtsMatrix {
    pub identifier: String,
    pub scale_denominator: f64,
    pub top_left: (f64, f64),
    pub tile_width: u32,
    pub tile_height: u32,
    pub matrix_width: u32,
    pub matrix_height: u32,
}

/// A normalized tile-matrix set referenced by layers.
#[derive(Debug, Clone)]
pub struct WmtsMatrixSet {
    pub identifier: String,
    pub crs: CrsId,
    pub matrices: Vec<WmtsMatrix>,
}

/// WMTS GetCapabilities document builder.
pub struct WmtsCapabilitiesBuilder {
    pub service: ServiceMetadata,
    pub base_url: String,
    pub layers: Vec<WmtsLayerEntry>,
    pub matrix_sets: Vec<WmtsMatrixSet>,
}

impl WmtsCapabilitiesBuilder {
    pub fn build(&self) -> String {
        let mut xml = String::new();

        xml.push_str(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<Capabilities xmlns="http://www.opengis.net/wmts/1.0"
    xmlns:ows="http://www.opengis.net/ows/1.1"
    xmlns:xlink="http://www.w3.org/1999/xlink"
    version="1.0.0">
"#,
        );

        // ServiceIdentification
        xml.push_str(&format!(
            r#"  <ows:ServiceIdentification>
    <ows:Title>{}</ows:Title>
    <ows:Abstract>{}</ows:Abstract>
    <ows:ServiceType>OGC WMTS</ows:ServiceType>
    <ows:ServiceTypeVersion>1.0.0</ows:ServiceTypeVersion>
    <ows:Fees>{}</ows:Fees>
    <ows:AccessConstraints>{}</ows:AccessConstraints>
  </ows:ServiceIdentification>
"#,
            xml_escape(&self.service.title),
            xml_escape(&self.service.abstract_text),
            xml_escape(&self.service.fees),
            xml_escape(&self.service.access_constraints),
        ));

        // ServiceProvider
        xml.push_str(&format!(
            r#"  <ows:ServiceProvider>
    <ows:ProviderName>{}</ows:ProviderName>
    <ows:ProviderSite xlink:href="{}"/>
  </ows:ServiceProvider>
"#,
            xml_escape(&self.service.provider_name),
            xml_escape(&self.service.provider_site),
        ));

        // OperationsMetadata
        xml.push_str(&format!(
            r#"  <ows:OperationsMetadata>
    <ows:Operation name="GetCapabilities">
      <ows:DCP>
        <ows:HTTP>
          <ows:Get xlink:href="{0}/wmts?">
            <ows:Constraint name="GetEncoding">
              <ows:AllowedValues><ows:Value>KVP</ows:Value></ows:AllowedValues>
            </ows:Constraint>
          </ows:Get>
        </ows:HTTP>
      </ows:DCP>
    </ows:Operation>
    <ows:Operation name="GetTile">
      <ows:DCP>
        <ows:HTTP>
          <ows:Get xlink:href="{0}/wmts?">
            <ows:Constraint name="GetEncoding">
              <ows:AllowedValues><ows:Value>KVP</ows:Value></ows:AllowedValues>
            </ows:Constraint>
          </ows:Get>
          <ows:Get xlink:href="{0}/wmts/rest/">
            <ows:Constraint name="GetEncoding">
              <ows:AllowedValues><ows:Value>RESTful</ows:Value></ows:AllowedValues>
            </ows:Constraint>
          </ows:Get>
        </ows:HTTP>
      </ows:DCP>
    </ows:Operation>
  </ows:OperationsMetadata>
"#,
            self.base_url
        ));

        xml.push_str("  <Contents>\n");

        for layer in &self.layers {
            xml.push_str(&format!(
                r#"    <Layer>
      <ows:Title>{}</ows:Title>
      <ows:Identifier>{}</ows:Identifier>
"#,
                xml_escape(&layer.title),
                xml_escape(&layer.identifier)
            ));

            if let Some(bbox) = &layer.wgs84_bbox {
                xml.push_str(&format!(
                    r#"      <ows:WGS84BoundingBox>
        <ows:LowerCorner>{} {}</ows:LowerCorner>
        <ows:UpperCorner>{} {}</ows:UpperCorner>
      </ows:WGS84BoundingBox>
"#,
                    bbox.min_x, bbox.min_y, bbox.max_x, bbox.max_y
                ));
            }

            if let Some(bbox) = &layer.native_bbox {
                xml.push_str(&format!(
                    r#"      <ows:BoundingBox crs="{}">
        <ows:LowerCorner>{} {}</ows:LowerCorner>
        <ows:UpperCorner>{} {}</ows:UpperCorner>
      </ows:BoundingBox>
"#,
                    layer.native_crs.urn(),
                    bbox.min_x,
                    bbox.min_y,
                    bbox.max_x,
                    bbox.max_y
                ));
            }

            xml.push_str(&format!(
                r#"      <Style isDefault="true">
        <ows:Title>default</ows:Title>
        <ows:Identifier>default</ows:Identifier>
      </Style>
      <Format>{}</Format>
      <TileMatrixSetLink>
        <TileMatrixSet>{}</TileMatrixSet>
      </TileMatrixSetLink>
      <ResourceURL format="{}" resourceType="tile" template="{}/wmts/rest/{}/{}/{{Style}}/{{TileMatrixSet}}/{{TileMatrix}}/{{TileRow}}/{{TileCol}}.png"/>
    </Layer>
"#,
                xml_escape(&layer.format),
                xml_escape(&layer.tile_matrix_set_id),
                xml_escape(&layer.format),
                self.base_url,
                xml_escape(&layer.project_key),
                xml_escape(&layer.layer_key),
            ));
        }

        for set in &self.matrix_sets {
            xml.push_str(&format!(
                r#"    <TileMatrixSet>
      <ows:Identifier>{}</ows:Identifier>
      <ows:SupportedCRS>{}</ows:SupportedCRS>
"#,
                xml_escape(&set.identifier),
                set.crs.urn()
            ));

            for matrix in &set.matrices {
                xml.push_str(&format!(
                    r#"      <TileMatrix>
        <ows:Identifier>{}</ows:Identifier>
        <ScaleDenominator>{}</ScaleDenominator>
        <TopLeftCorner>{} {}</TopLeftCorner>
        <TileWidth>{}</TileWidth>
        <TileHeight>{}</TileHeight>
        <MatrixWidth>{}</MatrixWidth>
        <MatrixHeight>{}</MatrixHeight>
      </TileMatrix>
"#,
                    xml_escape(&matrix.identifier),
                    matrix.scale_denominator,
                    matrix.top_left.0,
                    matrix.top_left.1,
                    matrix.tile_width,
                    matrix.tile_height,
                    matrix.matrix_width,
                    matrix.matrix_height
                ));
            }

            xml.push_str("    </TileMatrixSet>\n");
        }

        xml.push_str("  </Contents>\n</Capabilities>\n");
        xml
    }
}

/// KVP (Key-Value Pair) query parameters for WMTS, matched case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct WmtsKvpParams {
    pub service: Option<String>,
    pub request: Option<String>,
    pub version: Option<String>,
    pub layer: Option<String>,
    pub style: Option<String>,
    pub format: Option<String>,
    pub tile_matrix_set: Option<String>,
    pub tile_matrix: Option<String>,
    pub tile_row: Option<i64>,
    pub tile_col: Option<i64>,
    /// Capabilities filters.
    pub project: Option<String>,
    /// Viewer session id for on-demand abort.
    pub sid: Option<String>,
}

impl WmtsKvpParams {
    /// Build from a query map, matching parameter names case-insensitively.
    pub fn from_query(query: &HashMap<String, String>) -> Self {
        let mut params = Self::default();
        for (key, value) in query {
            match key.to_ascii_uppercase().as_str() {
                "SERVICE" => params.service = Some(value.clone()),
                "REQUEST" => params.request = Some(value.clone()),
                "VERSION" => params.version = Some(value.clone()),
                "LAYER" => params.layer = Some(value.clone()),
                "STYLE" => params.style = Some(value.clone()),
                "FORMAT" => params.format = Some(value.clone()),
                "TILEMATRIXSET" => params.tile_matrix_set = Some(value.clone()),
                "TILEMATRIX" => params.tile_matrix = Some(value.clone()),
                "TILEROW" => params.tile_row = value.trim().parse().ok(),
                "TILECOL" => params.tile_col = value.trim().parse().ok(),
                "PROJECT" => params.project = Some(value.clone()),
                "SID" => params.sid = Some(value.clone()),
                _ => {}
            }
        }
        params
    }

    /// Normalize a TileMatrix identifier: some clients prepend the CRS
    /// (`EPSG:3006:5`); the significant part is the last `:` segment.
    pub fn normalized_tile_matrix(&self) -> Option<String> {
        self.tile_matrix
            .as_deref()
            .map(|tm| tm.rsplit(':').next().unwrap_or(tm).trim().to_string())
    }
}

/// Generate a WMTS exception report.
pub fn wmts_exception(code: &str, message: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<ows:ExceptionReport xmlns:ows="http://www.opengis.net/ows/1.1" version="1.0.0">
  <ows:Exception exceptionCode="{}">
    <ows:ExceptionText>{}</ows:ExceptionText>
  </ows:Exception>
</ows:ExceptionReport>"#,
        xml_escape(code),
        xml_escape(message)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_kvp_case_insensitive() {
        let params = WmtsKvpParams::from_query(&query(&[
            ("service", "WMTS"),
            ("Request", "GetTile"),
            ("LAYER", "orto_parcels"),
            ("tilematrix", "5"),
            ("TileRow", "10"),
            ("TILECOL", "15"),
        ]));
        assert_eq!(params.service.as_deref(), Some("WMTS"));
        assert_eq!(params.request.as_deref(), Some("GetTile"));
        assert_eq!(params.layer.as_deref(), Some("orto_parcels"));
        assert_eq!(params.tile_row, Some(10));
        assert_eq!(params.tile_col, Some(15));
    }

    #[test]
    fn test_tile_matrix_crs_prefix_stripped() {
        let params = WmtsKvpParams::from_query(&query(&[("TILEMATRIX", "EPSG:3006:5")]));
        assert_eq!(params.normalized_tile_matrix().as_deref(), Some("5"));

        let plain = WmtsKvpParams::from_query(&query(&[("TILEMATRIX", "7")]));
        assert_eq!(plain.normalized_tile_matrix().as_deref(), Some("7"));
    }

    #[test]
    fn test_capabilities_document() {
        let builder = WmtsCapabilitiesBuilder {
            service: ServiceMetadata::default(),
            base_url: "http://example.test".to_string(),
            layers: vec![WmtsLayerEntry {
                identifier: "orto_parcels".to_string(),
                title: "parcels".to_string(),
                project_key: "orto".to_string(),
                layer_key: "parcels".to_string(),
                tile_matrix_set_id: "EPSG_3857".to_string(),
                native_crs: CrsId::epsg_3857(),
                wgs84_bbox: Some(BoundingBox::new(11.0, 55.0, 24.0, 69.0)),
                native_bbox: None,
                format: "image/png".to_string(),
            }],
            matrix_sets: vec![WmtsMatrixSet {
                identifier: "EPSG_3857".to_string(),
                crs: CrsId::epsg_3857(),
                matrices: vec![WmtsMatrix {
                    identifier: "0".to_string(),
                    scale_denominator: 559082264.0287178,
                    top_left: (-20037508.342789244, 20037508.342789244),
                    tile_width: 256,
                    tile_height: 256,
                    matrix_width: 1,
                    matrix_height: 1,
                }],
            }],
        };

        let xml = builder.build();
        assert!(xml.contains("<ows:Identifier>orto_parcels</ows:Identifier>"));
        assert!(xml.contains("<TileMatrixSet>EPSG_3857</TileMatrixSet>"));
        assert!(xml.contains("urn:ogc:def:crs:EPSG::3857"));
        assert!(xml.contains(
            "template=\"http://example.test/wmts/rest/orto/parcels/{Style}/{TileMatrixSet}/{TileMatrix}/{TileRow}/{TileCol}.png\""
        ));
        assert!(xml.contains("<ScaleDenominator>559082264.0287178</ScaleDenominator>"));
    }

    #[test]
    fn test_exception_escapes() {
        let xml = wmts_exception("TileOutOfRange", "row > max");
        assert!(xml.contains("exceptionCode=\"TileOutOfRange\""));
        assert!(xml.contains("row &gt; max"));
    }
}
