//! OGC WMS 1.3.0 protocol implementation.
//!
//! GetMap here never renders: the server resolves the request to the
//! closest cached tile and redirects to the WMTS binding, so this module
//! only covers the capabilities document and KVP parsing.

use crate::xml::xml_escape;
use crate::wmts::WmtsLayerEntry;
use crate::ServiceMetadata;
use std::collections::HashMap;
use tile_common::{BoundingBox, CrsId};

/// WMS GetCapabilities document builder, fed from the same inventory
/// records as the WMTS document.
pub struct WmsCapabilitiesBuilder {
    pub service: ServiceMetadata,
    pub base_url: String,
    pub layers: Vec<WmtsLayerEntry>,
}

impl WmsCapabilitiesBuilder {
    pub fn build(&self) -> String {
        let mut xml = String::new();

        xml.push_str(&format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<WMS_Capabilities xmlns="http://www.opengis.net/wms"
    xmlns:xlink="http://www.w3.org/1999/xlink"
    version="1.3.0">
  <Service>
    <Name>WMS</Name>
    <Title>{}</Title>
    <Abstract>{}</Abstract>
    <OnlineResource xlink:href="{}/wms"/>
  </Service>
  <Capability>
    <Request>
      <GetCapabilities>
        <Format>text/xml</Format>
        <DCPType><HTTP><Get><OnlineResource xlink:href="{2}/wms?"/></Get></HTTP></DCPType>
      </GetCapabilities>
      <GetMap>
        <Format>image/png</Format>
        <DCPType><HTTP><Get><OnlineResource xlink:href="{2}/wms?"/></Get></HTTP></DCPType>
      </GetMap>
    </Request>
    <Exception>
      <Format>XML</Format>
    </Exception>
    <Layer>
      <Title>{0}</Title>
"#,
            xml_escape(&self.service.title),
            xml_escape(&self.service.abstract_text),
            self.base_url,
        ));

        for layer in &self.layers {
            xml.push_str(&layer_xml(layer));
        }

        xml.push_str("    </Layer>\n  </Capability>\n</WMS_Capabilities>\n");
        xml
    }
}

fn layer_xml(layer: &WmtsLayerEntry) -> String {
    let mut xml = String::new();
    xml.push_str(&format!(
        r#"      <Layer queryable="0">
        <Name>{}</Name>
        <Title>{}</Title>
"#,
        xml_escape(&layer.identifier),
        xml_escape(&layer.title)
    ));

    // Advertised CRS list: the portable trio plus the native tile CRS.
    let mut crs_list = vec![
        "CRS:84".to_string(),
        "EPSG:4326".to_string(),
        "EPSG:3857".to_string(),
    ];
    let native = layer.native_crs.as_str().to_string();
    if !crs_list.contains(&native) {
        crs_list.push(native);
    }
    for crs in &crs_list {
        xml.push_str(&format!("        <CRS>{}</CRS>\n", xml_escape(crs)));
    }

    if let Some(bbox) = &layer.wgs84_bbox {
        xml.push_str(&format!(
            r#"        <EX_GeographicBoundingBox>
          <westBoundLongitude>{}</westBoundLongitude>
          <eastBoundLongitude>{}</eastBoundLongitude>
          <southBoundLatitude>{}</southBoundLatitude>
          <northBoundLatitude>{}</northBoundLatitude>
        </EX_GeographicBoundingBox>
"#,
            bbox.min_x, bbox.max_x, bbox.min_y, bbox.max_y
        ));
        // WMS 1.3.0: EPSG:4326 is northing-first.
        xml.push_str(&bounding_box_xml(
            &CrsId::epsg_4326(),
            bbox,
        ));
    }

    if let Some(bbox) = &layer.native_bbox {
        if layer.native_crs != CrsId::epsg_4326() {
            xml.push_str(&bounding_box_xml(&layer.native_crs, bbox));
        }
    }

    xml.push_str(
        r#"        <Style>
          <Name>default</Name>
          <Title>default</Title>
        </Style>
      </Layer>
"#,
    );
    xml
}

/// A `<BoundingBox>` element honoring the CRS axis order.
fn bounding_box_xml(crs: &CrsId, bbox: &BoundingBox) -> String {
    if crs.northing_first() {
        format!(
            "        <BoundingBox CRS=\"{}\" minx=\"{}\" miny=\"{}\" maxx=\"{}\" maxy=\"{}\"/>\n",
            xml_escape(crs.as_str()),
            bbox.min_y,
            bbox.min_x,
            bbox.max_y,
            bbox.max_x
        )
    } else {
        format!(
            "        <BoundingBox CRS=\"{}\" minx=\"{}\" miny=\"{}\" maxx=\"{}\" maxy=\"{}\"/>\n",
            xml_escape(crs.as_str()),
            bbox.min_x,
            bbox.min_y,
            bbox.max_x,
            bbox.max_y
        )
    }
}

/// KVP query parameters for WMS, matched case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct WmsKvpParams {
    pub service: Option<String>,
    pub request: Option<String>,
    pub version: Option<String>,
    pub layers: Option<String>,
    pub bbox: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub crs: Option<String>,
    pub format: Option<String>,
    pub project: Option<String>,
}

impl WmsKvpParams {
    pub fn from_query(query: &HashMap<String, String>) -> Self {
        let mut params = Self::default();
        for (key, value) in query {
            match key.to_ascii_uppercase().as_str() {
                "SERVICE" => params.service = Some(value.clone()),
                "REQUEST" => params.request = Some(value.clone()),
                "VERSION" => params.version = Some(value.clone()),
                "LAYERS" => params.layers = Some(value.clone()),
                "BBOX" => params.bbox = Some(value.clone()),
                "WIDTH" => params.width = value.trim().parse().ok(),
                "HEIGHT" => params.height = value.trim().parse().ok(),
                // WMS 1.1.1 clients send SRS instead of CRS.
                "CRS" | "SRS" => params.crs = Some(value.clone()),
                "FORMAT" => params.format = Some(value.clone()),
                "PROJECT" => params.project = Some(value.clone()),
                _ => {}
            }
        }
        params
    }
}

/// Generate a WMS service exception report.
pub fn wms_exception(code: &str, message: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<ServiceExceptionReport xmlns="http://www.opengis.net/ogc" version="1.3.0">
  <ServiceException code="{}">{}</ServiceException>
</ServiceExceptionReport>"#,
        xml_escape(code),
        xml_escape(message)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> WmtsLayerEntry {
        WmtsLayerEntry {
            identifier: "orto_parcels".to_string(),
            title: "parcels".to_string(),
            project_key: "orto".to_string(),
            layer_key: "parcels".to_string(),
            tile_matrix_set_id: "EPSG_3857".to_string(),
            native_crs: CrsId::normalize("EPSG:3006").unwrap(),
            wgs84_bbox: Some(BoundingBox::new(11.0, 55.0, 24.0, 69.0)),
            native_bbox: Some(BoundingBox::new(200000.0, 6100000.0, 900000.0, 7700000.0)),
            format: "image/png".to_string(),
        }
    }

    #[test]
    fn test_capabilities_layers_and_crs() {
        let xml = WmsCapabilitiesBuilder {
            service: ServiceMetadata::default(),
            base_url: "http://example.test".to_string(),
            layers: vec![entry()],
        }
        .build();

        assert!(xml.contains("<Name>orto_parcels</Name>"));
        assert!(xml.contains("<CRS>CRS:84</CRS>"));
        assert!(xml.contains("<CRS>EPSG:3006</CRS>"));
        assert!(xml.contains("<westBoundLongitude>11</westBoundLongitude>"));
    }

    #[test]
    fn test_axis_order_in_bounding_boxes() {
        let xml = WmsCapabilitiesBuilder {
            service: ServiceMetadata::default(),
            base_url: "http://example.test".to_string(),
            layers: vec![entry()],
        }
        .build();

        // EPSG:4326 swaps to lat/lon order.
        assert!(xml.contains("<BoundingBox CRS=\"EPSG:4326\" minx=\"55\" miny=\"11\""));
        // EPSG:3006 is northing-first too.
        assert!(xml.contains("<BoundingBox CRS=\"EPSG:3006\" minx=\"6100000\" miny=\"200000\""));
    }

    #[test]
    fn test_kvp_srs_alias() {
        let mut query = HashMap::new();
        query.insert("srs".to_string(), "EPSG:3857".to_string());
        query.insert("WIDTH".to_string(), "256".to_string());
        let params = WmsKvpParams::from_query(&query);
        assert_eq!(params.crs.as_deref(), Some("EPSG:3857"));
        assert_eq!(params.width, Some(256));
    }
}
