//! OGC WMTS and WMS protocol documents.
//!
//! Supports:
//! - WMTS 1.0.0 GetCapabilities (KVP and RESTful bindings)
//! - WMS 1.3.0 GetCapabilities
//! - OGC exception reports
//!
//! Documents are built from normalized layer/matrix records produced by the
//! server's cache inventory; this crate knows nothing about the cache layout.

pub mod service;
pub mod wms;
pub mod wmts;
pub mod xml;

pub use service::ServiceMetadata;
pub use wms::{wms_exception, WmsCapabilitiesBuilder, WmsKvpParams};
pub use wmts::{
    wmts_exception, WmtsCapabilitiesBuilder, WmtsKvpParams, WmtsLayerEntry, WmtsMatrix,
    WmtsMatrixSet,
};
pub use xml::xml_escape;
