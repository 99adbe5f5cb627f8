//! Coordinate Reference System handling

use serde::{Deserialize, Serialize};
use std::fmt;

/// Projection metadata carried from the input raster to every output.
///
/// flowtile never reprojects; the CRS is opaque apart from the EPSG code
/// and WKT text that band formats can store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CRS {
    wkt: Option<String>,
    epsg: Option<u32>,
}

impl CRS {
    /// Create a CRS from an EPSG code
    pub fn from_epsg(code: u32) -> Self {
        Self {
            wkt: None,
            epsg: Some(code),
        }
    }

    /// Create a CRS from a WKT string
    pub fn from_wkt(wkt: impl Into<String>) -> Self {
        Self {
            wkt: Some(wkt.into()),
            epsg: None,
        }
    }

    /// Attach an EPSG code to a WKT definition
    pub fn with_epsg(mut self, code: u32) -> Self {
        self.epsg = Some(code);
        self
    }

    pub fn epsg(&self) -> Option<u32> {
        self.epsg
    }

    pub fn wkt(&self) -> Option<&str> {
        self.wkt.as_deref()
    }
}

impl fmt::Display for CRS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.epsg, &self.wkt) {
            (Some(code), _) => write!(f, "EPSG:{}", code),
            (None, Some(wkt)) => {
                let head: String = wkt.chars().take(48).collect();
                write!(f, "{}...", head)
            }
            (None, None) => write!(f, "unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(CRS::from_epsg(32719).to_string(), "EPSG:32719");
        assert_eq!(CRS::from_wkt("LOCAL_CS[\"x\"]").with_epsg(4326).epsg(), Some(4326));
    }
}
