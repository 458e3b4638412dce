mod controller;
mod geosite;
mod logger;
mod mmdb;

pub use controller::*;
pub use geosite::*;
pub use logger::*;
pub use mmdb::*;

use crate::config::{safe_join_path, ConfigError, FileError};
use std::path::Path;
use std::sync::Arc;

/// Optional lookup databases shared by GEOIP and GEOSITE rules.
#[derive(Debug, Clone, Default)]
pub struct GeoDatabases {
    pub mmdb: Option<Arc<MmdbReader>>,
    pub geosite: Option<Arc<GeoSiteDb>>,
}

impl GeoDatabases {
    pub fn load(
        config_dir: &Path,
        geoip_db: Option<&str>,
        geosite_db: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let mmdb = match geoip_db {
            Some(p) => {
                let path = safe_join_path(config_dir, p)?;
                let reader = MmdbReader::read_from_file(&path).map_err(|e| {
                    FileError::Io(
                        path.to_string_lossy().to_string(),
                        std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
                    )
                })?;
                Some(Arc::new(reader))
            }
            None => None,
        };
        let geosite = match geosite_db {
            Some(p) => {
                let path = safe_join_path(config_dir, p)?;
                let db = GeoSiteDb::read_from_file(&path).map_err(|e| {
                    FileError::Io(
                        path.to_string_lossy().to_string(),
                        std::io::Error::new(std::io::ErrorKind::InvalidData, e),
                    )
                })?;
                Some(Arc::new(db))
            }
            None => None,
        };
        Ok(Self { mmdb, geosite })
    }
}
