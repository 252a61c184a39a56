use std::net::IpAddr;
use std::path::Path;

use maxminddb::{geoip2::City, Reader};

use crate::utils::get_data_dir;

pub const GEOLITE_DB: &str = "GeoLite2-City.mmdb";

/// Country information for a proxy's IP. Unknown lookups keep the defaults,
/// a missing database is never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoData {
    pub iso_code: String,
    pub name: String,
}

impl Default for GeoData {
    fn default() -> Self {
        Self {
            iso_code: String::from("--"),
            name: String::from("unknown"),
        }
    }
}

/// Opaque country-of-IP lookup over a read-only GeoLite2 database.
#[derive(Debug, Default)]
pub struct GeoLookup {
    reader: Option<Reader<Vec<u8>>>,
}

impl GeoLookup {
    /// Opens the database from the per-user data directory. Degrades to
    /// `GeoData::default()` answers when the file is absent.
    pub fn open() -> Self {
        let path = get_data_dir(Some(GEOLITE_DB));
        Self::from_path(&path)
    }

    pub fn from_path(path: &Path) -> Self {
        match Reader::open_readfile(path) {
            Ok(reader) => Self {
                reader: Some(reader),
            },
            Err(e) => {
                log::debug!("geolite database unavailable at {:?}: {}", path, e);
                Self { reader: None }
            }
        }
    }

    pub fn country(&self, ip: IpAddr) -> GeoData {
        let mut geodata = GeoData::default();
        let reader = match &self.reader {
            Some(reader) => reader,
            None => return geodata,
        };

        if let Ok(lookup) = reader.lookup::<City>(ip) {
            if let Some(country) = &lookup.country {
                if let Some(iso_code) = &country.iso_code {
                    geodata.iso_code = iso_code.to_string()
                }
                if let Some(names) = &country.names {
                    if let Some(name) = names.get("en") {
                        geodata.name = name.to_string();
                    }
                }
            } else if let Some(continent) = &lookup.continent {
                if let Some(code) = &continent.code {
                    geodata.iso_code = code.to_string()
                }
                if let Some(names) = &continent.names {
                    if let Some(name) = names.get("en") {
                        geodata.name = name.to_string();
                    }
                }
            }
        }
        geodata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_database_degrades() {
        let lookup = GeoLookup::from_path(Path::new("/nonexistent/geolite.mmdb"));
        let geo = lookup.country("8.8.8.8".parse().unwrap());
        assert_eq!(geo.iso_code, "--");
        assert_eq!(geo.name, "unknown");
    }
}
