use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

pub const DEFAULT_RASTER_PROBE_PROGRAM: &str = "gdalinfo";

/// What the checksum tier needs to know about one opened raster.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RasterDataset {
    pub driver: String,
    pub bands: Vec<RasterBand>,
    pub geotransform: Option<Vec<f64>>,
    pub projection: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RasterBand {
    pub checksum: Option<i64>,
    pub metadata: BTreeMap<String, String>,
}

impl RasterDataset {
    /// Dataset metadata without the listed keys.
    pub fn metadata_without(&self, volatile_keys: &[String]) -> BTreeMap<String, String> {
        self.metadata
            .iter()
            .filter(|(key, _)| !volatile_keys.iter().any(|volatile| volatile == *key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

/// Opens files as multi-band rasters. `None` signals that the file could not be
/// opened, or that the raster library is not available at all.
pub trait RasterProbe {
    fn open(&self, path: &Path) -> Option<RasterDataset>;

    /// Version of the raster library, e.g. `3.8.4`.
    fn library_version(&self) -> Option<String>;
}

/// Probe backed by the `gdalinfo` command line tool.
#[derive(Debug, Clone)]
pub struct GdalInfoProbe {
    program: PathBuf,
}

impl GdalInfoProbe {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl Default for GdalInfoProbe {
    fn default() -> Self {
        Self::new(DEFAULT_RASTER_PROBE_PROGRAM)
    }
}

impl RasterProbe for GdalInfoProbe {
    fn open(&self, path: &Path) -> Option<RasterDataset> {
        let output = Command::new(&self.program)
            .args(["-json", "-checksum", "-mdd", "all"])
            .arg(path)
            .output();
        let output = match output {
            Ok(output) => output,
            Err(error) => {
                tracing::warn!(
                    program = %self.program.display(),
                    error = %error,
                    "raster probe could not be started"
                );
                return None;
            }
        };
        if !output.status.success() {
            tracing::debug!(path = %path.display(), "raster probe could not open file");
            return None;
        }

        parse_gdalinfo_json(&String::from_utf8_lossy(&output.stdout))
            .inspect_err(|error| {
                tracing::debug!(path = %path.display(), error = %error, "raster probe output rejected");
            })
            .ok()
    }

    fn library_version(&self) -> Option<String> {
        let output = Command::new(&self.program).arg("--version").output().ok()?;
        parse_gdal_version(&String::from_utf8_lossy(&output.stdout))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GdalInfoDocument {
    #[serde(default)]
    driver_short_name: String,
    #[serde(default)]
    bands: Vec<GdalInfoBand>,
    #[serde(default)]
    geo_transform: Option<Vec<f64>>,
    #[serde(default)]
    coordinate_system: Option<GdalInfoCoordinateSystem>,
    #[serde(default)]
    metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GdalInfoBand {
    #[serde(default)]
    checksum: Option<i64>,
    #[serde(default)]
    metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GdalInfoCoordinateSystem {
    #[serde(default)]
    wkt: String,
}

pub fn parse_gdalinfo_json(json: &str) -> Result<RasterDataset, serde_json::Error> {
    let document: GdalInfoDocument = serde_json::from_str(json)?;
    Ok(RasterDataset {
        driver: document.driver_short_name,
        bands: document
            .bands
            .into_iter()
            .map(|band| RasterBand {
                checksum: band.checksum,
                metadata: default_domain(&band.metadata),
            })
            .collect(),
        geotransform: document.geo_transform,
        projection: document.coordinate_system.map(|system| system.wkt),
        metadata: default_domain(&document.metadata),
    })
}

// The default metadata domain is keyed by the empty string.
fn default_domain(domains: &BTreeMap<String, serde_json::Value>) -> BTreeMap<String, String> {
    let Some(serde_json::Value::Object(entries)) = domains.get("") else {
        return BTreeMap::new();
    };
    entries
        .iter()
        .map(|(key, value)| {
            let value = match value {
                serde_json::Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            (key.clone(), value)
        })
        .collect()
}

/// Extracts `x.y.z` from `GDAL x.y.z[suffix], released yyyy/mm/dd`.
pub fn parse_gdal_version(banner: &str) -> Option<String> {
    let rest = banner.trim().strip_prefix("GDAL ")?;
    let token = rest.split([',', ' ']).next()?;
    let numeric: String = token
        .chars()
        .take_while(|character| character.is_ascii_digit() || *character == '.')
        .collect();
    let numeric = numeric.trim_end_matches('.');
    (!numeric.is_empty()).then(|| numeric.to_string())
}

#[cfg(test)]
mod tests {
    use super::{parse_gdal_version, parse_gdalinfo_json};

    const NETCDF_INFO: &str = r#"{
      "driverShortName": "netCDF",
      "geoTransform": [0.0, 1.0, 0.0, 10.0, 0.0, -1.0],
      "coordinateSystem": { "wkt": "GEOGCRS[\"WGS 84\"]" },
      "metadata": {
        "": { "NC_GLOBAL#history": "Mon Jan 1 2024", "NC_GLOBAL#title": "t" },
        "DERIVED_SUBDATASETS": { "DERIVED_SUBDATASET_1_NAME": "x" }
      },
      "bands": [
        { "band": 1, "checksum": 4672, "metadata": { "": { "NETCDF_VARNAME": "Band1" } } },
        { "band": 2, "checksum": 17 }
      ]
    }"#;

    #[test]
    fn gdalinfo_json_keeps_default_domain_only() {
        let dataset = parse_gdalinfo_json(NETCDF_INFO).expect("gdalinfo json should parse");
        assert_eq!(dataset.driver, "netCDF");
        assert_eq!(dataset.bands.len(), 2);
        assert_eq!(dataset.bands[0].checksum, Some(4672));
        assert_eq!(
            dataset.bands[0].metadata.get("NETCDF_VARNAME").map(String::as_str),
            Some("Band1")
        );
        assert!(dataset.bands[1].metadata.is_empty());
        assert_eq!(dataset.metadata.len(), 2);
        assert_eq!(dataset.projection.as_deref(), Some("GEOGCRS[\"WGS 84\"]"));

        let stable = dataset.metadata_without(&["NC_GLOBAL#history".to_string()]);
        assert_eq!(stable.len(), 1);
        assert!(stable.contains_key("NC_GLOBAL#title"));
    }

    #[test]
    fn gdalinfo_json_rejects_non_json_output() {
        assert!(parse_gdalinfo_json("ERROR 4: not recognized as a supported file format").is_err());
    }

    #[test]
    fn gdal_version_banner_is_reduced_to_numbers() {
        assert_eq!(
            parse_gdal_version("GDAL 3.8.4, released 2024/02/08\n").as_deref(),
            Some("3.8.4")
        );
        assert_eq!(
            parse_gdal_version("GDAL 3.10.0dev-abc, released 2024/05/01").as_deref(),
            Some("3.10.0")
        );
        assert_eq!(parse_gdal_version("gdalinfo: command not found"), None);
    }
}
