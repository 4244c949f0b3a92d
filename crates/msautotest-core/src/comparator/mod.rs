//! Tiered classification of a result file against its expected baseline.
//!
//! Tiers run in order and stop at the first decisive outcome: existence,
//! byte-exact (also against `<expected>.alternative`), raster checksums
//! through a [`RasterProbe`], and a perceptual diff through a
//! [`PerceptualDiff`]. Which files skip the byte tier, and which fail fast as
//! structured text, is data in [`ComparatorConfig`].

pub mod pdiff;
pub mod raster;

pub use pdiff::{CommandPerceptualDiff, PerceptualDiff, PerceptualVerdict};
pub use raster::{GdalInfoProbe, RasterBand, RasterDataset, RasterProbe};

use crate::domain::{AutotestError, Outcome};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

pub const ALTERNATIVE_SUFFIX: &str = ".alternative";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComparatorConfig {
    /// File-name globs of text formats that never fall back to image tiers.
    pub structured_text_globs: Vec<String>,
    pub raster_exemptions: Vec<RasterFormatExemption>,
}

/// A raster format whose serialization is not reproducible. Matching files
/// skip the byte tier; datasets opened with `driver` must additionally agree
/// on georeferencing and metadata (minus the volatile keys).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RasterFormatExemption {
    pub file_glob: String,
    pub driver: String,
    #[serde(default)]
    pub volatile_metadata_keys: Vec<String>,
}

impl Default for ComparatorConfig {
    fn default() -> Self {
        Self {
            structured_text_globs: vec!["*.xml".to_string()],
            raster_exemptions: vec![RasterFormatExemption {
                file_glob: "*.nc".to_string(),
                driver: "netCDF".to_string(),
                volatile_metadata_keys: vec!["NC_GLOBAL#history".to_string()],
            }],
        }
    }
}

impl ComparatorConfig {
    pub fn from_json_path(path: impl AsRef<Path>) -> Result<Self, ComparatorError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ComparatorError::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ComparatorError::ParseConfig {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_json_str(json: &str) -> Result<Self, ComparatorError> {
        serde_json::from_str(json).map_err(|source| ComparatorError::ParseConfig {
            path: PathBuf::from("<inline-config>"),
            source,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ComparatorError {
    #[error("failed to read comparator config '{}': {source}", path.display())]
    ReadConfig {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse comparator config '{}': {source}", path.display())]
    ParseConfig {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid file glob '{pattern}': {source}")]
    InvalidGlob {
        pattern: String,
        source: globset::Error,
    },
}

impl From<ComparatorError> for AutotestError {
    fn from(error: ComparatorError) -> Self {
        match error {
            ComparatorError::ReadConfig { .. } => {
                AutotestError::io_system("IO.COMPARATOR_CONFIG", error.to_string())
            }
            ComparatorError::ParseConfig { .. } | ComparatorError::InvalidGlob { .. } => {
                AutotestError::input_validation("INPUT.COMPARATOR_CONFIG", error.to_string())
            }
        }
    }
}

/// Whether the perceptual-diff tool is usable. Learned on first use and kept
/// for the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolAvailability {
    #[default]
    Unknown,
    Available,
    Unavailable,
}

struct CompiledExemption {
    matcher: GlobSet,
    driver: String,
    volatile_metadata_keys: Vec<String>,
}

pub struct Comparator {
    structured_text: GlobSet,
    exemptions: Vec<CompiledExemption>,
    raster_probe: Box<dyn RasterProbe>,
    perceptual_diff: Box<dyn PerceptualDiff>,
    perceptual_diff_availability: ToolAvailability,
}

impl Comparator {
    pub fn new(
        config: &ComparatorConfig,
        raster_probe: Box<dyn RasterProbe>,
        perceptual_diff: Box<dyn PerceptualDiff>,
    ) -> Result<Self, ComparatorError> {
        let structured_text = compile_globs(&config.structured_text_globs)?;
        let exemptions = config
            .raster_exemptions
            .iter()
            .map(|exemption| -> Result<CompiledExemption, ComparatorError> {
                Ok(CompiledExemption {
                    matcher: compile_globs(std::slice::from_ref(&exemption.file_glob))?,
                    driver: exemption.driver.clone(),
                    volatile_metadata_keys: exemption.volatile_metadata_keys.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            structured_text,
            exemptions,
            raster_probe,
            perceptual_diff,
            perceptual_diff_availability: ToolAvailability::Unknown,
        })
    }

    /// Comparator backed by the `gdalinfo` and `perceptualdiff` style command line tools.
    pub fn with_programs(
        config: &ComparatorConfig,
        raster_probe_program: impl Into<PathBuf>,
        perceptual_diff_program: impl Into<PathBuf>,
    ) -> Result<Self, ComparatorError> {
        Self::new(
            config,
            Box::new(GdalInfoProbe::new(raster_probe_program)),
            Box::new(CommandPerceptualDiff::new(perceptual_diff_program)),
        )
    }

    pub fn raster_probe(&self) -> &dyn RasterProbe {
        self.raster_probe.as_ref()
    }

    pub fn perceptual_diff_availability(&self) -> ToolAvailability {
        self.perceptual_diff_availability
    }

    pub fn compare(&mut self, result: &Path, expected: &Path) -> Outcome {
        let outcome = self.classify(result, expected);
        tracing::debug!(
            result = %result.display(),
            expected = %expected.display(),
            outcome = outcome.as_str(),
            "compared result"
        );
        outcome
    }

    fn classify(&mut self, result: &Path, expected: &Path) -> Outcome {
        if !is_non_empty_file(result) {
            return Outcome::NoResult;
        }
        if !expected.is_file() {
            return Outcome::NoExpected;
        }

        let alternative = alternative_path(expected);
        let file_name = expected.file_name().map(Path::new).unwrap_or(expected);
        let byte_exempt = self
            .exemptions
            .iter()
            .any(|exemption| exemption.matcher.is_match(file_name));

        if !byte_exempt {
            if files_identical(result, expected) {
                return Outcome::Match;
            }
            if alternative.is_file() && files_identical(result, &alternative) {
                return Outcome::Match;
            }
            if self.structured_text.is_match(file_name) {
                return Outcome::NoMatch;
            }
        }

        let outcome = self.compare_rasters(result, expected);
        if outcome != Outcome::NoMatch {
            return outcome;
        }
        if alternative.is_file() {
            let outcome = self.compare_rasters(result, &alternative);
            if outcome != Outcome::NoMatch {
                return outcome;
            }
        }

        if self.perceptual_diff_availability != ToolAvailability::Unavailable
            && pdiff::has_image_signature(result)
            && let Some(outcome) = self.compare_perceptually(result, expected)
        {
            return outcome;
        }

        Outcome::NoMatch
    }

    fn compare_rasters(&self, result: &Path, expected: &Path) -> Outcome {
        let Some(expected_dataset) = self.raster_probe.open(expected) else {
            return Outcome::NoMatch;
        };
        let Some(result_dataset) = self.raster_probe.open(result) else {
            return Outcome::NoMatch;
        };

        let checksums_match = expected_dataset.bands.iter().enumerate().all(|(index, band)| {
            let result_checksum = result_dataset.bands.get(index).and_then(|band| band.checksum);
            band.checksum.is_some() && band.checksum == result_checksum
        });
        if !checksums_match {
            return Outcome::NoMatch;
        }

        let exemption = self
            .exemptions
            .iter()
            .find(|exemption| exemption.driver == expected_dataset.driver);
        match exemption {
            Some(exemption) => {
                if metadata_matches(&expected_dataset, &result_dataset, exemption) {
                    Outcome::Match
                } else {
                    Outcome::NoMatch
                }
            }
            None => Outcome::ImageMatchFilesDiffer,
        }
    }

    fn compare_perceptually(&mut self, result: &Path, expected: &Path) -> Option<Outcome> {
        // Temporary copies are dropped, and so deleted, when this function returns.
        let result_copy = stripped_copy(result);
        let expected_copy = stripped_copy(expected);
        let result_path = result_copy.as_ref().map_or(result, |copy| copy.path());
        let expected_path = expected_copy.as_ref().map_or(expected, |copy| copy.path());

        let report = self.perceptual_diff.report(result_path, expected_path);
        match pdiff::parse_report(&report) {
            PerceptualVerdict::BinaryIdentical => {
                self.perceptual_diff_availability = ToolAvailability::Available;
                Some(Outcome::ImageMatchFilesDiffer)
            }
            PerceptualVerdict::Indistinguishable => {
                self.perceptual_diff_availability = ToolAvailability::Available;
                Some(Outcome::ImagePerceptuallyMatchFilesDiffer)
            }
            PerceptualVerdict::Different => {
                self.perceptual_diff_availability = ToolAvailability::Available;
                None
            }
            PerceptualVerdict::ToolMissing => {
                tracing::warn!("perceptual diff produced no verdict; disabling it for this run");
                self.perceptual_diff_availability = ToolAvailability::Unavailable;
                None
            }
        }
    }
}

fn metadata_matches(
    expected: &RasterDataset,
    result: &RasterDataset,
    exemption: &CompiledExemption,
) -> bool {
    if expected.geotransform != result.geotransform || expected.projection != result.projection {
        return false;
    }
    if expected.metadata_without(&exemption.volatile_metadata_keys)
        != result.metadata_without(&exemption.volatile_metadata_keys)
    {
        return false;
    }
    expected.bands.iter().enumerate().all(|(index, band)| {
        result
            .bands
            .get(index)
            .is_some_and(|other| other.metadata == band.metadata)
    })
}

fn stripped_copy(path: &Path) -> Option<pdiff::StrippedCopy> {
    pdiff::strip_leading_header(path)
        .inspect_err(|error| {
            tracing::warn!(path = %path.display(), error = %error, "could not strip image header");
        })
        .ok()
        .flatten()
}

pub fn alternative_path(expected: &Path) -> PathBuf {
    let mut name = OsString::from(expected.as_os_str());
    name.push(ALTERNATIVE_SUFFIX);
    PathBuf::from(name)
}

fn is_non_empty_file(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|metadata| metadata.is_file() && metadata.len() > 0)
}

fn files_identical(left: &Path, right: &Path) -> bool {
    match (fs::read(left), fs::read(right)) {
        (Ok(left), Ok(right)) => left == right,
        _ => false,
    }
}

fn compile_globs(patterns: &[String]) -> Result<GlobSet, ComparatorError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|source| ComparatorError::InvalidGlob {
            pattern: pattern.clone(),
            source,
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|source| ComparatorError::InvalidGlob {
        pattern: patterns.join(","),
        source,
    })
}
