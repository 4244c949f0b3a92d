use crate::comparator::RasterProbe;
use std::cmp::Ordering;
use std::path::Path;
use std::process::Command;

pub const RASTER_AT_LEAST_PREFIX: &str = "GDAL>=";
pub const RASTER_EXACTLY_PREFIX: &str = "GDAL==";

/// Self-reported capabilities of the renderer and the raster library, probed
/// once per run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Capabilities {
    renderer_version: String,
    raster_library_version: Option<String>,
}

impl Capabilities {
    pub fn new(
        renderer_version: impl Into<String>,
        raster_library_version: Option<String>,
    ) -> Self {
        Self {
            renderer_version: renderer_version.into(),
            raster_library_version,
        }
    }

    /// Runs `<renderer> -v` and asks the raster probe for its library version.
    pub fn probe(renderer: &Path, raster_probe: &dyn RasterProbe) -> Self {
        let renderer_version = match Command::new(renderer).arg("-v").output() {
            Ok(output) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                text
            }
            Err(error) => {
                tracing::warn!(
                    renderer = %renderer.display(),
                    error = %error,
                    "renderer version could not be queried; capability checks will fail"
                );
                String::new()
            }
        };
        let raster_library_version = raster_probe.library_version();
        tracing::debug!(
            renderer_version = renderer_version.trim(),
            raster_library_version = raster_library_version.as_deref(),
            "probed capabilities"
        );
        Self::new(renderer_version, raster_library_version)
    }

    pub fn is_met(&self, requirement: &str) -> bool {
        if let Some(minimum) = requirement.strip_prefix(RASTER_AT_LEAST_PREFIX) {
            return self
                .raster_library_version
                .as_deref()
                .is_some_and(|version| compare_version(version, minimum) != Ordering::Less);
        }
        if let Some(exact) = requirement.strip_prefix(RASTER_EXACTLY_PREFIX) {
            return self
                .raster_library_version
                .as_deref()
                .is_some_and(|version| compare_version(version, exact) == Ordering::Equal);
        }
        self.renderer_version.contains(requirement)
    }

    /// Requirements that are not met, in declaration order.
    pub fn unmet<'a>(&self, requirements: &'a [String]) -> Vec<&'a str> {
        requirements
            .iter()
            .map(String::as_str)
            .filter(|requirement| !self.is_met(requirement))
            .collect()
    }
}

/// Compares dotted versions numerically on their first three components;
/// missing or non-numeric components count as zero.
pub fn compare_version(left: &str, right: &str) -> Ordering {
    let left = version_components(left);
    let right = version_components(right);
    left.cmp(&right)
}

fn version_components(version: &str) -> [u64; 3] {
    let mut components = [0; 3];
    for (slot, part) in components.iter_mut().zip(version.trim().split('.')) {
        let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
        *slot = digits.parse().unwrap_or(0);
    }
    components
}

#[cfg(test)]
mod tests {
    use super::{Capabilities, compare_version};
    use std::cmp::Ordering;

    #[test]
    fn versions_compare_numerically() {
        assert_eq!(compare_version("3.10.0", "3.9.2"), Ordering::Greater);
        assert_eq!(compare_version("3.4", "3.4.0"), Ordering::Equal);
        assert_eq!(compare_version("2.4.1", "3"), Ordering::Less);
    }

    #[test]
    fn renderer_tokens_use_substring_search() {
        let capabilities = Capabilities::new(
            "MapServer version 8.0.1 OUTPUT=PNG OUTPUT=JPEG SUPPORTS=PROJ SUPPORTS=WMS_SERVER INPUT=GDAL",
            None,
        );
        let requirements = vec![
            "SUPPORTS=PROJ".to_string(),
            "SUPPORTS=WCS_SERVER".to_string(),
            "INPUT=GDAL".to_string(),
        ];
        assert_eq!(capabilities.unmet(&requirements), vec!["SUPPORTS=WCS_SERVER"]);
    }

    #[test]
    fn raster_version_requirements_need_a_known_version() {
        let unknown = Capabilities::new("INPUT=GDAL", None);
        assert!(!unknown.is_met("GDAL>=3.1"));

        let known = Capabilities::new("INPUT=GDAL", Some("3.8.4".to_string()));
        assert!(known.is_met("GDAL>=3.1"));
        assert!(known.is_met("GDAL>=3.8.4"));
        assert!(!known.is_met("GDAL>=3.9"));
        assert!(known.is_met("GDAL==3.8.4"));
        assert!(!known.is_met("GDAL==3.8"));
    }
}
