use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::NamedTempFile;

pub const DEFAULT_PERCEPTUAL_DIFF_PROGRAM: &str = "perceptualdiff";

/// Number of leading bytes searched for an image signature.
pub const SIGNATURE_WINDOW: usize = 1000;

const TIFF_LITTLE_ENDIAN: &[u8] = b"II*\x00";
const TIFF_LITTLE_ENDIAN_SWAPPED: &[u8] = b"II\x00*";
const TIFF_BIG_ENDIAN: &[u8] = b"MM\x00*";
const GIF87: &[u8] = b"GIF87a";
const GIF89: &[u8] = b"GIF89a";
const PNG: &[u8] = b"\x89PNG\r\n\x1a\n";

const IMAGE_SIGNATURES: [&[u8]; 6] = [
    TIFF_LITTLE_ENDIAN,
    TIFF_LITTLE_ENDIAN_SWAPPED,
    TIFF_BIG_ENDIAN,
    GIF87,
    GIF89,
    PNG,
];

/// Runs an external perceptual image comparison and returns its report text.
/// An empty report means the tool produced nothing, usually because it is not
/// installed.
pub trait PerceptualDiff {
    fn report(&self, result: &Path, expected: &Path) -> String;
}

#[derive(Debug, Clone)]
pub struct CommandPerceptualDiff {
    program: PathBuf,
}

impl CommandPerceptualDiff {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for CommandPerceptualDiff {
    fn default() -> Self {
        Self::new(DEFAULT_PERCEPTUAL_DIFF_PROGRAM)
    }
}

impl PerceptualDiff for CommandPerceptualDiff {
    fn report(&self, result: &Path, expected: &Path) -> String {
        let output = Command::new(&self.program)
            .arg(result)
            .arg(expected)
            .arg("-verbose")
            .output();
        match output {
            Ok(output) => {
                let mut report = String::from_utf8_lossy(&output.stdout).into_owned();
                report.push_str(&String::from_utf8_lossy(&output.stderr));
                report
            }
            Err(error) => {
                tracing::debug!(
                    program = %self.program.display(),
                    error = %error,
                    "perceptual diff could not be started"
                );
                String::new()
            }
        }
    }
}

/// Verdict extracted from a perceptual-diff report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerceptualVerdict {
    BinaryIdentical,
    Indistinguishable,
    Different,
    ToolMissing,
}

pub fn parse_report(report: &str) -> PerceptualVerdict {
    let passed = report.contains("PASS:");
    if passed && report.contains("binary identical") {
        PerceptualVerdict::BinaryIdentical
    } else if passed && report.contains("indistinguishable") {
        PerceptualVerdict::Indistinguishable
    } else if !passed && !report.contains("FAIL:") {
        PerceptualVerdict::ToolMissing
    } else {
        PerceptualVerdict::Different
    }
}

/// Offset of the first known image signature within the leading window.
pub fn image_signature_offset(data: &[u8]) -> Option<usize> {
    let window = &data[..data.len().min(SIGNATURE_WINDOW)];
    IMAGE_SIGNATURES
        .iter()
        .filter_map(|signature| {
            window
                .windows(signature.len())
                .position(|candidate| candidate == *signature)
        })
        .min()
}

pub fn has_image_signature(path: &Path) -> bool {
    read_leading_window(path).is_some_and(|window| image_signature_offset(&window).is_some())
}

/// Copy of an image with leading non-image bytes removed. Lives next to the
/// original and is deleted when dropped.
#[derive(Debug)]
pub struct StrippedCopy {
    file: NamedTempFile,
}

impl StrippedCopy {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// Returns a stripped copy when the image data does not start at offset zero,
/// `None` when the file can be used as is.
pub fn strip_leading_header(path: &Path) -> std::io::Result<Option<StrippedCopy>> {
    let data = fs::read(path)?;
    let offset = match image_signature_offset(&data) {
        Some(offset) if offset > 0 => offset,
        _ => return Ok(None),
    };

    let directory = path.parent().unwrap_or_else(|| Path::new("."));
    let suffix = path
        .extension()
        .map(|extension| format!(".{}", extension.to_string_lossy()))
        .unwrap_or_default();
    let mut file = tempfile::Builder::new()
        .prefix(".pdiff-")
        .suffix(&suffix)
        .tempfile_in(directory)?;
    file.write_all(&data[offset..])?;
    file.flush()?;
    Ok(Some(StrippedCopy { file }))
}

fn read_leading_window(path: &Path) -> Option<Vec<u8>> {
    let file = fs::File::open(path).ok()?;
    let mut window = Vec::with_capacity(SIGNATURE_WINDOW);
    file.take(SIGNATURE_WINDOW as u64)
        .read_to_end(&mut window)
        .ok()?;
    Some(window)
}
