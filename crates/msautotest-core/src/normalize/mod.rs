//! In-place filters that remove non-deterministic content from a freshly
//! produced result before it is compared.
//!
//! Filters work on raw bytes (results are frequently binary or latin-1) and
//! each one reports `None` when it has nothing to change, in which case the
//! file is left untouched. No filter relies on another having run first.

use regex::bytes::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::domain::AutotestError;

pub const VERSION_COMMENT_MARKER: &[u8] = b"<!-- MapServer version";
pub const TIGHT_VERSION_COMMENT_MARKER: &[u8] = b"<!--MapServer version";
pub const GDAL_CREATOR_MARKER: &[u8] = b"creator=\"GDAL ";
pub const TIMESTAMP_MARKER: &[u8] = b"timeStamp=\"";
pub const SERVICE_CAPABILITIES_MARKER: &[u8] = b"WFS_Capabilities";
pub const SERVICE_VERSION_MARKER: &[u8] = b"version=\"";

/// Post-processing steps requested by the placeholders of one template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NormalizeFlags {
    pub demime: bool,
    pub deversion: bool,
    pub extract_service_version: bool,
}

impl NormalizeFlags {
    pub const NONE: Self = Self {
        demime: false,
        deversion: false,
        extract_service_version: false,
    };

    pub const fn union(self, other: Self) -> Self {
        Self {
            demime: self.demime || other.demime,
            deversion: self.deversion || other.deversion,
            extract_service_version: self.extract_service_version
                || other.extract_service_version,
        }
    }
}

/// Substrings whose lines get replaced by a placeholder line before comparison.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StripRequest {
    patterns: Vec<String>,
}

impl StripRequest {
    pub fn push(&mut self, pattern: impl Into<String>) {
        self.patterns.push(pattern.into());
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for StripRequest {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            patterns: iter.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("failed to read result '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to rewrite result '{}': {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl From<NormalizeError> for AutotestError {
    fn from(error: NormalizeError) -> Self {
        AutotestError::io_system("IO.NORMALIZE", error.to_string())
    }
}

/// Names of the filters that rewrote the file, in application order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NormalizeReport {
    pub applied: Vec<&'static str>,
}

pub fn normalize_result_file(
    path: &Path,
    flags: NormalizeFlags,
    strip: &StripRequest,
) -> Result<NormalizeReport, NormalizeError> {
    let mut report = NormalizeReport::default();
    if !path.is_file() {
        return Ok(report);
    }

    let collapse_double_cr = matches!(
        path.extension().and_then(|extension| extension.to_str()),
        Some("xml" | "json")
    );

    if flags.demime {
        run_filter(path, "demime", &mut report, |data| {
            demime(data, collapse_double_cr)
        })?;
    }
    if flags.deversion {
        run_filter(path, "deversion", &mut report, deversion)?;
        run_filter(path, "degdalversion", &mut report, degdalversion)?;
        run_filter(path, "fixexponent", &mut report, fix_exponent)?;
        run_filter(path, "truncate_one_decimal", &mut report, truncate_one_decimal)?;
        run_filter(path, "detimestamp", &mut report, detimestamp)?;
    }
    if flags.extract_service_version {
        run_filter(
            path,
            "extract_service_version",
            &mut report,
            extract_service_version,
        )?;
    }
    if !strip.is_empty() {
        run_filter(path, "strip_items", &mut report, |data| {
            strip_items(data, strip)
        })?;
    }
    run_filter(path, "crlf", &mut report, crlf)?;

    Ok(report)
}

fn run_filter(
    path: &Path,
    name: &'static str,
    report: &mut NormalizeReport,
    filter: impl FnOnce(&[u8]) -> Option<Vec<u8>>,
) -> Result<(), NormalizeError> {
    let data = fs::read(path).map_err(|source| NormalizeError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let Some(rewritten) = filter(&data) else {
        return Ok(());
    };
    if rewritten == data {
        return Ok(());
    }

    fs::write(path, &rewritten).map_err(|source| NormalizeError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!(
        filter = name,
        path = %path.display(),
        before = data.len(),
        after = rewritten.len(),
        "normalized result"
    );
    report.applied.push(name);
    Ok(())
}

/// Drops HTTP response headers: everything up to the first `\r\n\r\n` or
/// `\n\n`, whichever comes first, provided every line before it is a
/// `Name: value` header or an `HTTP/` status line. A body that merely
/// contains a blank line is left alone so a second pass is a no-op.
pub fn demime(data: &[u8], collapse_double_cr: bool) -> Option<Vec<u8>> {
    let collapsed;
    let data = if collapse_double_cr {
        collapsed = replace_all(data, b"\r\r", b"\r");
        collapsed.as_slice()
    } else {
        data
    };

    let (header_end, body_start) = (0..data.len()).find_map(|index| {
        let rest = &data[index..];
        if rest.starts_with(b"\r\n\r\n") {
            Some((index, index + 4))
        } else if rest.starts_with(b"\n\n") {
            Some((index, index + 2))
        } else {
            None
        }
    })?;

    let header = &data[..header_end];
    if header.is_empty() || !header.split(|byte| *byte == b'\n').all(is_header_line) {
        return None;
    }
    Some(data[body_start..].to_vec())
}

fn is_header_line(line: &[u8]) -> bool {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.starts_with(b"HTTP/") {
        return true;
    }
    match line.iter().position(|byte| *byte == b':') {
        Some(colon) if colon > 0 => line[..colon]
            .iter()
            .all(|byte| byte.is_ascii_alphanumeric() || *byte == b'-' || *byte == b'_'),
        _ => false,
    }
}

/// Removes the `<!-- MapServer version ... -->` comment, the character in
/// front of it and the character following the closing `-->`.
pub fn deversion(data: &[u8]) -> Option<Vec<u8>> {
    let start = find_bytes(data, VERSION_COMMENT_MARKER, 0)
        .or_else(|| find_bytes(data, TIGHT_VERSION_COMMENT_MARKER, 0))?;

    let close = find_bytes(data, b"-->", start + 10)?;
    let mut rewritten = data[..start.saturating_sub(1)].to_vec();
    rewritten.extend_from_slice(&data[(close + 4).min(data.len())..]);
    Some(rewritten)
}

/// Removes a `creator="GDAL ..."` attribute and the character before it.
pub fn degdalversion(data: &[u8]) -> Option<Vec<u8>> {
    let start = find_bytes(data, GDAL_CREATOR_MARKER, 0)?;
    let close = data[start + GDAL_CREATOR_MARKER.len()..]
        .iter()
        .position(|byte| *byte == b'"')
        .map(|offset| start + GDAL_CREATOR_MARKER.len() + offset)?;

    let mut rewritten = data[..start.saturating_sub(1)].to_vec();
    rewritten.extend_from_slice(&data[close + 1..]);
    Some(rewritten)
}

/// Rewrites three-digit exponents closing a quoted value (`e+012"`) to the
/// two-digit form (`e+12"`).
pub fn fix_exponent(data: &[u8]) -> Option<Vec<u8>> {
    let mut rewritten = data.to_vec();
    let mut changed = false;
    let mut search_from = 0;

    while let Some(position) = find_bytes(&rewritten, b"e+0", search_from) {
        let digit_at = |offset: usize| {
            rewritten
                .get(position + offset)
                .is_some_and(u8::is_ascii_digit)
        };
        if digit_at(3) && digit_at(4) && rewritten.get(position + 5) == Some(&b'"') {
            rewritten.remove(position + 2);
            changed = true;
        }
        search_from = position + 3;
    }

    changed.then_some(rewritten)
}

fn decimal_run_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"[0-9]+\.[0-9]{6,24}").expect("decimal run pattern should compile")
    })
}

/// Drops the last digit of every number carrying 6 to 24 decimals.
pub fn truncate_one_decimal(data: &[u8]) -> Option<Vec<u8>> {
    let mut rewritten = Vec::with_capacity(data.len());
    let mut copied_to = 0;
    let mut matched = false;

    for number in decimal_run_pattern().find_iter(data) {
        rewritten.extend_from_slice(&data[copied_to..number.end() - 1]);
        copied_to = number.end();
        matched = true;
    }

    if !matched {
        return None;
    }
    rewritten.extend_from_slice(&data[copied_to..]);
    Some(rewritten)
}

/// Blanks every `timeStamp="..."` value.
pub fn detimestamp(data: &[u8]) -> Option<Vec<u8>> {
    let mut rewritten = Vec::with_capacity(data.len());
    let mut copied_to = 0;
    let mut changed = false;

    while let Some(marker) = find_bytes(data, TIMESTAMP_MARKER, copied_to) {
        let value_start = marker + TIMESTAMP_MARKER.len();
        let Some(value_end) = data[value_start..]
            .iter()
            .position(|byte| *byte == b'"')
            .map(|offset| value_start + offset)
        else {
            break;
        };

        rewritten.extend_from_slice(&data[copied_to..value_start]);
        changed |= value_end > value_start;
        copied_to = value_end;
    }

    if !changed {
        return None;
    }
    rewritten.extend_from_slice(&data[copied_to..]);
    Some(rewritten)
}

/// Replaces a capabilities document with its `version="..."` value.
pub fn extract_service_version(data: &[u8]) -> Option<Vec<u8>> {
    let capabilities = find_bytes(data, SERVICE_CAPABILITIES_MARKER, 0)?;
    let marker = find_bytes(data, SERVICE_VERSION_MARKER, capabilities)?;
    let value_start = marker + SERVICE_VERSION_MARKER.len();
    let value_len = data[value_start..]
        .iter()
        .position(|byte| *byte == b'"')?;
    Some(data[value_start..value_start + value_len].to_vec())
}

pub fn stripped_line(pattern: &str) -> String {
    format!("[stripped line matching \"{}\"]\n", pattern)
}

pub fn strip_items(data: &[u8], strip: &StripRequest) -> Option<Vec<u8>> {
    if strip.is_empty() {
        return None;
    }

    let mut rewritten = Vec::with_capacity(data.len());
    for line in data.split_inclusive(|byte| *byte == b'\n') {
        let matched = strip
            .patterns()
            .iter()
            .find(|pattern| find_bytes(line, pattern.as_bytes(), 0).is_some());
        match matched {
            Some(pattern) => rewritten.extend_from_slice(stripped_line(pattern).as_bytes()),
            None => rewritten.extend_from_slice(line),
        }
    }
    Some(rewritten)
}

/// Converts CRLF to LF unless the data looks binary (contains a NUL byte).
pub fn crlf(data: &[u8]) -> Option<Vec<u8>> {
    if data.contains(&0) || find_bytes(data, b"\r\n", 0).is_none() {
        return None;
    }
    Some(replace_all(data, b"\r\n", b"\n"))
}

pub(crate) fn find_bytes(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|offset| from + offset)
}

fn replace_all(data: &[u8], from: &[u8], to: &[u8]) -> Vec<u8> {
    let mut rewritten = Vec::with_capacity(data.len());
    let mut copied_to = 0;
    while let Some(position) = find_bytes(data, from, copied_to) {
        rewritten.extend_from_slice(&data[copied_to..position]);
        rewritten.extend_from_slice(to);
        copied_to = position + from.len();
    }
    rewritten.extend_from_slice(&data[copied_to..]);
    rewritten
}
