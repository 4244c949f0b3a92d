//! Optional memory checking of renderer invocations, either under valgrind
//! or with a sanitizer-instrumented renderer.

use crate::normalize::find_bytes;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Looked up relative to the fixture directory, i.e. next to the fixture directories.
pub const VALGRIND_SUPPRESSIONS: &str = "../valgrind-suppressions.txt";

const SANITIZER_MARKERS: [&[u8]; 2] = [b"AddressSanitizer", b"LeakSanitizer"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryChecker {
    Valgrind,
    AddressSanitizer,
}

impl MemoryChecker {
    pub fn log_name(self, result_name: &str) -> String {
        match self {
            Self::Valgrind => format!("{}.vgrind.txt", result_name),
            Self::AddressSanitizer => format!("{}.asan.txt", result_name),
        }
    }

    /// Rewrites `command_line` so the renderer's stderr lands in `log`.
    pub fn wrap(
        self,
        command_line: &str,
        log: &str,
        valgrind: &Path,
        suppressions: Option<&Path>,
    ) -> String {
        let command_line = command_line.trim();
        match self {
            Self::Valgrind => {
                let suppressions = suppressions
                    .map(|path| format!(" --suppressions={}", path.display()))
                    .unwrap_or_default();
                format!(
                    "{} --tool=memcheck -q{} --leak-check=full --show-reachable=yes {} 2>{}",
                    valgrind.display(),
                    suppressions,
                    command_line,
                    log
                )
            }
            Self::AddressSanitizer => format!("{} 2>{}", command_line, log),
        }
    }

    /// Valgrind runs quietly, so any output is a report. Sanitizer logs also
    /// catch ordinary stderr chatter and only count when a sanitizer spoke.
    pub fn is_report(self, log: &[u8]) -> bool {
        match self {
            Self::Valgrind => !log.is_empty(),
            Self::AddressSanitizer => SANITIZER_MARKERS
                .iter()
                .any(|marker| find_bytes(log, marker, 0).is_some()),
        }
    }

    /// Keeps the log when it reports something and deletes it otherwise.
    pub fn triage_log(self, log_path: &Path) -> std::io::Result<Option<PathBuf>> {
        let log = match fs::read(log_path) {
            Ok(log) => log,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error),
        };
        if self.is_report(&log) {
            return Ok(Some(log_path.to_path_buf()));
        }
        fs::remove_file(log_path)?;
        Ok(None)
    }
}
