use super::CliError;
use anyhow::Context;
use globset::{Glob, GlobMatcher};
use msautotest_core::AutotestError;
use msautotest_core::runner::FIXTURE_EXTENSION;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

pub(super) fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

pub(super) fn current_working_dir() -> Result<PathBuf, CliError> {
    std::env::current_dir().map_err(|source| {
        CliError::Harness(AutotestError::io_system(
            "IO.CLI_CURRENT_DIR",
            format!("failed to read current working directory: {}", source),
        ))
    })
}

pub(super) fn resolve_cli_path(working_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        working_dir.join(path)
    }
}

/// Bare program names are left for `PATH` lookup; anything with a directory
/// part is anchored to the working directory, since children run elsewhere.
pub(super) fn resolve_program(working_dir: &Path, program: &Path) -> PathBuf {
    if program.components().count() > 1 {
        resolve_cli_path(working_dir, program)
    } else {
        program.to_path_buf()
    }
}

/// [`resolve_program`] for tools spliced into a shell command line.
pub(super) fn tool_name(working_dir: &Path, program: &Path) -> String {
    resolve_program(working_dir, program)
        .to_string_lossy()
        .into_owned()
}

pub(super) fn compile_filter(pattern: Option<&str>) -> Result<Option<GlobMatcher>, CliError> {
    pattern
        .map(|pattern| {
            Glob::new(pattern)
                .map(|glob| glob.compile_matcher())
                .map_err(|source| {
                    CliError::Usage(format!("invalid --filter glob '{}': {}", pattern, source))
                })
        })
        .transpose()
}

/// Fixtures grouped by the directory they run in, each group sorted by name.
pub(super) fn collect_fixture_batches(
    working_dir: &Path,
    paths: &[PathBuf],
    filter: Option<&GlobMatcher>,
) -> Result<BTreeMap<PathBuf, Vec<PathBuf>>, CliError> {
    let default_paths = [PathBuf::from(".")];
    let paths = if paths.is_empty() {
        &default_paths[..]
    } else {
        paths
    };

    let mut batches: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();
    for path in paths {
        let path = if path.as_os_str() == "." {
            working_dir.to_path_buf()
        } else {
            resolve_cli_path(working_dir, path)
        };
        if path.is_dir() {
            let fixtures = fixtures_in_directory(&path)?;
            batches.entry(path).or_default().extend(fixtures);
        } else if path.is_file() {
            let directory = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| working_dir.to_path_buf());
            batches.entry(directory).or_default().push(path);
        } else {
            return Err(CliError::Harness(AutotestError::input_validation(
                "INPUT.CLI_FIXTURE_PATH",
                format!("fixture path '{}' does not exist", path.display()),
            )));
        }
    }

    for fixtures in batches.values_mut() {
        if let Some(filter) = filter {
            fixtures.retain(|fixture| {
                fixture
                    .file_name()
                    .is_some_and(|name| filter.is_match(Path::new(name)))
            });
        }
        fixtures.sort();
        fixtures.dedup();
    }
    batches.retain(|_, fixtures| !fixtures.is_empty());
    Ok(batches)
}

fn fixtures_in_directory(directory: &Path) -> Result<Vec<PathBuf>, CliError> {
    let entries = fs::read_dir(directory)
        .with_context(|| format!("failed to list fixtures in '{}'", directory.display()))?;

    let mut fixtures = Vec::new();
    for entry in entries {
        let entry = entry
            .with_context(|| format!("failed to read an entry of '{}'", directory.display()))?;
        let path = entry.path();
        if path.is_file()
            && path
                .extension()
                .is_some_and(|extension| extension == FIXTURE_EXTENSION)
        {
            fixtures.push(path);
        }
    }
    Ok(fixtures)
}
