//! Sequential run orchestration: requirement gating, renderer invocation,
//! normalization, comparison, counters and baseline promotion.

pub mod memcheck;
pub mod process;
pub mod requirements;

pub use memcheck::{MemoryChecker, VALGRIND_SUPPRESSIONS};
pub use process::{ProcessError, ProcessOutput, ProcessSpec, run_shell};
pub use requirements::{Capabilities, compare_version};

use crate::comparator::{Comparator, ComparatorConfig, ComparatorError};
use crate::domain::{AutotestError, Outcome, RunCounters, TestRecord, TestStatus};
use crate::normalize::normalize_result_file;
use crate::parser::{self, RunParam};
use crate::template::{self, RESULT_DIR, TemplateContext, ToolNames};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const EXPECTED_DIR: &str = "expected";
pub const DIRECTORY_REQUIREMENTS_FILE: &str = "all_require.txt";
pub const FIXTURE_EXTENSION: &str = "map";
pub const NO_RESULT_MARKER: &str = "Segmentation fault or other serious error\n";

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub renderer: PathBuf,
    pub renderer_override: Option<String>,
    pub keep_pass: bool,
    pub strict: bool,
    pub timeout: Option<Duration>,
    pub tools: ToolNames,
    pub perceptual_diff_program: PathBuf,
    pub raster_probe_program: PathBuf,
    pub comparator: ComparatorConfig,
    pub memory_checker: Option<MemoryChecker>,
    pub valgrind_program: PathBuf,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            renderer: PathBuf::from("shp2img"),
            renderer_override: None,
            keep_pass: false,
            strict: false,
            timeout: None,
            tools: ToolNames::default(),
            perceptual_diff_program: PathBuf::from("perceptualdiff"),
            raster_probe_program: PathBuf::from("gdalinfo"),
            comparator: ComparatorConfig::default(),
            memory_checker: None,
            valgrind_program: PathBuf::from("valgrind"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedBatch {
    pub directory: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub counters: RunCounters,
    pub records: Vec<TestRecord>,
    pub skipped_batches: Vec<SkippedBatch>,
}

impl RunSummary {
    pub fn push(&mut self, record: TestRecord) {
        self.counters.record(record.status);
        if record.outcome == Some(Outcome::NoResult) {
            self.counters.record_no_result();
        }
        self.records.push(record);
    }

    pub fn merge(&mut self, other: RunSummary) {
        self.counters += other.counters;
        self.records.extend(other.records);
        self.skipped_batches.extend(other.skipped_batches);
    }

    pub fn failures(&self) -> impl Iterator<Item = &TestRecord> {
        self.records
            .iter()
            .filter(|record| record.status == TestStatus::Failed)
    }

    pub fn passed(&self) -> bool {
        !self.counters.has_failures()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("failed to read requirements file '{}': {source}", path.display())]
    ReadRequirements {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to read fixture '{}': {source}", path.display())]
    ReadFixture {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to create result directory '{}': {source}", path.display())]
    ResultDirectory {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("comparator setup failed: {0}")]
    Comparator(#[from] ComparatorError),
}

impl From<RunnerError> for AutotestError {
    fn from(error: RunnerError) -> Self {
        match error {
            RunnerError::Comparator(source) => AutotestError::from(source),
            RunnerError::ReadRequirements { .. } => {
                AutotestError::io_system("IO.REQUIREMENTS", error.to_string())
            }
            RunnerError::ReadFixture { .. } => {
                AutotestError::io_system("IO.FIXTURE", error.to_string())
            }
            RunnerError::ResultDirectory { .. } => {
                AutotestError::io_system("IO.RESULT_DIR", error.to_string())
            }
        }
    }
}

/// One directive as it would run, without running it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedTest {
    pub test_id: String,
    pub fixture: PathBuf,
    pub result_name: String,
    pub shell_line: String,
    pub requires: Vec<String>,
}

pub fn plan_fixture(fixture: &Path, config: &HarnessConfig) -> Result<Vec<PlannedTest>, RunnerError> {
    let directive = parser::read_directives(fixture).map_err(|source| RunnerError::ReadFixture {
        path: fixture.to_path_buf(),
        source,
    })?;
    let fixture_name = file_name(fixture);
    let renderer = config.renderer.to_string_lossy();

    Ok(directive
        .run_params
        .iter()
        .map(|run_param| {
            let context = template_context(config, &fixture_name, &renderer, run_param);
            let expanded = template::expand(&run_param.command_template, &context);
            PlannedTest {
                test_id: test_id(&fixture_name, &expanded.result_name),
                fixture: fixture.to_path_buf(),
                result_name: expanded.result_name.clone(),
                shell_line: expanded.shell_line(),
                requires: directive.requires.clone(),
            }
        })
        .collect())
}

/// `<fixture stem>_<result name with dots replaced>`, e.g. `wms_caps_xml`.
pub fn test_id(fixture_name: &str, result_name: &str) -> String {
    let stem = Path::new(fixture_name)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| fixture_name.to_string());
    format!("{}_{}", stem, result_name.replace('.', "_"))
}

pub struct Harness {
    config: HarnessConfig,
    comparator: Comparator,
    capabilities: Capabilities,
}

impl Harness {
    /// Builds the default tool bindings and probes renderer capabilities.
    pub fn new(config: HarnessConfig) -> Result<Self, RunnerError> {
        let comparator = Comparator::with_programs(
            &config.comparator,
            &config.raster_probe_program,
            &config.perceptual_diff_program,
        )?;
        let capabilities = Capabilities::probe(&config.renderer, comparator.raster_probe());
        Ok(Self::with_parts(config, comparator, capabilities))
    }

    pub fn with_parts(config: HarnessConfig, comparator: Comparator, capabilities: Capabilities) -> Self {
        Self {
            config,
            comparator,
            capabilities,
        }
    }

    /// Runs fixtures that share `directory`, which is also the working
    /// directory of every renderer invocation.
    pub fn run_batch(&mut self, directory: &Path, fixtures: &[PathBuf]) -> Result<RunSummary, RunnerError> {
        let mut summary = RunSummary::default();

        let requirements_path = directory.join(DIRECTORY_REQUIREMENTS_FILE);
        if requirements_path.is_file() {
            let source = fs::read_to_string(&requirements_path).map_err(|source| {
                RunnerError::ReadRequirements {
                    path: requirements_path.clone(),
                    source,
                }
            })?;
            let required = parser::parse_requirements_file(&source);
            let unmet = self.capabilities.unmet(&required);
            if !unmet.is_empty() {
                let reason = format!("missing requirements: {}", unmet.join(" "));
                tracing::info!(directory = %directory.display(), %reason, "skipping directory");
                for fixture in fixtures {
                    self.skip_fixture(fixture, &reason, &mut summary);
                }
                summary.skipped_batches.push(SkippedBatch {
                    directory: directory.to_path_buf(),
                    reason,
                });
                return Ok(summary);
            }
        }

        let result_dir = directory.join(RESULT_DIR);
        fs::create_dir_all(&result_dir).map_err(|source| RunnerError::ResultDirectory {
            path: result_dir.clone(),
            source,
        })?;

        for fixture in fixtures {
            self.run_fixture(directory, fixture, &mut summary);
        }
        Ok(summary)
    }

    fn run_fixture(&mut self, directory: &Path, fixture: &Path, summary: &mut RunSummary) {
        let fixture_name = file_name(fixture);
        let directive = match parser::read_directives(fixture) {
            Ok(directive) => directive,
            Err(source) => {
                let error = RunnerError::ReadFixture {
                    path: fixture.to_path_buf(),
                    source,
                };
                tracing::warn!(error = %error, "fixture could not be read");
                let output_name = parser::default_output_name(&fixture_name);
                summary.push(TestRecord {
                    test_id: test_id(&fixture_name, &output_name),
                    fixture: fixture.to_path_buf(),
                    output_name,
                    status: TestStatus::Failed,
                    outcome: None,
                    reason: Some(error.to_string()),
                    memory_log: None,
                });
                return;
            }
        };

        let unmet = self.capabilities.unmet(&directive.requires);
        if !unmet.is_empty() {
            let reason = format!("missing requirements: {}", unmet.join(" "));
            for run_param in &directive.run_params {
                summary.push(self.skipped_record(fixture, &fixture_name, run_param, &reason));
            }
            return;
        }

        for run_param in &directive.run_params {
            let record = self.run_directive(directory, fixture, &fixture_name, run_param);
            summary.push(record);
        }
    }

    fn skip_fixture(&self, fixture: &Path, reason: &str, summary: &mut RunSummary) {
        let fixture_name = file_name(fixture);
        let run_params = match parser::read_directives(fixture) {
            Ok(directive) => directive.run_params,
            Err(_) => vec![RunParam::new(
                parser::default_output_name(&fixture_name),
                parser::DEFAULT_COMMAND_TEMPLATE,
            )],
        };
        for run_param in &run_params {
            summary.push(self.skipped_record(fixture, &fixture_name, run_param, reason));
        }
    }

    fn skipped_record(
        &self,
        fixture: &Path,
        fixture_name: &str,
        run_param: &RunParam,
        reason: &str,
    ) -> TestRecord {
        let result_name =
            template::result_output_name(&run_param.output_name, self.config.renderer_override.as_deref());
        let record = TestRecord::skipped(
            test_id(fixture_name, &result_name),
            fixture,
            result_name,
            reason,
        );
        tracing::info!(test = %record.test_id, reason, "skipped");
        record
    }

    fn run_directive(
        &mut self,
        directory: &Path,
        fixture: &Path,
        fixture_name: &str,
        run_param: &RunParam,
    ) -> TestRecord {
        let renderer = self.config.renderer.to_string_lossy().into_owned();
        let context = template_context(&self.config, fixture_name, &renderer, run_param);
        let expanded = template::expand(&run_param.command_template, &context);
        let test_id = test_id(fixture_name, &expanded.result_name);
        let result_path = directory.join(RESULT_DIR).join(&expanded.result_name);
        let expected_path = directory.join(EXPECTED_DIR).join(&expanded.result_name);

        // A result left over from an earlier failing run must not be mistaken for fresh output.
        discard_result(&result_path);

        let memory_check = self.config.memory_checker.map(|checker| {
            let log = format!("{}/{}", RESULT_DIR, checker.log_name(&expanded.result_name));
            discard_result(&directory.join(&log));
            (checker, log)
        });
        let command_line = match &memory_check {
            Some((checker, log)) => {
                let suppressions = directory
                    .join(VALGRIND_SUPPRESSIONS)
                    .is_file()
                    .then_some(Path::new(VALGRIND_SUPPRESSIONS));
                checker.wrap(
                    &expanded.command_line,
                    log,
                    &self.config.valgrind_program,
                    suppressions,
                )
            }
            None => expanded.command_line.clone(),
        };

        let diagnostics = match run_shell(ProcessSpec {
            command_line: &command_line,
            current_dir: directory,
            env: &expanded.env,
            stdin: expanded.stdin_bytes(),
            timeout: self.config.timeout,
        }) {
            Ok(output) if output.timed_out => {
                discard_result(&result_path);
                self.config
                    .timeout
                    .map(|timeout| format!("renderer timed out after {}s", timeout.as_secs_f64()))
            }
            Ok(output) => output.diagnostics(),
            Err(error) => {
                tracing::warn!(test = %test_id, error = %error, "renderer could not be started");
                Some(error.to_string())
            }
        };

        let memory_log = memory_check.and_then(|(checker, log)| {
            match checker.triage_log(&directory.join(&log)) {
                Ok(kept) => kept,
                Err(error) => {
                    tracing::warn!(
                        test = %test_id,
                        log = %log,
                        error = %error,
                        "memory checker log could not be triaged"
                    );
                    None
                }
            }
        });
        if let Some(log) = &memory_log {
            tracing::warn!(test = %test_id, log = %log.display(), "memory checker log non empty");
        }

        let mut record = TestRecord {
            test_id,
            fixture: fixture.to_path_buf(),
            output_name: expanded.result_name.clone(),
            status: TestStatus::Failed,
            outcome: None,
            reason: None,
            memory_log,
        };

        if let Err(error) = normalize_result_file(&result_path, expanded.normalize, &expanded.strip) {
            tracing::warn!(test = %record.test_id, error = %error, "normalization failed");
            record.reason = Some(error.to_string());
            return record;
        }

        let outcome = self.comparator.compare(&result_path, &expected_path);
        record.outcome = Some(outcome);
        let (status, reason) = self.settle(outcome, &result_path, &expected_path, &expanded.result_name);
        record.status = status;
        record.reason = reason.map(|reason| with_diagnostics(reason, diagnostics.as_deref()));

        tracing::info!(
            test = %record.test_id,
            outcome = outcome.as_str(),
            status = status.as_str(),
            "test finished"
        );
        record
    }

    /// Applies the per-outcome policy to the result file and returns the
    /// status plus a failure reason.
    fn settle(
        &self,
        outcome: Outcome,
        result_path: &Path,
        expected_path: &Path,
        result_name: &str,
    ) -> (TestStatus, Option<String>) {
        match outcome {
            Outcome::Match => (self.accept(result_path), None),
            Outcome::ImageMatchFilesDiffer if self.config.strict => (
                TestStatus::Failed,
                Some("results don't match (though images match)".to_string()),
            ),
            Outcome::ImagePerceptuallyMatchFilesDiffer if self.config.strict => (
                TestStatus::Failed,
                Some("results don't match (though images perceptually match)".to_string()),
            ),
            Outcome::ImageMatchFilesDiffer | Outcome::ImagePerceptuallyMatchFilesDiffer => {
                (self.accept(result_path), None)
            }
            Outcome::NoMatch => (TestStatus::Failed, Some("results don't match".to_string())),
            Outcome::NoResult => {
                if let Err(error) = fs::write(result_path, NO_RESULT_MARKER) {
                    tracing::warn!(path = %result_path.display(), error = %error, "could not write no-result marker");
                }
                (
                    TestStatus::Failed,
                    Some("no result file generated".to_string()),
                )
            }
            Outcome::NoExpected if self.config.strict => (
                TestStatus::Failed,
                Some(format!("no existing file {}/{}", EXPECTED_DIR, result_name)),
            ),
            Outcome::NoExpected => match promote_baseline(result_path, expected_path) {
                Ok(()) => {
                    tracing::info!(baseline = %expected_path.display(), "accepted result as new baseline");
                    (TestStatus::Initialized, None)
                }
                Err(error) => (
                    TestStatus::Failed,
                    Some(format!(
                        "failed to promote result to '{}': {}",
                        expected_path.display(),
                        error
                    )),
                ),
            },
        }
    }

    fn accept(&self, result_path: &Path) -> TestStatus {
        if !self.config.keep_pass {
            discard_result(result_path);
        }
        TestStatus::Passed
    }
}

/// Deletes a result file; `Ok(false)` when there was nothing to delete.
fn remove_result(path: &Path) -> std::io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
        Err(error) => Err(error),
    }
}

fn discard_result(path: &Path) {
    if let Err(error) = remove_result(path) {
        tracing::warn!(path = %path.display(), error = %error, "could not remove result file");
    }
}

/// Moves a result into the expected-artifacts directory, creating it if needed.
pub fn promote_baseline(result_path: &Path, expected_path: &Path) -> std::io::Result<()> {
    if let Some(parent) = expected_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(result_path, expected_path)
}

pub fn render_human_summary(summary: &RunSummary) -> String {
    let counters = &summary.counters;
    let mut lines = Vec::new();
    let status = if summary.passed() { "PASS" } else { "FAIL" };
    lines.push(format!("Test status: {}", status));
    lines.push(format!(
        "Success rate: {:.1}% ({} executed)",
        counters.success_percentage(),
        counters.executed()
    ));
    lines.push(format!("  succeeded:   {}", counters.succeeded));
    lines.push(format!("  failed:      {}", counters.failed));
    lines.push(format!("  skipped:     {}", counters.skipped));
    lines.push(format!("  initialized: {}", counters.initialized));
    if counters.no_result > 0 {
        lines.push(format!(
            "  no result:   {} (renderer crashed or produced nothing; treat as serious)",
            counters.no_result
        ));
    }

    for batch in &summary.skipped_batches {
        lines.push(format!(
            "Skipped directory {}: {}",
            batch.directory.display(),
            batch.reason
        ));
    }

    let mut memory_logs = summary
        .records
        .iter()
        .filter_map(|record| record.memory_log.as_ref())
        .peekable();
    if memory_logs.peek().is_some() {
        lines.push("Memory checker logs:".to_string());
    }
    for log in memory_logs {
        lines.push(format!("  {}", log.display()));
    }

    let mut failures = summary.failures().peekable();
    if failures.peek().is_some() {
        lines.push("Failures:".to_string());
    }
    for failure in failures {
        lines.push(format!(
            "  {} {}: {}",
            failure.fixture.display(),
            failure.output_name,
            failure
                .reason
                .as_deref()
                .unwrap_or("test failed without a reason")
        ));
    }

    lines.join("\n")
}

fn template_context<'a>(
    config: &'a HarnessConfig,
    fixture_name: &'a str,
    renderer: &'a str,
    run_param: &'a RunParam,
) -> TemplateContext<'a> {
    TemplateContext {
        fixture: fixture_name,
        output_name: &run_param.output_name,
        renderer,
        renderer_override: config.renderer_override.as_deref(),
        tools: &config.tools,
    }
}

fn with_diagnostics(reason: String, diagnostics: Option<&str>) -> String {
    match diagnostics.and_then(|text| text.lines().next()) {
        Some(first_line) => format!("{} ({})", reason, first_line),
        None => reason,
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
