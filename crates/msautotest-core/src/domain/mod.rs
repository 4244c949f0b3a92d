pub mod errors;

pub use errors::{AutotestError, AutotestErrorCategory};

use std::fmt::{Display, Formatter};
use std::ops::AddAssign;
use std::path::PathBuf;

/// Classification of one result file against its expected baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Match,
    ImageMatchFilesDiffer,
    ImagePerceptuallyMatchFilesDiffer,
    NoMatch,
    NoResult,
    NoExpected,
}

impl Outcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Match => "match",
            Self::ImageMatchFilesDiffer => "files_differ_image_match",
            Self::ImagePerceptuallyMatchFilesDiffer => "files_differ_image_nearly_match",
            Self::NoMatch => "nomatch",
            Self::NoResult => "noresult",
            Self::NoExpected => "noexpected",
        }
    }
}

impl Display for Outcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
    Initialized,
}

impl TestStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "PASS",
            Self::Failed => "FAIL",
            Self::Skipped => "SKIP",
            Self::Initialized => "INIT",
        }
    }
}

/// Aggregate tallies for one harness run. Owned by the orchestrator and
/// accumulated per directive; never global.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunCounters {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub initialized: usize,
    pub no_result: usize,
}

impl RunCounters {
    pub fn record(&mut self, status: TestStatus) {
        match status {
            TestStatus::Passed => self.succeeded += 1,
            TestStatus::Failed => self.failed += 1,
            TestStatus::Skipped => self.skipped += 1,
            TestStatus::Initialized => self.initialized += 1,
        }
    }

    pub fn record_no_result(&mut self) {
        self.no_result += 1;
    }

    pub fn executed(&self) -> usize {
        self.succeeded + self.failed + self.initialized
    }

    /// Share of executed tests that did not fail; newly baselined tests count
    /// as successes. An empty run reports 100%.
    pub fn success_percentage(&self) -> f64 {
        let executed = self.executed();
        if executed == 0 {
            return 100.0;
        }
        (self.succeeded + self.initialized) as f64 * 100.0 / executed as f64
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

impl AddAssign for RunCounters {
    fn add_assign(&mut self, other: Self) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.initialized += other.initialized;
        self.no_result += other.no_result;
    }
}

/// Record of one executed (or skipped) directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRecord {
    pub test_id: String,
    pub fixture: PathBuf,
    pub output_name: String,
    pub status: TestStatus,
    pub outcome: Option<Outcome>,
    pub reason: Option<String>,
    /// Memory checker log kept because it reported a problem.
    pub memory_log: Option<PathBuf>,
}

impl TestRecord {
    pub fn skipped(
        test_id: impl Into<String>,
        fixture: impl Into<PathBuf>,
        output_name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            test_id: test_id.into(),
            fixture: fixture.into(),
            output_name: output_name.into(),
            status: TestStatus::Skipped,
            outcome: None,
            reason: Some(reason.into()),
            memory_log: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Outcome, RunCounters, TestStatus};

    #[test]
    fn counters_record_each_status_once() {
        let mut counters = RunCounters::default();
        counters.record(TestStatus::Passed);
        counters.record(TestStatus::Passed);
        counters.record(TestStatus::Failed);
        counters.record(TestStatus::Skipped);
        counters.record(TestStatus::Initialized);
        counters.record_no_result();

        assert_eq!(counters.succeeded, 2);
        assert_eq!(counters.failed, 1);
        assert_eq!(counters.skipped, 1);
        assert_eq!(counters.initialized, 1);
        assert_eq!(counters.no_result, 1);
        assert_eq!(counters.executed(), 4);
        assert!((counters.success_percentage() - 75.0).abs() < 1.0e-9);
    }

    #[test]
    fn empty_run_is_fully_successful() {
        let counters = RunCounters::default();
        assert_eq!(counters.success_percentage(), 100.0);
        assert!(!counters.has_failures());
    }

    #[test]
    fn counters_accumulate_across_batches() {
        let mut total = RunCounters {
            succeeded: 1,
            ..RunCounters::default()
        };
        total += RunCounters {
            failed: 2,
            no_result: 1,
            ..RunCounters::default()
        };
        assert_eq!(total.succeeded, 1);
        assert_eq!(total.failed, 2);
        assert_eq!(total.no_result, 1);
    }

    #[test]
    fn outcomes_display_their_stable_names() {
        assert_eq!(Outcome::Match.to_string(), "match");
        assert_eq!(
            Outcome::ImagePerceptuallyMatchFilesDiffer.to_string(),
            "files_differ_image_nearly_match"
        );
        assert_eq!(Outcome::NoExpected.to_string(), "noexpected");
    }
}
