//! Regression harness for a map renderer: fixture directives, command
//! templates, result normalization and a tiered result comparator.

pub mod comparator;
pub mod domain;
pub mod normalize;
pub mod parser;
pub mod runner;
pub mod template;

pub use comparator::{Comparator, ComparatorConfig, ToolAvailability};
pub use domain::{
    AutotestError, AutotestErrorCategory, Outcome, RunCounters, TestRecord, TestStatus,
};
pub use runner::{Harness, HarnessConfig, RunSummary, render_human_summary};
