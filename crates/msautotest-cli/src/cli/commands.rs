use super::CliError;
use super::helpers::*;
use msautotest_core::comparator::ComparatorConfig;
use msautotest_core::runner::{
    Harness, HarnessConfig, MemoryChecker, RunSummary, plan_fixture, render_human_summary,
};
use msautotest_core::template::ToolNames;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(clap::Args)]
pub(super) struct FixtureArgs {
    /// Fixture files or directories of fixtures (defaults to the current directory)
    #[arg(value_name = "PATH")]
    paths: Vec<PathBuf>,

    /// Only use fixtures whose file name matches this glob
    #[arg(long, value_name = "GLOB")]
    filter: Option<String>,

    /// Renderer executable substituted for [SHP2IMG]
    #[arg(long, default_value = "shp2img")]
    renderer: PathBuf,

    /// Renderer name passed as `-i <NAME>`; also renames the result file
    #[arg(long, value_name = "NAME")]
    renderer_override: Option<String>,

    /// Tool substituted for [MAPSERV]
    #[arg(long, default_value = "mapserv")]
    mapserv: PathBuf,

    /// Tool substituted for [LEGEND]
    #[arg(long, default_value = "legend")]
    legend: PathBuf,

    /// Tool substituted for [SCALEBAR]
    #[arg(long, default_value = "scalebar")]
    scalebar: PathBuf,
}

#[derive(clap::Args)]
pub(super) struct RunArgs {
    #[command(flatten)]
    fixtures: FixtureArgs,

    /// Keep result files of passing tests
    #[arg(long)]
    keep_pass: bool,

    /// Treat image-only matches and missing baselines as failures
    #[arg(long)]
    strict: bool,

    /// Kill a renderer invocation after this many seconds (no limit by default)
    #[arg(long, value_name = "SECONDS")]
    timeout_secs: Option<u64>,

    /// Perceptual image diff program
    #[arg(long, default_value = "perceptualdiff")]
    perceptualdiff: PathBuf,

    /// Raster inspection program used for checksum comparison
    #[arg(long, default_value = "gdalinfo")]
    gdalinfo: PathBuf,

    /// JSON file overriding the comparator's format tables
    #[arg(long, value_name = "PATH")]
    comparator_config: Option<PathBuf>,

    /// Run every renderer invocation under valgrind memcheck
    #[arg(long, conflicts_with = "asan")]
    valgrind: bool,

    /// Keep AddressSanitizer reports written by an instrumented renderer
    #[arg(long)]
    asan: bool,

    /// Valgrind executable used with --valgrind
    #[arg(long, default_value = "valgrind")]
    valgrind_program: PathBuf,
}

#[derive(clap::Args)]
pub(super) struct ListArgs {
    #[command(flatten)]
    fixtures: FixtureArgs,
}

impl FixtureArgs {
    fn base_config(&self, working_dir: &Path) -> HarnessConfig {
        HarnessConfig {
            renderer: resolve_program(working_dir, &self.renderer),
            renderer_override: self.renderer_override.clone(),
            tools: ToolNames {
                mapserv: tool_name(working_dir, &self.mapserv),
                legend: tool_name(working_dir, &self.legend),
                scalebar: tool_name(working_dir, &self.scalebar),
            },
            ..HarnessConfig::default()
        }
    }
}

impl RunArgs {
    fn into_config(self, working_dir: &Path) -> Result<HarnessConfig, CliError> {
        let comparator = match &self.comparator_config {
            Some(path) => ComparatorConfig::from_json_path(resolve_cli_path(working_dir, path))?,
            None => ComparatorConfig::default(),
        };

        let memory_checker = if self.valgrind {
            Some(MemoryChecker::Valgrind)
        } else if self.asan {
            Some(MemoryChecker::AddressSanitizer)
        } else {
            None
        };

        Ok(HarnessConfig {
            keep_pass: self.keep_pass,
            strict: self.strict,
            timeout: self.timeout_secs.map(Duration::from_secs),
            perceptual_diff_program: resolve_program(working_dir, &self.perceptualdiff),
            raster_probe_program: resolve_program(working_dir, &self.gdalinfo),
            comparator,
            memory_checker,
            valgrind_program: resolve_program(working_dir, &self.valgrind_program),
            ..self.fixtures.base_config(working_dir)
        })
    }
}

pub(super) fn run_run_command(args: RunArgs) -> Result<i32, CliError> {
    let working_dir = current_working_dir()?;
    let filter = compile_filter(args.fixtures.filter.as_deref())?;
    let batches = collect_fixture_batches(&working_dir, &args.fixtures.paths, filter.as_ref())?;
    let config = args.into_config(&working_dir)?;
    tracing::debug!(
        batches = batches.len(),
        renderer = %config.renderer.display(),
        strict = config.strict,
        "collected fixtures"
    );

    let mut harness = Harness::new(config)?;
    let mut summary = RunSummary::default();
    for (directory, fixtures) in &batches {
        println!(
            "Running {} fixture(s) in {}",
            fixtures.len(),
            directory.display()
        );
        summary.merge(harness.run_batch(directory, fixtures)?);
    }

    println!("{}", render_human_summary(&summary));
    if summary.passed() { Ok(0) } else { Ok(1) }
}

pub(super) fn run_list_command(args: ListArgs) -> Result<i32, CliError> {
    let working_dir = current_working_dir()?;
    let filter = compile_filter(args.fixtures.filter.as_deref())?;
    let batches = collect_fixture_batches(&working_dir, &args.fixtures.paths, filter.as_ref())?;
    let config = args.fixtures.base_config(&working_dir);

    for fixtures in batches.values() {
        for fixture in fixtures {
            for planned in plan_fixture(fixture, &config)? {
                println!("{}: {}", planned.test_id, planned.shell_line);
                if !planned.requires.is_empty() {
                    println!("  requires: {}", planned.requires.join(" "));
                }
            }
        }
    }
    Ok(0)
}
