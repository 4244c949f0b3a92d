#![cfg(unix)]

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

const FAKE_RENDERER: &str = r#"#!/bin/sh
if [ "$1" = "-v" ]; then
  echo "MapServer version 8.0.1 OUTPUT=PNG SUPPORTS=PROJ INPUT=GDAL"
  exit 0
fi
map=""
out=""
while [ $# -gt 0 ]; do
  case "$1" in
    -m) map="$2"; shift 2 ;;
    -o) out="$2"; shift 2 ;;
    *) shift ;;
  esac
done
cp "$map" "$out"
if grep -q leaky "$map"; then
  echo "==41==ERROR: LeakSanitizer: detected memory leaks" >&2
elif grep -q noisy "$map"; then
  echo "warning: falling back to default font" >&2
fi
"#;

const FAKE_VALGRIND: &str = r#"#!/bin/sh
echo "==7== memcheck $*" >&2
while [ $# -gt 0 ]; do
  case "$1" in
    -*) shift ;;
    *) break ;;
  esac
done
echo "==7== Invalid read of size 4" >&2
exec "$@"
"#;

fn install_script(temp: &TempDir, name: &str, body: &str) -> PathBuf {
    let path = temp.path().join("tools").join(name);
    fs::create_dir_all(path.parent().expect("tools dir")).expect("tools dir should be created");
    {
        let mut file = fs::File::create(&path).expect("script should be created");
        file.write_all(body.as_bytes()).expect("script should be written");
        file.sync_all().expect("script should be flushed");
    }
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
        .expect("script should be executable");
    path
}

fn install_fake_renderer(temp: &TempDir) -> PathBuf {
    install_script(temp, "fake-shp2img", FAKE_RENDERER)
}

fn write_file(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("parent dir should be created");
    }
    fs::write(path, content).expect("file should be written");
}

fn run_msautotest(working_dir: &Path, renderer: &Path, args: &[&str]) -> Output {
    let (subcommand, rest) = args.split_first().expect("subcommand should be given");
    let mut command = Command::new(env!("CARGO_BIN_EXE_msautotest"));
    command
        .current_dir(working_dir)
        .env_remove("RUST_LOG")
        .arg(subcommand)
        .arg("--renderer")
        .arg(renderer);
    if *subcommand == "run" {
        command
            .arg("--gdalinfo")
            .arg(working_dir.join("tools/no-gdalinfo"))
            .arg("--perceptualdiff")
            .arg(working_dir.join("tools/no-perceptualdiff"));
    }
    command
        .args(rest)
        .output()
        .expect("msautotest binary should run")
}

fn stdout_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn first_run_initializes_and_second_run_matches() {
    let temp = TempDir::new().expect("tempdir should be created");
    let renderer = install_fake_renderer(&temp);
    write_file(&temp.path().join("line.map"), "MAP\n  NAME line\nEND\n");

    let first = run_msautotest(temp.path(), &renderer, &["run"]);
    assert_eq!(first.status.code(), Some(0), "stderr: {}", stderr_of(&first));
    let stdout = stdout_of(&first);
    assert!(stdout.contains("Running 1 fixture(s)"), "stdout: {}", stdout);
    assert!(stdout.contains("Test status: PASS"), "stdout: {}", stdout);
    assert!(stdout.contains("initialized: 1"), "stdout: {}", stdout);
    assert_eq!(
        fs::read_to_string(temp.path().join("expected/line.png")).expect("baseline"),
        "MAP\n  NAME line\nEND\n"
    );

    let second = run_msautotest(temp.path(), &renderer, &["run", "."]);
    assert_eq!(second.status.code(), Some(0), "stderr: {}", stderr_of(&second));
    let stdout = stdout_of(&second);
    assert!(stdout.contains("succeeded:   1"), "stdout: {}", stdout);
    assert!(stdout.contains("Success rate: 100.0% (1 executed)"), "stdout: {}", stdout);
    assert!(!temp.path().join("result/line.png").exists());
}

#[test]
fn mismatching_result_fails_the_run() {
    let temp = TempDir::new().expect("tempdir should be created");
    let renderer = install_fake_renderer(&temp);
    write_file(&temp.path().join("poly.map"), "MAP\n  NAME poly\nEND\n");
    write_file(&temp.path().join("expected/poly.png"), "older rendering\n");

    let output = run_msautotest(temp.path(), &renderer, &["run"]);
    assert_eq!(output.status.code(), Some(1), "stderr: {}", stderr_of(&output));
    let stdout = stdout_of(&output);
    assert!(stdout.contains("Test status: FAIL"), "stdout: {}", stdout);
    assert!(stdout.contains("Failures:"), "stdout: {}", stdout);
    assert!(
        stdout.contains("poly.png: results don't match"),
        "stdout: {}",
        stdout
    );
    assert!(temp.path().join("result/poly.png").exists());
}

#[test]
fn unmet_directory_requirements_skip_the_batch() {
    let temp = TempDir::new().expect("tempdir should be created");
    let renderer = install_fake_renderer(&temp);
    write_file(&temp.path().join("wcs/all_require.txt"), "SUPPORTS=WCS_SERVER\n");
    write_file(&temp.path().join("wcs/coverage.map"), "MAP END\n");

    let output = run_msautotest(temp.path(), &renderer, &["run", "wcs"]);
    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr_of(&output));
    let stdout = stdout_of(&output);
    assert!(stdout.contains("skipped:     1"), "stdout: {}", stdout);
    assert!(stdout.contains("Skipped directory"), "stdout: {}", stdout);
    assert!(stdout.contains("SUPPORTS=WCS_SERVER"), "stdout: {}", stdout);
    assert!(!temp.path().join("wcs/expected").exists());
}

#[test]
fn filter_limits_which_fixtures_run() {
    let temp = TempDir::new().expect("tempdir should be created");
    let renderer = install_fake_renderer(&temp);
    write_file(&temp.path().join("wms_basic.map"), "MAP wms END\n");
    write_file(&temp.path().join("label.map"), "MAP label END\n");

    let output = run_msautotest(temp.path(), &renderer, &["run", "--filter", "wms_*.map"]);
    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr_of(&output));
    assert!(temp.path().join("expected/wms_basic.png").exists());
    assert!(!temp.path().join("expected/label.png").exists());
}

#[test]
fn list_prints_commands_without_running_them() {
    let temp = TempDir::new().expect("tempdir should be created");
    let renderer = install_fake_renderer(&temp);
    write_file(
        &temp.path().join("wms.map"),
        "# REQUIRES: SUPPORTS=WMS_SERVER\n\
         # RUN_PARMS: wms_caps.xml [MAPSERV] QUERY_STRING='map=[MAPFILE]&REQUEST=GetCapabilities' > [RESULT_DEMIME]\n\
         MAP END\n",
    );

    let output = run_msautotest(temp.path(), &renderer, &["list", "--mapserv", "mapserv-test"]);
    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr_of(&output));
    let stdout = stdout_of(&output);
    assert!(
        stdout.contains(
            "wms_wms_caps_xml: mapserv-test QUERY_STRING='map=wms.map&REQUEST=GetCapabilities' > result/wms_caps.xml"
        ),
        "stdout: {}",
        stdout
    );
    assert!(stdout.contains("  requires: SUPPORTS=WMS_SERVER"), "stdout: {}", stdout);
    assert!(!temp.path().join("result").exists());
}

#[test]
fn invalid_arguments_exit_with_usage_error() {
    let temp = TempDir::new().expect("tempdir should be created");
    let renderer = install_fake_renderer(&temp);

    let output = run_msautotest(temp.path(), &renderer, &["run", "--timeout-secs", "soon"]);
    assert_eq!(output.status.code(), Some(2));
    let stderr = stderr_of(&output);
    assert!(stderr.contains("ERROR: [INPUT.CLI_USAGE]"), "stderr: {}", stderr);
    assert!(stderr.contains("FATAL EXIT CODE: 2"), "stderr: {}", stderr);
}

#[test]
fn missing_fixture_path_is_an_input_error() {
    let temp = TempDir::new().expect("tempdir should be created");
    let renderer = install_fake_renderer(&temp);

    let output = run_msautotest(temp.path(), &renderer, &["run", "absent.map"]);
    assert_eq!(output.status.code(), Some(2));
    let stderr = stderr_of(&output);
    assert!(
        stderr.contains("ERROR: [INPUT.CLI_FIXTURE_PATH]"),
        "stderr: {}",
        stderr
    );
    assert!(stderr.contains("absent.map"), "stderr: {}", stderr);
}

#[test]
fn malformed_comparator_config_is_rejected() {
    let temp = TempDir::new().expect("tempdir should be created");
    let renderer = install_fake_renderer(&temp);
    write_file(&temp.path().join("line.map"), "MAP END\n");
    write_file(&temp.path().join("comparator.json"), "{ not json");

    let output = run_msautotest(
        temp.path(),
        &renderer,
        &["run", "--comparator-config", "comparator.json"],
    );
    assert_eq!(output.status.code(), Some(2));
    assert!(
        stderr_of(&output).contains("[INPUT.COMPARATOR_CONFIG]"),
        "stderr: {}",
        stderr_of(&output)
    );
}

#[test]
fn tool_paths_with_directories_are_anchored_to_the_working_directory() {
    let temp = TempDir::new().expect("tempdir should be created");
    let renderer = install_fake_renderer(&temp);
    write_file(
        &temp.path().join("wms.map"),
        "# RUN_PARMS: wms_caps.xml [MAPSERV] QUERY_STRING='map=[MAPFILE]' > [RESULT]\n\
         MAP END\n",
    );

    let output = run_msautotest(temp.path(), &renderer, &["list", "--mapserv", "build/mapserv"]);
    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr_of(&output));
    let stdout = stdout_of(&output);
    assert!(stdout.contains("/build/mapserv QUERY_STRING="), "stdout: {}", stdout);
    assert!(!stdout.contains(": build/mapserv"), "stdout: {}", stdout);
}

#[test]
fn asan_run_keeps_only_sanitizer_reports() {
    let temp = TempDir::new().expect("tempdir should be created");
    let renderer = install_fake_renderer(&temp);
    write_file(&temp.path().join("leaky.map"), "MAP leaky END\n");
    write_file(&temp.path().join("quiet.map"), "MAP noisy END\n");

    let output = run_msautotest(temp.path(), &renderer, &["run", "--asan"]);
    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr_of(&output));
    let stdout = stdout_of(&output);
    assert!(stdout.contains("Memory checker logs:"), "stdout: {}", stdout);
    assert!(stdout.contains("leaky.png.asan.txt"), "stdout: {}", stdout);
    assert!(
        fs::read_to_string(temp.path().join("result/leaky.png.asan.txt"))
            .expect("sanitizer report should be kept")
            .contains("LeakSanitizer")
    );
    assert!(!temp.path().join("result/quiet.png.asan.txt").exists());
    assert!(temp.path().join("expected/quiet.png").exists());
}

#[test]
fn valgrind_run_wraps_the_renderer_and_keeps_its_log() {
    let temp = TempDir::new().expect("tempdir should be created");
    let renderer = install_fake_renderer(&temp);
    let valgrind = install_script(&temp, "fake-valgrind", FAKE_VALGRIND);
    write_file(&temp.path().join("valgrind-suppressions.txt"), "{\n}\n");
    write_file(&temp.path().join("gdal/line.map"), "MAP line END\n");

    let valgrind_arg = valgrind.to_string_lossy().into_owned();
    let output = run_msautotest(
        temp.path(),
        &renderer,
        &["run", "gdal", "--valgrind", "--valgrind-program", &valgrind_arg],
    );
    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr_of(&output));
    assert!(temp.path().join("gdal/expected/line.png").exists());

    let log = fs::read_to_string(temp.path().join("gdal/result/line.png.vgrind.txt"))
        .expect("valgrind log should be kept");
    assert!(log.contains("--tool=memcheck"), "log: {}", log);
    assert!(
        log.contains("--suppressions=../valgrind-suppressions.txt"),
        "log: {}",
        log
    );
    assert!(log.contains("Invalid read of size 4"), "log: {}", log);
    assert!(stdout_of(&output).contains("line.png.vgrind.txt"));
}

#[test]
fn valgrind_and_asan_are_mutually_exclusive() {
    let temp = TempDir::new().expect("tempdir should be created");
    let renderer = install_fake_renderer(&temp);

    let output = run_msautotest(temp.path(), &renderer, &["run", "--valgrind", "--asan"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr_of(&output).contains("[INPUT.CLI_USAGE]"));
}
