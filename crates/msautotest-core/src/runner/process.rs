use crate::domain::AutotestError;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// One shell invocation. The environment bag applies to this child only.
#[derive(Debug, Clone)]
pub struct ProcessSpec<'a> {
    pub command_line: &'a str,
    pub current_dir: &'a Path,
    pub env: &'a [(String, String)],
    pub stdin: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    /// `None` when the child was killed after its deadline.
    pub status: Option<ExitStatus>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

impl ProcessOutput {
    /// Captured stderr (or stdout when stderr is empty), trimmed, for failure reports.
    pub fn diagnostics(&self) -> Option<String> {
        [&self.stderr, &self.stdout]
            .into_iter()
            .map(|stream| String::from_utf8_lossy(stream).trim().to_string())
            .find(|text| !text.is_empty())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to start '{command}' in '{}': {source}", current_dir.display())]
    Spawn {
        command: String,
        current_dir: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to wait for '{command}': {source}")]
    Wait {
        command: String,
        source: std::io::Error,
    },
}

impl From<ProcessError> for AutotestError {
    fn from(error: ProcessError) -> Self {
        AutotestError::io_system("IO.PROCESS", error.to_string())
    }
}

pub fn run_shell(spec: ProcessSpec<'_>) -> Result<ProcessOutput, ProcessError> {
    let mut command = shell_command(spec.command_line);
    command
        .current_dir(spec.current_dir)
        .envs(spec.env.iter().map(|(key, value)| (key, value)))
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    isolate_process_group(&mut command);

    let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
        command: spec.command_line.to_string(),
        current_dir: spec.current_dir.to_path_buf(),
        source,
    })?;

    if let (Some(mut pipe), Some(payload)) = (child.stdin.take(), spec.stdin) {
        // A child that never reads its input closes the pipe; the write error is expected then.
        thread::spawn(move || {
            let _ = pipe.write_all(&payload);
        });
    }
    let stdout = child.stdout.take().map(spawn_reader);
    let stderr = child.stderr.take().map(spawn_reader);

    let status = wait_with_deadline(&mut child, spec.timeout).map_err(|source| {
        ProcessError::Wait {
            command: spec.command_line.to_string(),
            source,
        }
    })?;

    let Some(status) = status else {
        tracing::warn!(
            command = spec.command_line,
            timeout_ms = spec.timeout.map(|timeout| timeout.as_millis()),
            "command exceeded its deadline and was killed"
        );
        // Readers may be blocked on pipes inherited by grandchildren; leave them detached.
        return Ok(ProcessOutput {
            timed_out: true,
            ..ProcessOutput::default()
        });
    };

    Ok(ProcessOutput {
        status: Some(status),
        stdout: join_reader(stdout),
        stderr: join_reader(stderr),
        timed_out: false,
    })
}

fn wait_with_deadline(
    child: &mut Child,
    timeout: Option<Duration>,
) -> std::io::Result<Option<ExitStatus>> {
    let Some(timeout) = timeout else {
        return child.wait().map(Some);
    };

    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            if let Err(error) = kill_process_group(child) {
                tracing::warn!(pid = child.id(), error = %error, "could not kill timed-out command");
            }
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// The shell leads its own process group so a timeout also reaches the
/// renderer and any pipeline stages it started.
#[cfg(unix)]
fn isolate_process_group(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(not(unix))]
fn isolate_process_group(_command: &mut Command) {}

#[cfg(unix)]
fn kill_process_group(child: &mut Child) -> std::io::Result<()> {
    let Ok(group) = libc::pid_t::try_from(child.id()) else {
        return child.kill();
    };
    // SAFETY: a negative pid addresses the process group led by the child; no memory is shared.
    let result = unsafe { libc::kill(-group, libc::SIGKILL) };
    if result == 0 {
        return Ok(());
    }
    let error = std::io::Error::last_os_error();
    match error.raw_os_error() {
        Some(code) if code == libc::ESRCH => Ok(()),
        _ => child.kill().map_err(|_| error),
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) -> std::io::Result<()> {
    child.kill()
}

fn spawn_reader(mut stream: impl Read + Send + 'static) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = stream.read_to_end(&mut buffer);
        buffer
    })
}

fn join_reader(reader: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

#[cfg(not(windows))]
fn shell_command(command_line: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(command_line);
    command
}

#[cfg(windows)]
fn shell_command(command_line: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(command_line);
    command
}

#[cfg(all(test, unix))]
mod tests {
    use super::{ProcessSpec, run_shell};
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn spec<'a>(
        command_line: &'a str,
        current_dir: &'a std::path::Path,
        env: &'a [(String, String)],
    ) -> ProcessSpec<'a> {
        ProcessSpec {
            command_line,
            current_dir,
            env,
            stdin: None,
            timeout: None,
        }
    }

    #[test]
    fn captures_output_from_the_fixture_directory() {
        let temp = TempDir::new().expect("tempdir should be created");
        std::fs::write(temp.path().join("marker.txt"), "here").expect("marker should be written");

        let output = run_shell(spec("cat marker.txt; echo oops >&2", temp.path(), &[]))
            .expect("shell should run");
        assert!(output.status.is_some_and(|status| status.success()));
        assert_eq!(output.stdout, b"here".to_vec());
        assert_eq!(output.diagnostics().as_deref(), Some("oops"));
    }

    #[test]
    fn environment_bag_and_stdin_reach_the_child_only() {
        let temp = TempDir::new().expect("tempdir should be created");
        let env = vec![("CONTENT_TYPE".to_string(), "text/xml".to_string())];
        let mut process = spec("printf '%s:' \"$CONTENT_TYPE\"; cat", temp.path(), &env);
        process.stdin = Some(b"<xml/>\n".to_vec());

        let output = run_shell(process).expect("shell should run");
        assert_eq!(String::from_utf8_lossy(&output.stdout), "text/xml:<xml/>\n");
        assert!(std::env::var_os("CONTENT_TYPE").is_none());
    }

    #[test]
    fn failing_command_reports_status_without_error() {
        let temp = TempDir::new().expect("tempdir should be created");
        let output = run_shell(spec("exit 3", temp.path(), &[])).expect("shell should run");
        assert_eq!(output.status.and_then(|status| status.code()), Some(3));
        assert_eq!(output.diagnostics(), None);
    }

    #[test]
    fn deadline_kills_hung_commands() {
        let temp = TempDir::new().expect("tempdir should be created");
        let mut process = spec("exec sleep 5", temp.path(), &[]);
        process.timeout = Some(Duration::from_millis(200));

        let started = Instant::now();
        let output = run_shell(process).expect("shell should run");
        assert!(output.timed_out);
        assert!(output.status.is_none());
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn deadline_kills_background_stages_of_the_command() {
        let temp = TempDir::new().expect("tempdir should be created");
        let mut process = spec("(sleep 1; touch late.txt) & sleep 5", temp.path(), &[]);
        process.timeout = Some(Duration::from_millis(200));

        let output = run_shell(process).expect("shell should run");
        assert!(output.timed_out);
        std::thread::sleep(Duration::from_millis(1500));
        assert!(!temp.path().join("late.txt").exists());
    }

    #[test]
    fn missing_directory_is_a_spawn_error() {
        let temp = TempDir::new().expect("tempdir should be created");
        let missing = temp.path().join("absent");
        let error = run_shell(spec("true", &missing, &[])).expect_err("spawn should fail");
        assert!(error.to_string().contains("failed to start 'true'"));
    }
}
