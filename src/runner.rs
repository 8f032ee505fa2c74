//! Command Runner
//!
//! Launches child processes with a configured environment and working
//! directory, enforces timeouts, captures output, and provides the retry
//! policies used across the pool.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::error::Result;

/// Escalating retries multiply the poll interval by this factor after
/// each failure, up to the caller's cap.
const POLL_TIME_INCREASE_FACTOR: u32 = 4;

/// Outcome of a timed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Operation completed and reported success
    Success,
    /// Operation completed and reported failure
    Failed,
    /// Operation did not complete within the allotted time
    TimedOut,
    /// Operation raised an error before completing
    Exception,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Success => "success",
            CommandStatus::Failed => "failed",
            CommandStatus::TimedOut => "timed out",
            CommandStatus::Exception => "exception",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CommandStatus::Success)
    }
}

/// Captured result of a timed command
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Final status of the command
    pub status: CommandStatus,
    /// Captured stdout, UTF-8 lossy
    pub stdout: String,
    /// Captured stderr, UTF-8 lossy
    pub stderr: String,
    /// Exit code, if the process ran to completion
    pub exit_code: Option<i32>,
}

/// A cancellable timed operation.
///
/// `run` reports success with `Ok(true)`, failure with `Ok(false)` and
/// raises with `Err`. When the operation outlives its deadline the run
/// future is dropped and `cancel` is invoked; `cancel` must release any
/// external resources (for subprocess operations, it destroys the child).
#[allow(async_fn_in_trait)]
pub trait TimedRunnable {
    async fn run(&mut self) -> Result<bool>;
    async fn cancel(&mut self);
}

/// Executor configuration: environment overlay and working directory.
#[derive(Debug, Default)]
struct RunnerConfig {
    working_dir: Option<PathBuf>,
    env: HashMap<String, String>,
}

/// Launches child processes with a configured env + cwd.
///
/// Configuration mutations are serialized against spawns, so every spawn
/// sees an atomic snapshot of the working directory and environment.
pub struct CommandRunner {
    config: Mutex<RunnerConfig>,
}

impl CommandRunner {
    pub fn new() -> Self {
        Self {
            config: Mutex::new(RunnerConfig::default()),
        }
    }

    /// Set the working directory for subsequently spawned commands
    pub fn set_working_dir(&self, dir: PathBuf) {
        self.config.lock().working_dir = Some(dir);
    }

    /// Set an environment variable for subsequently spawned commands
    pub fn set_env_variable(&self, name: &str, value: &str) {
        self.config
            .lock()
            .env
            .insert(name.to_string(), value.to_string());
    }

    /// Build a `Command` under the config lock so the spawn sees a
    /// consistent snapshot.
    fn build_command(&self, argv: &[&str]) -> Command {
        let config = self.config.lock();
        let mut command = Command::new(argv[0]);
        command.args(&argv[1..]);
        if let Some(ref dir) = config.working_dir {
            command.current_dir(dir);
        }
        for (name, value) in &config.env {
            command.env(name, value);
        }
        command.kill_on_drop(true);
        command
    }

    /// Run a command, waiting up to `timeout` for it to complete.
    ///
    /// On expiry the child is destroyed and the result carries whatever
    /// output was captured. If the process exits in the same instant the
    /// timeout fires, the race resolves to `TimedOut`.
    pub async fn run_timed_cmd(&self, timeout: Duration, argv: &[&str]) -> CommandResult {
        self.run_cmd(timeout, None, argv, true).await
    }

    /// As `run_timed_cmd`, writing `input` to the child's stdin (and
    /// closing it) before waiting.
    pub async fn run_timed_cmd_with_input(
        &self,
        timeout: Duration,
        input: &str,
        argv: &[&str],
    ) -> CommandResult {
        self.run_cmd(timeout, Some(input.to_string()), argv, true).await
    }

    /// As `run_timed_cmd`, but suppresses error logging when the command
    /// raises.
    pub async fn run_timed_cmd_silently(&self, timeout: Duration, argv: &[&str]) -> CommandResult {
        self.run_cmd(timeout, None, argv, false).await
    }

    async fn run_cmd(
        &self,
        timeout: Duration,
        input: Option<String>,
        argv: &[&str],
        log_errors: bool,
    ) -> CommandResult {
        let mut command = self.build_command(argv);
        command.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut capture = CommandCapture::new(command, input, argv);
        let status = self.run_timed(timeout, &mut capture, log_errors).await;
        capture.into_result(status)
    }

    /// Spawn a command without waiting for it. The caller owns the child
    /// and its termination; stdout/stderr are piped.
    pub fn run_in_background(&self, argv: &[&str]) -> Result<Child> {
        debug!("Running {:?} in background", argv);
        let mut command = self.build_command(argv);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.kill_on_drop(false);
        Ok(command.spawn()?)
    }

    /// Run a cancellable operation, waiting up to `timeout`.
    ///
    /// The timeout arm is polled first, so an operation completing in the
    /// same instant the deadline expires still reports `TimedOut`.
    pub async fn run_timed<R: TimedRunnable>(
        &self,
        timeout: Duration,
        runnable: &mut R,
        log_errors: bool,
    ) -> CommandStatus {
        let outcome = {
            let run = runnable.run();
            tokio::pin!(run);
            tokio::select! {
                biased;
                _ = tokio::time::sleep(timeout) => None,
                result = &mut run => Some(result),
            }
        };
        match outcome {
            Some(Ok(true)) => CommandStatus::Success,
            Some(Ok(false)) => CommandStatus::Failed,
            Some(Err(e)) => {
                if log_errors {
                    error!("Error occurred when executing runnable: {}", e);
                }
                runnable.cancel().await;
                CommandStatus::Exception
            }
            None => {
                runnable.cancel().await;
                CommandStatus::TimedOut
            }
        }
    }

    /// Run an operation up to `attempts` times, sleeping `poll_interval`
    /// after each failure. Success short-circuits.
    pub async fn run_timed_retry<R: TimedRunnable>(
        &self,
        op_timeout: Duration,
        poll_interval: Duration,
        attempts: u32,
        runnable: &mut R,
    ) -> bool {
        for _ in 0..attempts {
            if self.run_timed(op_timeout, runnable, true).await.is_success() {
                return true;
            }
            debug!("operation failed, waiting for {:?}", poll_interval);
            self.sleep(poll_interval).await;
        }
        false
    }

    /// Retry an operation until `max_time` of wall clock has elapsed.
    pub async fn run_fixed_timed_retry<R: TimedRunnable>(
        &self,
        op_timeout: Duration,
        poll_interval: Duration,
        max_time: Duration,
        runnable: &mut R,
    ) -> bool {
        let initial_time = Instant::now();
        while initial_time.elapsed() < max_time {
            if self.run_timed(op_timeout, runnable, true).await.is_success() {
                return true;
            }
            debug!("operation failed, waiting for {:?}", poll_interval);
            self.sleep(poll_interval).await;
        }
        false
    }

    /// Retry an operation until `max_time` of wall clock has elapsed,
    /// with a poll interval that starts at `initial_poll_interval` and
    /// quadruples after each failure, capped at `max_poll_interval`.
    pub async fn run_escalating_timed_retry<R: TimedRunnable>(
        &self,
        op_timeout: Duration,
        initial_poll_interval: Duration,
        max_poll_interval: Duration,
        max_time: Duration,
        runnable: &mut R,
    ) -> bool {
        let mut poll_interval = initial_poll_interval;
        let initial_time = Instant::now();
        while initial_time.elapsed() < max_time {
            if self.run_timed(op_timeout, runnable, true).await.is_success() {
                return true;
            }
            debug!("operation failed, waiting for {:?}", poll_interval);
            self.sleep(poll_interval).await;
            poll_interval = (poll_interval * POLL_TIME_INCREASE_FACTOR).min(max_poll_interval);
        }
        false
    }

    /// Sleep for the given time; a zero duration is a no-op.
    pub async fn sleep(&self, time: Duration) {
        if time.is_zero() {
            return;
        }
        tokio::time::sleep(time).await;
    }
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// Subprocess-backed `TimedRunnable`: spawns the configured command,
/// optionally feeds stdin, and waits for exit. `cancel` destroys the
/// child and salvages whatever output was already produced.
struct CommandCapture {
    command: Command,
    input: Option<String>,
    argv: Vec<String>,
    child: Option<Child>,
    stdout_task: Option<JoinHandle<Vec<u8>>>,
    stderr_task: Option<JoinHandle<Vec<u8>>>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: Option<i32>,
}

impl CommandCapture {
    fn new(command: Command, input: Option<String>, argv: &[&str]) -> Self {
        Self {
            command,
            input,
            argv: argv.iter().map(|s| s.to_string()).collect(),
            child: None,
            stdout_task: None,
            stderr_task: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: None,
        }
    }

    async fn drain_output(&mut self) {
        if let Some(task) = self.stdout_task.take() {
            if let Ok(buffer) = task.await {
                self.stdout = buffer;
            }
        }
        if let Some(task) = self.stderr_task.take() {
            if let Ok(buffer) = task.await {
                self.stderr = buffer;
            }
        }
    }

    fn into_result(mut self, status: CommandStatus) -> CommandResult {
        CommandResult {
            status,
            stdout: String::from_utf8_lossy(&self.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr).into_owned(),
            exit_code: self.exit_code.take(),
        }
    }
}

async fn read_stream<S: AsyncReadExt + Unpin>(mut stream: S) -> Vec<u8> {
    let mut buffer = Vec::new();
    let _ = stream.read_to_end(&mut buffer).await;
    buffer
}

impl TimedRunnable for CommandCapture {
    async fn run(&mut self) -> Result<bool> {
        debug!("Running {:?}", self.argv);
        let mut child = self.command.spawn()?;
        let stdin = child.stdin.take();
        if let Some(stdout) = child.stdout.take() {
            self.stdout_task = Some(tokio::spawn(read_stream(stdout)));
        }
        if let Some(stderr) = child.stderr.take() {
            self.stderr_task = Some(tokio::spawn(read_stream(stderr)));
        }
        // The child must be reachable from `cancel` before the first await.
        self.child = Some(child);

        if let (Some(mut stdin), Some(input)) = (stdin, self.input.take()) {
            stdin.write_all(input.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let status = match self.child.as_mut() {
            Some(child) => child.wait().await?,
            None => return Ok(false),
        };
        self.exit_code = status.code();
        self.drain_output().await;

        if status.success() {
            Ok(true)
        } else {
            info!(
                "{:?} command failed. return code {:?}",
                self.argv,
                status.code()
            );
            Ok(false)
        }
    }

    async fn cancel(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        self.drain_output().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    /// Scripted runnable: returns the configured outcomes in order, and
    /// records run timestamps and cancellation.
    struct FakeRunnable {
        outcomes: Vec<Result<bool>>,
        runs: Arc<AtomicU32>,
        cancelled: Arc<AtomicBool>,
        run_times: Vec<Instant>,
        block_forever: bool,
    }

    impl FakeRunnable {
        fn new(outcomes: Vec<Result<bool>>) -> Self {
            Self {
                outcomes,
                runs: Arc::new(AtomicU32::new(0)),
                cancelled: Arc::new(AtomicBool::new(false)),
                run_times: Vec::new(),
                block_forever: false,
            }
        }

        fn blocking() -> Self {
            let mut fake = Self::new(vec![]);
            fake.block_forever = true;
            fake
        }
    }

    impl TimedRunnable for FakeRunnable {
        async fn run(&mut self) -> Result<bool> {
            self.run_times.push(Instant::now());
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.block_forever {
                std::future::pending::<()>().await;
            }
            if self.outcomes.is_empty() {
                Ok(false)
            } else {
                self.outcomes.remove(0)
            }
        }

        async fn cancel(&mut self) {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_run_timed_cmd_success() {
        let runner = CommandRunner::new();
        let result = runner
            .run_timed_cmd(Duration::from_secs(5), &["/bin/echo", "hello"])
            .await;
        assert_eq!(result.status, CommandStatus::Success);
        assert_eq!(result.stdout.trim(), "hello");
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_run_timed_cmd_failure() {
        let runner = CommandRunner::new();
        let result = runner
            .run_timed_cmd(Duration::from_secs(5), &["/bin/false"])
            .await;
        assert_eq!(result.status, CommandStatus::Failed);
        assert_eq!(result.exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_run_timed_cmd_timeout_kills_child() {
        let runner = CommandRunner::new();
        let start = std::time::Instant::now();
        let result = runner
            .run_timed_cmd(Duration::from_millis(200), &["/bin/sleep", "30"])
            .await;
        assert_eq!(result.status, CommandStatus::TimedOut);
        assert!(result.exit_code.is_none());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_run_timed_cmd_with_input() {
        let runner = CommandRunner::new();
        let result = runner
            .run_timed_cmd_with_input(Duration::from_secs(5), "ping\n", &["/bin/cat"])
            .await;
        assert_eq!(result.status, CommandStatus::Success);
        assert_eq!(result.stdout, "ping\n");
    }

    #[tokio::test]
    async fn test_run_timed_cmd_silently_missing_binary() {
        let runner = CommandRunner::new();
        let result = runner
            .run_timed_cmd_silently(
                Duration::from_secs(5),
                &["/nonexistent/droidpool-test-binary"],
            )
            .await;
        assert_eq!(result.status, CommandStatus::Exception);
    }

    #[tokio::test]
    async fn test_env_and_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let canonical = dir.path().canonicalize().unwrap();

        let runner = CommandRunner::new();
        runner.set_env_variable("DROIDPOOL_TEST_VAR", "marker");
        runner.set_working_dir(canonical.clone());

        let result = runner
            .run_timed_cmd(
                Duration::from_secs(5),
                &["/bin/sh", "-c", "echo $DROIDPOOL_TEST_VAR; pwd"],
            )
            .await;
        assert_eq!(result.status, CommandStatus::Success);
        let mut lines = result.stdout.lines();
        assert_eq!(lines.next(), Some("marker"));
        assert_eq!(lines.next(), Some(canonical.to_str().unwrap()));
    }

    #[tokio::test]
    async fn test_run_timed_statuses() {
        let runner = CommandRunner::new();

        let mut ok = FakeRunnable::new(vec![Ok(true)]);
        assert_eq!(
            runner.run_timed(Duration::from_secs(1), &mut ok, true).await,
            CommandStatus::Success
        );

        let mut failed = FakeRunnable::new(vec![Ok(false)]);
        assert_eq!(
            runner
                .run_timed(Duration::from_secs(1), &mut failed, true)
                .await,
            CommandStatus::Failed
        );

        let mut raised =
            FakeRunnable::new(vec![Err(crate::PoolError::InvalidState("boom".into()))]);
        assert_eq!(
            runner
                .run_timed(Duration::from_secs(1), &mut raised, false)
                .await,
            CommandStatus::Exception
        );
    }

    #[tokio::test]
    async fn test_run_timed_timeout_invokes_cancel() {
        let runner = CommandRunner::new();
        let mut blocked = FakeRunnable::blocking();
        let cancelled = blocked.cancelled.clone();

        let start = std::time::Instant::now();
        let status = runner
            .run_timed(Duration::from_millis(100), &mut blocked, true)
            .await;
        assert_eq!(status, CommandStatus::TimedOut);
        assert!(cancelled.load(Ordering::SeqCst));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_run_timed_retry_short_circuits() {
        let runner = CommandRunner::new();
        let mut flaky = FakeRunnable::new(vec![Ok(false), Ok(false), Ok(true)]);
        let runs = flaky.runs.clone();
        assert!(
            runner
                .run_timed_retry(
                    Duration::from_secs(1),
                    Duration::from_millis(5),
                    5,
                    &mut flaky,
                )
                .await
        );
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_timed_retry_exhausts_attempts() {
        let runner = CommandRunner::new();
        let mut failing = FakeRunnable::new(vec![]);
        let runs = failing.runs.clone();
        assert!(
            !runner
                .run_timed_retry(
                    Duration::from_secs(1),
                    Duration::from_millis(1),
                    3,
                    &mut failing,
                )
                .await
        );
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_timed_retry_bounded_by_max_time() {
        let runner = CommandRunner::new();
        let mut failing = FakeRunnable::new(vec![]);
        let runs = failing.runs.clone();
        assert!(
            !runner
                .run_fixed_timed_retry(
                    Duration::from_secs(1),
                    Duration::from_millis(100),
                    Duration::from_millis(450),
                    &mut failing,
                )
                .await
        );
        // attempts at t=0, 100, 200, 300, 400
        assert_eq!(runs.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_escalating_retry_poll_intervals() {
        let runner = CommandRunner::new();
        let mut failing = FakeRunnable::new(vec![]);
        assert!(
            !runner
                .run_escalating_timed_retry(
                    Duration::from_secs(1),
                    Duration::from_millis(10),
                    Duration::from_millis(100),
                    Duration::from_millis(500),
                    &mut failing,
                )
                .await
        );

        let gaps: Vec<u64> = failing
            .run_times
            .windows(2)
            .map(|w| (w[1] - w[0]).as_millis() as u64)
            .collect();
        // 10, 10*4, then capped at 100
        assert_eq!(&gaps[..3], &[10, 40, 100]);
        assert!(gaps[3..].iter().all(|&gap| gap == 100));
    }

    #[tokio::test]
    async fn test_sleep_zero_is_noop() {
        let runner = CommandRunner::new();
        let start = std::time::Instant::now();
        runner.sleep(Duration::ZERO).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
