//! Command executor port: child processes with timeouts and bounded output.
//!
//! Gates and the default agent both go through [`CommandRunner`], so tests can
//! swap in a scripted runner without spawning anything.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// What to run and under which limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
    pub workdir: PathBuf,
    pub timeout: Duration,
    /// Bytes kept per stream; the rest is drained and counted.
    pub output_limit_bytes: usize,
    /// Tee stdout lines into this file as they arrive.
    pub stream_path: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            workdir: workdir.into(),
            timeout: Duration::from_secs(60),
            output_limit_bytes: 200_000,
            stream_path: None,
        }
    }

    /// `sh -c <script>` with stderr folded into stdout, preserving interleaving.
    pub fn shell(script: &str, workdir: impl Into<PathBuf>) -> Self {
        let mut spec = Self::new("sh", workdir);
        spec.args = vec!["-c".to_string(), format!("exec 2>&1\n{script}")];
        spec
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn output_limit(mut self, bytes: usize) -> Self {
        self.output_limit_bytes = bytes;
        self
    }

    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }
}

/// Captured result of a finished (or killed) child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
    pub truncated_bytes: usize,
}

impl CommandOutcome {
    /// Outcome of a process that exited normally.
    pub fn exited(exit_code: i32, stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: stdout.into(),
            stderr: String::new(),
            duration: Duration::ZERO,
            timed_out: false,
            truncated_bytes: 0,
        }
    }

    /// Outcome of a process killed at its deadline, keeping partial output.
    pub fn timed_out(partial_stdout: impl Into<String>, after: Duration) -> Self {
        Self {
            exit_code: None,
            stdout: partial_stdout.into(),
            stderr: String::new(),
            duration: after,
            timed_out: true,
            truncated_bytes: 0,
        }
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// stdout followed by stderr, with a truncation notice when bytes were dropped.
    pub fn combined_output(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        if self.truncated_bytes > 0 {
            out.push_str(&format!("\n[output truncated {} bytes]\n", self.truncated_bytes));
        }
        out
    }
}

/// Runs one command to completion. Implementations must not overlap children.
pub trait CommandRunner {
    /// `Err` only when the command could not be run at all (spawn, pipe errors).
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutcome>;
}

impl<T: CommandRunner + ?Sized> CommandRunner for &T {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutcome> {
        (**self).run(spec)
    }
}

/// Process group of the child that is running right now, if any.
///
/// Children are spawned as group leaders, so the pid doubles as the group id.
/// Clones share state, which lets a signal handler reach the child a runner
/// is waiting on.
#[derive(Debug, Clone, Default)]
pub struct ActiveChild(Arc<AtomicU32>);

impl ActiveChild {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pid(&self) -> Option<u32> {
        match self.0.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// SIGKILL the running child's process group. `false` when nothing is running
    /// or the kill failed.
    pub fn kill_group(&self) -> bool {
        match self.pid() {
            Some(pid) => {
                warn!(pid, "killing active child process group");
                kill_group(pid)
            }
            None => false,
        }
    }

    fn register(&self, pid: u32) -> Registration<'_> {
        self.0.store(pid, Ordering::SeqCst);
        Registration(self)
    }
}

/// Clears the active pid once the child has been reaped.
struct Registration<'a>(&'a ActiveChild);

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.0.0.store(0, Ordering::SeqCst);
    }
}

/// Real child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    active: ActiveChild,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle on the child this runner (and its clones) is currently waiting on.
    pub fn active_child(&self) -> ActiveChild {
        self.active.clone()
    }
}

impl CommandRunner for ProcessRunner {
    #[instrument(skip_all, fields(program = %spec.program, timeout_secs = spec.timeout.as_secs()))]
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutcome> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args).current_dir(&spec.workdir);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        run_command_with_timeout(
            cmd,
            spec.stdin.as_deref().map(str::as_bytes),
            spec.timeout,
            spec.output_limit_bytes,
            spec.stream_path.as_deref(),
            Some(&self.active),
        )
        .with_context(|| format!("run {}", spec.program))
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read and stdin is written on helper threads while the child runs, so the
/// deadline holds even when the child never drains its input. `output_limit_bytes` bounds
/// the amount of stdout/stderr stored in memory (bytes beyond this are discarded while
/// still draining the pipe). When `stream_path` is set, stdout lines are also written
/// there as they arrive. `active` holds the child's pid until it has been reaped.
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    stream_path: Option<&Path>,
    active: Option<&ActiveChild>,
) -> Result<CommandOutcome> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let stream_file = match stream_path {
        Some(path) => Some(open_stream_file(path)?),
        None => None,
    };

    debug!("spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };
    let _registration = active.map(|active| active.register(child.id()));

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_lines_limited(stdout, output_limit_bytes, stream_file));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));
    let stdin_handle = match stdin {
        Some(input) => {
            let child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            Some(thread::spawn(move || write_input(child_stdin, &input)))
        }
        None => None,
    };

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            kill_tree(&mut child)?;
            child.wait().context("wait command after kill")?
        }
    };
    let duration = started.elapsed();

    if let Some(handle) = stdin_handle
        && handle.join().is_err()
    {
        warn!("stdin writer thread panicked");
    }
    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;
    let truncated_bytes = stdout_truncated + stderr_truncated;
    if truncated_bytes > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutcome {
        exit_code: status.code(),
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        duration,
        timed_out,
        truncated_bytes,
    })
}

/// Feed the child's stdin; dropping the handle afterwards signals EOF.
fn write_input(mut child_stdin: ChildStdin, input: &[u8]) {
    // A child that exits (or is killed) without reading its input closes the pipe early.
    if let Err(e) = child_stdin.write_all(input) {
        warn!(err = %e, "child closed stdin before reading all input");
    }
}

/// Kill the child's whole process group so grandchildren release the pipes.
fn kill_tree(child: &mut Child) -> Result<()> {
    if kill_group(child.id()) {
        return Ok(());
    }
    child.kill().context("kill command")
}

#[cfg(unix)]
fn kill_group(pid: u32) -> bool {
    let group = format!("-{pid}");
    match Command::new("kill").args(["-KILL", "--", &group]).status() {
        Ok(status) if status.success() => true,
        Ok(status) => {
            warn!(?status, "group kill failed");
            false
        }
        Err(e) => {
            warn!(err = %e, "group kill failed");
            false
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) -> bool {
    false
}

type StreamFile = Mutex<BufWriter<File>>;

fn open_stream_file(path: &Path) -> Result<Arc<StreamFile>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create stream dir {}", parent.display()))?;
    }
    let file =
        File::create(path).with_context(|| format!("create stream file {}", path.display()))?;
    Ok(Arc::new(Mutex::new(BufWriter::new(file))))
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Read line by line with a size limit, optionally tee-ing each line to a file.
fn read_lines_limited<R: Read>(
    reader: R,
    limit: usize,
    stream_file: Option<Arc<StreamFile>>,
) -> Result<(Vec<u8>, usize)> {
    let mut buf_reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;

    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read line")?;
        if n == 0 {
            break;
        }

        if let Some(mutex) = stream_file.as_deref()
            && let Ok(mut writer) = mutex.lock()
        {
            if let Err(e) = writer.write_all(&line) {
                warn!(err = %e, "failed to write to stream file");
            } else if let Err(e) = writer.flush() {
                warn!(err = %e, "failed to flush stream file");
            }
        }

        let remaining = limit.saturating_sub(collected.len());
        let keep = n.min(remaining);
        collected.extend_from_slice(&line[..keep]);
        truncated += n - keep;
    }

    Ok((collected, truncated))
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        let keep = n.min(remaining);
        buf.extend_from_slice(&chunk[..keep]);
        truncated += n - keep;
    }

    Ok((buf, truncated))
}
