use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::watch;

use super::FlashError;

/// Keep at most this much of a command's stderr for error reports.
const STDERR_TAIL: usize = 4096;

/// An external command: program plus arguments, never passed through a shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).stdin(Stdio::null());
        // Keep children out of the terminal's foreground group so Ctrl-C
        // reaches sdflash only and goes through the abort path.
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{arg}'")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Captured result of a finished command
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// stdout and stderr together, for tools that print usage on either stream.
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

fn spawn_error(spec: &CommandSpec, err: io::Error) -> FlashError {
    match err.kind() {
        io::ErrorKind::NotFound => FlashError::ToolMissing(spec.program.clone()),
        io::ErrorKind::PermissionDenied => FlashError::PermissionDenied(spec.to_string()),
        _ => FlashError::ExternalCommandFailed {
            command: spec.to_string(),
            code: None,
            stderr: err.to_string(),
        },
    }
}

/// Run a short read-only query (lsblk, diskutil info, which) to completion.
/// The exit status is returned as-is; callers decide what failure means.
pub async fn capture(spec: &CommandSpec) -> Result<CommandOutput, FlashError> {
    log::debug!("Executing query: {spec}");
    let output = spec
        .to_command()
        .output()
        .await
        .map_err(|e| spawn_error(spec, e))?;

    Ok(CommandOutput {
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Cooperative cancellation shared between the caller and a flash run.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `cancel` has been called, immediately if it already was.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so the channel cannot close while we wait.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// The single slot for the currently running external command.
#[derive(Debug, Clone, Default)]
pub struct ProcessSlot {
    current: Arc<Mutex<Option<String>>>,
}

impl ProcessSlot {
    /// Description of the live command, if any.
    pub fn current(&self) -> Option<String> {
        self.lock().clone()
    }

    pub fn is_live(&self) -> bool {
        self.lock().is_some()
    }

    fn occupy(&self, command: String) {
        let mut slot = self.lock();
        if let Some(previous) = slot.as_ref() {
            log::warn!("Process slot still held by `{previous}` while starting `{command}`");
        }
        *slot = Some(command);
    }

    fn release(&self) {
        *self.lock() = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        // A poisoned slot only means a panicking holder; the Option is still valid.
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Result of waiting on a live process
#[derive(Debug)]
pub enum WaitOutcome {
    Exited(ExitStatus),
    Cancelled,
}

/// One running external command. Releases its `ProcessSlot` when dropped and
/// kills the child if it is still running at that point.
pub struct ProcessHandle {
    child: Child,
    command: String,
    slot: ProcessSlot,
}

impl ProcessHandle {
    pub fn spawn(spec: &CommandSpec, slot: &ProcessSlot) -> Result<Self, FlashError> {
        log::info!("Executing command: {spec}");
        let child = spec
            .to_command()
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(spec, e))?;

        let command = spec.to_string();
        slot.occupy(command.clone());

        Ok(Self {
            child,
            command,
            slot: slot.clone(),
        })
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// OS pid, or `None` once the child has been reaped.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    pub async fn wait(&mut self) -> Result<ExitStatus, FlashError> {
        Ok(self.child.wait().await?)
    }

    /// Wait for exit unless the token is cancelled first. The child keeps
    /// running on cancellation; call `shutdown` to stop it.
    pub async fn wait_or_cancel(&mut self, cancel: &CancelToken) -> Result<WaitOutcome, FlashError> {
        tokio::select! {
            status = self.child.wait() => Ok(WaitOutcome::Exited(status?)),
            _ = cancel.cancelled() => Ok(WaitOutcome::Cancelled),
        }
    }

    /// Ask the process to exit with SIGTERM. Returns false when it has already been reaped.
    pub fn terminate(&self) -> bool {
        let Some(pid) = self.child.id() else {
            return false;
        };
        // SAFETY: plain kill(2) on a pid we spawned and have not yet reaped.
        unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 }
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL.
    pub async fn shutdown(&mut self, grace: Duration) -> Result<ExitStatus, FlashError> {
        if self.terminate() {
            log::warn!("Sent SIGTERM to `{}`", self.command);
            match tokio::time::timeout(grace, self.child.wait()).await {
                Ok(status) => return Ok(status?),
                Err(_) => log::warn!(
                    "`{}` still running after {:?}, killing it",
                    self.command,
                    grace
                ),
            }
        } else if let Some(status) = self.child.try_wait()? {
            return Ok(status);
        }
        self.child.kill().await?;
        Ok(self.child.wait().await?)
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.slot.release();
    }
}

/// Whether the command was killed by SIGINT, as a terminal Ctrl-C would do.
#[cfg(unix)]
pub fn interrupted(status: &ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal() == Some(libc::SIGINT)
}

#[cfg(not(unix))]
pub fn interrupted(_status: &ExitStatus) -> bool {
    false
}

/// Read a stream to the end as lossy UTF-8.
pub async fn read_all<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf).await {
        log::debug!("Stopped reading command output: {e}");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Consume a copier's stderr, publishing the latest byte count it reports into
/// `counter`. Returns the tail of the stream for error reporting.
pub async fn read_progress_stream<R: AsyncRead + Unpin>(
    mut reader: R,
    counter: Arc<AtomicU64>,
) -> String {
    let mut tail = String::new();
    let mut pending = String::new();
    let mut buf = [0u8; 1024];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                log::debug!("Stopped reading progress stream: {e}");
                break;
            }
        };
        pending.push_str(&String::from_utf8_lossy(&buf[..n]));

        // dd redraws its progress line with '\r', final summaries end with '\n'.
        while let Some(pos) = pending.find(['\r', '\n']) {
            let line: String = pending.drain(..=pos).collect();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(bytes) = parse_copied_bytes(line) {
                counter.fetch_max(bytes, Ordering::Relaxed);
            } else {
                log::debug!("copier: {line}");
            }
            tail.push_str(line);
            tail.push('\n');
        }

        if tail.len() > STDERR_TAIL {
            let cut = tail.len() - STDERR_TAIL;
            let cut = (cut..tail.len())
                .find(|i| tail.is_char_boundary(*i))
                .unwrap_or(tail.len());
            tail.drain(..cut);
        }
    }

    if !pending.trim().is_empty() {
        tail.push_str(pending.trim());
    }
    tail
}

/// Parse the leading byte count of a dd progress or summary line, e.g.
/// `104857600 bytes (105 MB, 100 MiB) copied, 0.5 s, 210 MB/s`.
pub fn parse_copied_bytes(line: &str) -> Option<u64> {
    let mut parts = line.split_whitespace();
    let count = parts.next()?.parse::<u64>().ok()?;
    match parts.next() {
        Some("bytes") | Some("byte") => Some(count),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_display_quotes_spaces() {
        let spec = CommandSpec::new("dd")
            .arg("if=/tmp/my image.img")
            .arg("of=/dev/sdb2");
        assert_eq!(spec.to_string(), "dd 'if=/tmp/my image.img' of=/dev/sdb2");
    }

    #[test]
    fn test_parse_copied_bytes() {
        assert_eq!(
            parse_copied_bytes("104857600 bytes (105 MB, 100 MiB) copied, 0.5 s, 210 MB/s"),
            Some(104_857_600)
        );
        assert_eq!(
            parse_copied_bytes("104857600 bytes transferred in 0.512 secs (204800000 bytes/sec)"),
            Some(104_857_600)
        );
        assert_eq!(parse_copied_bytes("25+0 records in"), None);
        assert_eq!(parse_copied_bytes("dd: error writing"), None);
    }

    #[tokio::test]
    async fn test_progress_stream_tracks_latest_count() {
        let stderr: &[u8] = b"1048576 bytes (1.0 MB) copied, 1 s\r2097152 bytes (2.1 MB) copied, 2 s\r\
2+0 records in\n2+0 records out\n3145728 bytes (3.1 MB, 3 MiB) copied, 2.4 s, 1.3 MB/s\n";
        let counter = Arc::new(AtomicU64::new(0));
        let tail = read_progress_stream(stderr, counter.clone()).await;
        assert_eq!(counter.load(Ordering::Relaxed), 3_145_728);
        assert!(tail.contains("records out"));
    }

    #[tokio::test]
    async fn test_cancel_token_resolves_after_cancel() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("cancelled() should resolve")
            .unwrap();
        // Already-cancelled tokens resolve immediately.
        token.cancelled().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_capture_reports_exit_status() {
        let out = capture(&CommandSpec::new("sh").args(["-c", "echo hi; echo oops >&2; exit 3"]))
            .await
            .unwrap();
        assert_eq!(out.status.code(), Some(3));
        assert_eq!(out.stdout.trim(), "hi");
        assert!(out.combined().contains("oops"));
    }

    #[tokio::test]
    async fn test_missing_program_is_tool_missing() {
        let err = capture(&CommandSpec::new("sdflash-no-such-tool"))
            .await
            .unwrap_err();
        assert!(matches!(err, FlashError::ToolMissing(p) if p == "sdflash-no-such-tool"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_stops_process_and_frees_slot() {
        let slot = ProcessSlot::default();
        let mut handle = ProcessHandle::spawn(&CommandSpec::new("sleep").arg("30"), &slot).unwrap();
        assert_eq!(slot.current().as_deref(), Some("sleep 30"));

        let status = handle.shutdown(Duration::from_millis(500)).await.unwrap();
        assert!(!status.success());
        drop(handle);
        assert!(!slot.is_live());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_children_get_their_own_process_group() {
        let slot = ProcessSlot::default();
        let mut handle = ProcessHandle::spawn(&CommandSpec::new("sleep").arg("30"), &slot).unwrap();
        let pid = handle.id().unwrap() as libc::pid_t;

        // SAFETY: getpgid(2) only reads process state.
        let (child_group, own_group) = unsafe { (libc::getpgid(pid), libc::getpgid(0)) };
        assert_eq!(child_group, pid);
        assert_ne!(child_group, own_group);

        handle.shutdown(Duration::from_millis(500)).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_interrupted_detects_sigint() {
        let slot = ProcessSlot::default();
        let mut handle = ProcessHandle::spawn(&CommandSpec::new("sleep").arg("30"), &slot).unwrap();
        let pid = handle.id().unwrap() as libc::pid_t;
        // SAFETY: kill(2) on our own unreaped child.
        assert_eq!(unsafe { libc::kill(pid, libc::SIGINT) }, 0);
        let status = handle.wait().await.unwrap();
        assert!(interrupted(&status));

        let failed = capture(&CommandSpec::new("false")).await.unwrap();
        assert!(!interrupted(&failed.status));
    }
}
