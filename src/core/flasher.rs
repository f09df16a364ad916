use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::checksum::ChecksumRecord;
use super::disk_ops::DiskManager;
use super::process::{
    CancelToken, CommandOutput, CommandSpec, ProcessHandle, ProcessSlot, WaitOutcome, interrupted,
    read_all, read_progress_stream,
};
use super::validator::{CheckName, CheckStatus, ValidationResult, Validator};
use super::{Device, FileSystemType, FlashError, FlashState, MIB};
use crate::config::FlashConfig;

/// Progress samples queued between the poller and the workflow task.
const PROGRESS_CHANNEL_BOUND: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct FlashProgress {
    pub bytes_written: u64,
    pub total_bytes: u64,
    pub speed_mbps: f64,
    pub percent: f64,
}

impl FlashProgress {
    pub fn new(bytes_written: u64, total_bytes: u64, elapsed: Duration) -> Self {
        let elapsed_secs = elapsed.as_secs_f64();
        let speed_mbps = if elapsed_secs > 0.0 {
            (bytes_written as f64 / 1_000_000.0) / elapsed_secs
        } else {
            0.0
        };
        let percent = if total_bytes == 0 {
            100.0
        } else {
            (bytes_written as f64 / total_bytes as f64) * 100.0
        };

        Self {
            bytes_written,
            total_bytes,
            speed_mbps,
            percent,
        }
    }
}

/// Everything a flash run reports to its caller, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum FlashEvent {
    State(FlashState),
    Message(String),
    Progress(FlashProgress),
}

#[derive(Debug, Clone)]
pub struct FlashRequest {
    pub device: String,
    pub firmware: PathBuf,
    /// Card size in MiB; queried from the device when absent
    pub size_mb: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortResponse {
    /// Cancellation was signalled to the live command
    Requested,
    NothingRunning,
}

/// Final report of one flash run.
#[derive(Debug)]
pub struct FlashOutcome {
    pub state: FlashState,
    pub checks: ValidationResult,
    pub checksum: Option<ChecksumRecord>,
    /// Non-blocking problems: advisory check failures, failed unmounts, checksum trouble
    pub warnings: Vec<String>,
    pub error: Option<FlashError>,
}

impl FlashOutcome {
    fn new() -> Self {
        Self {
            state: FlashState::Idle,
            checks: ValidationResult::default(),
            checksum: None,
            warnings: Vec::new(),
            error: None,
        }
    }

    fn rejected(error: FlashError) -> Self {
        Self {
            state: FlashState::Failed,
            error: Some(error),
            ..Self::new()
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == FlashState::Completed
    }

    pub fn was_aborted(&self) -> bool {
        self.error.as_ref().is_some_and(FlashError::is_user_aborted)
    }

    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> i32 {
        match (&self.state, &self.error) {
            (FlashState::Completed, _) => 0,
            (_, Some(FlashError::UserAborted)) => 130,
            (_, Some(FlashError::ValidationFailed(_) | FlashError::FlashInProgress)) => 2,
            _ => 1,
        }
    }
}

/// Drives one card through validate, unmount, partition, format, write and
/// verify. At most one run is in flight per `Flasher`.
pub struct Flasher {
    disk_manager: Arc<dyn DiskManager>,
    validator: Validator,
    config: FlashConfig,
    state: Mutex<FlashState>,
    in_flight: AtomicBool,
    slot: ProcessSlot,
    active_cancel: Mutex<Option<CancelToken>>,
}

/// Releases the run lock when a run ends, however it ends.
struct RunGuard<'a> {
    flasher: &'a Flasher,
    events: UnboundedSender<FlashEvent>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.flasher.state().is_terminal() {
            // The run future was dropped mid-way; kill_on_drop took care of the child.
            self.flasher.set_state(FlashState::Failed, &self.events);
        }
        *lock(&self.flasher.active_cancel) = None;
        self.flasher.in_flight.store(false, Ordering::Release);
        log::debug!("Flash run released");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn emit(events: &UnboundedSender<FlashEvent>, message: impl Into<String>) {
    let message = message.into();
    log::info!("{message}");
    let _ = events.send(FlashEvent::Message(message));
}

async fn join_output(task: Option<JoinHandle<String>>) -> String {
    match task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    }
}

/// Bytes on the target so far: the copier's own count, or the file length
/// when the target is a regular file.
async fn sampled_bytes(counter: &AtomicU64, target: &str) -> u64 {
    let reported = counter.load(Ordering::Relaxed);
    let on_disk = tokio::fs::metadata(target)
        .await
        .ok()
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .unwrap_or(0);
    reported.max(on_disk)
}

/// Samples write progress every `interval` until `stop` flips.
async fn poll_progress(
    counter: Arc<AtomicU64>,
    target: String,
    total: u64,
    interval: Duration,
    tx: mpsc::Sender<FlashProgress>,
    mut stop: watch::Receiver<bool>,
) {
    let started = Instant::now();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {
                let bytes = sampled_bytes(&counter, &target).await.min(total);
                // A full channel means the consumer is busy; this sample can go.
                if let Err(mpsc::error::TrySendError::Closed(_)) =
                    tx.try_send(FlashProgress::new(bytes, total, started.elapsed()))
                {
                    break;
                }
            }
        }
    }
}

impl Flasher {
    pub fn new(disk_manager: Arc<dyn DiskManager>, config: FlashConfig) -> Self {
        Self {
            validator: Validator::new(disk_manager.clone(), config.clone()),
            disk_manager,
            config,
            state: Mutex::new(FlashState::Idle),
            in_flight: AtomicBool::new(false),
            slot: ProcessSlot::default(),
            active_cancel: Mutex::new(None),
        }
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    pub fn state(&self) -> FlashState {
        *lock(&self.state)
    }

    /// Description of the external command currently running, if any.
    pub fn running_command(&self) -> Option<String> {
        self.slot.current()
    }

    fn set_state(&self, state: FlashState, events: &UnboundedSender<FlashEvent>) {
        let previous = std::mem::replace(&mut *lock(&self.state), state);
        if previous != state {
            log::info!("Flash state: {previous} -> {state}");
        }
        let _ = events.send(FlashEvent::State(state));
    }

    /// Devices on this host; with `include_all` false only removable, non-system ones.
    pub async fn list_devices(&self, include_all: bool) -> Result<Vec<Device>, FlashError> {
        let mut devices = self.disk_manager.list_devices().await?;
        for device in &mut devices {
            if !device.is_protected && self.validator.is_system_device(&device.path).await {
                device.is_protected = true;
            }
        }
        if !include_all {
            devices.retain(Device::is_candidate);
        }
        Ok(devices)
    }

    /// Card size in MiB: the explicit value, else what the device reports.
    /// Zero when neither is known, which fails the partition plan check.
    pub async fn resolve_size_mb(&self, device: &str, requested: Option<u64>) -> u64 {
        if let Some(size) = requested {
            return size;
        }
        match self.disk_manager.device_size_bytes(device).await {
            Ok(bytes) => bytes / MIB,
            Err(e) => {
                log::debug!("Could not read the size of {device}: {e}");
                0
            }
        }
    }

    /// Run the full check list without touching the card.
    pub async fn validate(
        &self,
        device: &str,
        size_mb: Option<u64>,
        firmware: Option<&Path>,
    ) -> ValidationResult {
        let size_mb = self.resolve_size_mb(device, size_mb).await;
        self.validator.run_all_checks(device, size_mb, firmware).await
    }

    /// Checksum the firmware against what is on the card's firmware partition.
    pub async fn verify(&self, device: &str, firmware: &Path) -> Result<ChecksumRecord, FlashError> {
        self.validator.verify_checksum(firmware, device, 2).await
    }

    /// Ask the live command to stop. A no-op when nothing is running.
    pub fn abort(&self) -> AbortResponse {
        if !self.slot.is_live() || !self.state().is_abortable() {
            log::info!("Abort requested but no command is running");
            return AbortResponse::NothingRunning;
        }
        match lock(&self.active_cancel).as_ref() {
            Some(token) => {
                log::warn!("Abort requested");
                token.cancel();
                AbortResponse::Requested
            }
            None => AbortResponse::NothingRunning,
        }
    }

    /// Flash `request.firmware` onto `request.device`. Events stream to
    /// `events` as the run progresses; `cancel` (or `abort`) stops it.
    pub async fn flash(
        &self,
        request: FlashRequest,
        events: UnboundedSender<FlashEvent>,
        cancel: CancelToken,
    ) -> FlashOutcome {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::warn!("Flash of {} rejected: another flash is in progress", request.device);
            return FlashOutcome::rejected(FlashError::FlashInProgress);
        }
        let _guard = RunGuard {
            flasher: self,
            events: events.clone(),
        };
        *lock(&self.active_cancel) = Some(cancel.clone());

        let mut outcome = FlashOutcome::new();
        match self.run(&request, &events, &cancel, &mut outcome).await {
            Ok(()) => {
                emit(&events, format!("Flash of {} completed", request.device));
                self.set_state(FlashState::Completed, &events);
                outcome.state = FlashState::Completed;
            }
            Err(e) => {
                if e.is_user_aborted() {
                    emit(&events, "Operation aborted by user");
                } else {
                    log::error!("Flash failed: {e}");
                    emit(&events, format!("Error: {e}\nHint: {}", e.hint()));
                }
                self.set_state(FlashState::Failed, &events);
                outcome.state = FlashState::Failed;
                outcome.error = Some(e);
            }
        }
        outcome
    }

    async fn run(
        &self,
        request: &FlashRequest,
        events: &UnboundedSender<FlashEvent>,
        cancel: &CancelToken,
        outcome: &mut FlashOutcome,
    ) -> Result<(), FlashError> {
        let device = request.device.as_str();

        self.set_state(FlashState::Validating, events);
        emit(events, format!("Validating {device}..."));
        let size_mb = self.resolve_size_mb(device, request.size_mb).await;
        outcome.checks = self
            .validator
            .run_all_checks(device, size_mb, Some(&request.firmware))
            .await;
        for entry in outcome.checks.entries() {
            let _ = events.send(FlashEvent::Message(entry.to_string()));
        }
        if !outcome.checks.required_passed() {
            return Err(FlashError::ValidationFailed(outcome.checks.failure_summary()));
        }
        for entry in outcome.checks.advisory_failures() {
            outcome.warnings.push(entry.to_string());
        }
        let plan = self.validator.compute_partition_plan(device, size_mb)?;

        self.set_state(FlashState::Unmounting, events);
        self.unmount(device, events, cancel, outcome).await?;

        self.set_state(FlashState::Partitioning, events);
        emit(events, format!("Partitioning {device}..."));
        for spec in self.disk_manager.partition_commands(&plan) {
            self.run_step(&spec, events, cancel).await?;
        }
        match self.validator.validate_partition_alignment(device).await {
            Ok(message) => {
                emit(events, message.clone());
                outcome.checks.replace(CheckName::Alignment, CheckStatus::Passed(message));
            }
            Err(e) => {
                let warning = format!("Partition alignment check after partitioning failed: {e}");
                log::warn!("{warning}");
                let _ = events.send(FlashEvent::Message(warning.clone()));
                outcome.warnings.push(warning);
                outcome.checks.replace(CheckName::Alignment, CheckStatus::Failed(e));
            }
        }

        self.set_state(FlashState::Formatting, events);
        let fat_partition = self.validator.partition_device_name(device, 1);
        if self.disk_manager.formats_during_partitioning() {
            emit(events, format!("{fat_partition} was formatted while partitioning"));
        } else if let Some(spec) = self
            .disk_manager
            .format_command(&fat_partition, FileSystemType::Fat32)
        {
            emit(events, format!("Formatting {fat_partition} as FAT32..."));
            self.run_step(&spec, events, cancel).await?;
        }

        self.set_state(FlashState::Writing, events);
        let target = self.validator.partition_device_name(device, 2);
        self.write_firmware(&request.firmware, &target, events, cancel)
            .await?;

        self.set_state(FlashState::Verifying, events);
        emit(events, "Verifying checksum...");
        match self
            .validator
            .verify_checksum(&request.firmware, device, 2)
            .await
        {
            Ok(record) => {
                match record.mismatch_error() {
                    None => {
                        let message = format!("Checksum verified: sha256 {}", record.source_digest);
                        emit(events, message.clone());
                        outcome.checks.replace(CheckName::Checksum, CheckStatus::Passed(message));
                    }
                    Some(e) => {
                        let warning = format!(
                            "Checksum mismatch: {e} ({} of {} bytes read back)",
                            record.bytes_read, record.expected_bytes
                        );
                        log::warn!("{warning}");
                        let _ = events.send(FlashEvent::Message(warning.clone()));
                        outcome.warnings.push(warning);
                        outcome.checks.replace(CheckName::Checksum, CheckStatus::Failed(e));
                    }
                }
                outcome.checksum = Some(record);
            }
            Err(e) => {
                let warning = format!("Checksum verification failed: {e}");
                log::warn!("{warning}");
                let _ = events.send(FlashEvent::Message(warning.clone()));
                outcome.warnings.push(warning);
                outcome.checks.replace(CheckName::Checksum, CheckStatus::Failed(e));
            }
        }

        Ok(())
    }

    fn check_cancelled(&self, cancel: &CancelToken) -> Result<(), FlashError> {
        if cancel.is_cancelled() {
            return Err(FlashError::UserAborted);
        }
        Ok(())
    }

    /// Unmount failures are reported and skipped; partitioning will fail
    /// loudly if something is still mounted.
    async fn unmount(
        &self,
        device: &str,
        events: &UnboundedSender<FlashEvent>,
        cancel: &CancelToken,
        outcome: &mut FlashOutcome,
    ) -> Result<(), FlashError> {
        emit(events, format!("Unmounting {device}..."));
        let commands = match self.disk_manager.unmount_commands(device).await {
            Ok(commands) => commands,
            Err(e) => {
                outcome.warnings.push(format!("Could not list mounts of {device}: {e}"));
                log::warn!("Could not list mounts of {device}: {e}");
                return Ok(());
            }
        };
        if commands.is_empty() {
            emit(events, format!("Nothing mounted from {device}"));
        }

        for spec in commands {
            match self.run_step(&spec, events, cancel).await {
                Ok(_) => {}
                Err(FlashError::UserAborted) => return Err(FlashError::UserAborted),
                Err(e) => {
                    let warning = format!("Unmount failed, continuing: {e}");
                    log::warn!("{warning}");
                    let _ = events.send(FlashEvent::Message(warning.clone()));
                    outcome.warnings.push(warning);
                }
            }
        }
        Ok(())
    }

    /// Run one external command to completion, or stop it on cancellation.
    async fn run_step(
        &self,
        spec: &CommandSpec,
        events: &UnboundedSender<FlashEvent>,
        cancel: &CancelToken,
    ) -> Result<CommandOutput, FlashError> {
        self.check_cancelled(cancel)?;
        let _ = events.send(FlashEvent::Message(format!("Running: {spec}")));

        let mut handle = ProcessHandle::spawn(spec, &self.slot)?;
        let stdout = handle.take_stdout().map(|s| tokio::spawn(read_all(s)));
        let stderr = handle.take_stderr().map(|s| tokio::spawn(read_all(s)));

        let status = match handle.wait_or_cancel(cancel).await? {
            WaitOutcome::Exited(status) => status,
            WaitOutcome::Cancelled => return Err(self.stop_process(&mut handle, events).await),
        };
        drop(handle);

        let stdout = join_output(stdout).await;
        let stderr = join_output(stderr).await;
        if !stdout.trim().is_empty() {
            log::debug!("Command output: {}", stdout.trim());
        }
        if !status.success() {
            if self.exit_was_abort(&status, cancel).await {
                return Err(self.aborted(spec, events));
            }
            log::error!("Command `{spec}` failed with {status}");
            return Err(FlashError::ExternalCommandFailed {
                command: spec.to_string(),
                code: status.code(),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(CommandOutput {
            status,
            stdout,
            stderr,
        })
    }

    /// Terminate the live command after a cancellation; the run then ends as aborted.
    async fn stop_process(
        &self,
        handle: &mut ProcessHandle,
        events: &UnboundedSender<FlashEvent>,
    ) -> FlashError {
        self.set_state(FlashState::Aborting, events);
        emit(events, format!("Stopping `{}`...", handle.command()));
        match handle.shutdown(self.config.abort_grace()).await {
            Ok(status) => log::info!("`{}` stopped ({status})", handle.command()),
            Err(e) => log::warn!("Failed to stop `{}`: {e}", handle.command()),
        }
        FlashError::UserAborted
    }

    /// A failed exit is an abort when the run is already cancelled, or when
    /// a SIGINT killed the command and cancellation follows within the grace period.
    async fn exit_was_abort(&self, status: &ExitStatus, cancel: &CancelToken) -> bool {
        if cancel.is_cancelled() {
            return true;
        }
        if !interrupted(status) {
            return false;
        }
        log::debug!("Command interrupted ({status}), waiting for cancellation");
        tokio::time::timeout(self.config.abort_grace(), cancel.cancelled())
            .await
            .is_ok()
    }

    fn aborted(&self, spec: &CommandSpec, events: &UnboundedSender<FlashEvent>) -> FlashError {
        self.set_state(FlashState::Aborting, events);
        log::warn!("`{spec}` was interrupted");
        FlashError::UserAborted
    }

    /// Raw copy of the firmware onto `target`, streaming progress samples.
    async fn write_firmware(
        &self,
        source: &Path,
        target: &str,
        events: &UnboundedSender<FlashEvent>,
        cancel: &CancelToken,
    ) -> Result<u64, FlashError> {
        self.check_cancelled(cancel)?;
        let total = tokio::fs::metadata(source)
            .await
            .map_err(|_| FlashError::SourceFileMissing(source.to_path_buf()))?
            .len();

        let spec = self
            .disk_manager
            .copy_command(source, target, self.config.block_size_bytes);
        emit(
            events,
            format!("Flashing {} ({} bytes) to {target}...", source.display(), total),
        );
        let _ = events.send(FlashEvent::Message(format!("Running: {spec}")));

        let mut handle = ProcessHandle::spawn(&spec, &self.slot)?;
        let counter = Arc::new(AtomicU64::new(0));
        let stdout = handle.take_stdout().map(|s| tokio::spawn(read_all(s)));
        let stderr = handle
            .take_stderr()
            .map(|s| tokio::spawn(read_progress_stream(s, counter.clone())));

        let (progress_tx, mut progress_rx) = mpsc::channel(PROGRESS_CHANNEL_BOUND);
        let (stop_tx, stop_rx) = watch::channel(false);
        let poller = tokio::spawn(poll_progress(
            counter.clone(),
            target.to_string(),
            total,
            self.config.progress_interval(),
            progress_tx,
            stop_rx,
        ));

        let started = Instant::now();
        let waited = loop {
            tokio::select! {
                status = handle.wait() => break status.map(WaitOutcome::Exited),
                _ = cancel.cancelled() => break Ok(WaitOutcome::Cancelled),
                Some(progress) = progress_rx.recv() => {
                    let _ = events.send(FlashEvent::Progress(progress));
                }
            }
        };
        stop_tx.send_replace(true);
        if let Err(e) = poller.await {
            log::debug!("Progress poller ended abnormally: {e}");
        }

        let status = match waited? {
            WaitOutcome::Exited(status) => status,
            WaitOutcome::Cancelled => return Err(self.stop_process(&mut handle, events).await),
        };
        drop(handle);

        let _ = join_output(stdout).await;
        let stderr_tail = join_output(stderr).await;
        if !status.success() {
            if self.exit_was_abort(&status, cancel).await {
                return Err(self.aborted(&spec, events));
            }
            log::error!("Copy `{spec}` failed with {status}");
            return Err(FlashError::ExternalCommandFailed {
                command: spec.to_string(),
                code: status.code(),
                stderr: stderr_tail.trim().to_string(),
            });
        }

        let _ = events.send(FlashEvent::Progress(FlashProgress::new(
            total,
            total,
            started.elapsed(),
        )));
        emit(
            events,
            format!("Wrote {total} bytes to {target} in {:.1}s", started.elapsed().as_secs_f64()),
        );
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::fake::FakeDiskManager;

    #[test]
    fn test_progress_math() {
        let progress = FlashProgress::new(5_000_000, 10_000_000, Duration::from_secs(2));
        assert_eq!(progress.percent, 50.0);
        assert_eq!(progress.speed_mbps, 2.5);

        let empty = FlashProgress::new(0, 0, Duration::ZERO);
        assert_eq!(empty.percent, 100.0);
        assert_eq!(empty.speed_mbps, 0.0);
    }

    #[test]
    fn test_exit_codes() {
        let mut outcome = FlashOutcome::new();
        outcome.state = FlashState::Completed;
        assert_eq!(outcome.exit_code(), 0);

        assert_eq!(FlashOutcome::rejected(FlashError::UserAborted).exit_code(), 130);
        assert_eq!(
            FlashOutcome::rejected(FlashError::ValidationFailed("device".into())).exit_code(),
            2
        );
        assert_eq!(FlashOutcome::rejected(FlashError::FlashInProgress).exit_code(), 2);
        assert_eq!(
            FlashOutcome::rejected(FlashError::DeviceDisconnected("x".into())).exit_code(),
            1
        );
        assert!(FlashOutcome::rejected(FlashError::UserAborted).was_aborted());
    }

    #[test]
    fn test_abort_with_nothing_running() {
        let dir = tempfile::tempdir().unwrap();
        let flasher = Flasher::new(
            Arc::new(FakeDiskManager::new(dir.path())),
            FlashConfig::default(),
        );
        assert_eq!(flasher.abort(), AbortResponse::NothingRunning);
        assert_eq!(flasher.state(), FlashState::Idle);
    }

    #[tokio::test]
    async fn test_poller_stops_on_signal() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("p2");
        std::fs::write(&target, vec![0u8; 1000]).unwrap();

        let counter = Arc::new(AtomicU64::new(400));
        let (tx, mut rx) = mpsc::channel(PROGRESS_CHANNEL_BOUND);
        let (stop_tx, stop_rx) = watch::channel(false);
        let poller = tokio::spawn(poll_progress(
            counter,
            target.to_string_lossy().into_owned(),
            4000,
            Duration::from_millis(10),
            tx,
            stop_rx,
        ));

        let sample = rx.recv().await.unwrap();
        // File length wins over the smaller copier count.
        assert_eq!(sample.bytes_written, 1000);
        assert_eq!(sample.percent, 25.0);

        stop_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), poller)
            .await
            .expect("poller should stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_list_devices_filters_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeDiskManager::new(dir.path());
        let card = fake.create_device(0);
        let boot = fake.create_device(1);
        let config = FlashConfig {
            extra_boot_disks: vec![boot.clone()],
            ..FlashConfig::default()
        };
        let flasher = Flasher::new(Arc::new(fake), config);

        let candidates = flasher.list_devices(false).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].path, card);

        let all = flasher.list_devices(true).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|d| d.path == boot && d.is_protected));
    }

    #[tokio::test]
    async fn test_resolve_size() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeDiskManager::new(dir.path()).with_size_bytes(4096 * MIB);
        let card = fake.create_device(0);
        let missing = fake.device_path(9);
        let flasher = Flasher::new(Arc::new(fake), FlashConfig::default());

        assert_eq!(flasher.resolve_size_mb(&card, Some(100)).await, 100);
        assert_eq!(flasher.resolve_size_mb(&card, None).await, 4096);
        assert_eq!(flasher.resolve_size_mb(&missing, None).await, 0);
    }
}
