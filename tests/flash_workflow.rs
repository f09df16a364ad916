//! End-to-end runs of the flash workflow against the fake disk manager.
//! Cards are files in a temp directory; parted/mkfs/umount are `true`/`false`
//! and the copy is a real `dd` unless a test swaps it out.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sdflash::config::FlashConfig;
use sdflash::core::disk_ops::DiskManager;
use sdflash::core::flasher::{AbortResponse, FlashEvent, FlashOutcome, FlashRequest, Flasher};
use sdflash::core::process::{CancelToken, CommandSpec};
use sdflash::core::validator::{CheckName, CheckStatus};
use sdflash::core::{FlashError, FlashState};
use sdflash::platform::fake::FakeDiskManager;
use tokio::sync::mpsc;

fn test_config() -> FlashConfig {
    FlashConfig {
        progress_interval_ms: 50,
        abort_grace_ms: 500,
        ..FlashConfig::default()
    }
}

fn write_firmware(dir: &Path, len: usize) -> PathBuf {
    let path = dir.join("fuzix.img");
    let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8 + 1).collect();
    std::fs::write(&path, bytes).unwrap();
    path
}

fn flasher_for(fake: &Arc<FakeDiskManager>) -> Arc<Flasher> {
    let disk_manager: Arc<dyn DiskManager> = fake.clone();
    Arc::new(Flasher::new(disk_manager, test_config()))
}

async fn run_flash(flasher: &Flasher, request: FlashRequest) -> (FlashOutcome, Vec<FlashEvent>) {
    run_flash_with(flasher, request, CancelToken::new()).await
}

async fn run_flash_with(
    flasher: &Flasher,
    request: FlashRequest,
    cancel: CancelToken,
) -> (FlashOutcome, Vec<FlashEvent>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let outcome = flasher.flash(request, tx, cancel).await;
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    (outcome, events)
}

fn states(events: &[FlashEvent]) -> Vec<FlashState> {
    events
        .iter()
        .filter_map(|e| match e {
            FlashEvent::State(s) => Some(*s),
            _ => None,
        })
        .collect()
}

fn messages(events: &[FlashEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|e| match e {
            FlashEvent::Message(m) => Some(m.as_str()),
            _ => None,
        })
        .collect()
}

async fn wait_for_command(flasher: &Flasher, needle: &str) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if flasher
                .running_command()
                .is_some_and(|command| command.contains(needle))
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("command should start");
}

#[tokio::test]
async fn flash_completes_and_verifies() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeDiskManager::new(dir.path()));
    let device = fake.create_device(0);
    let firmware = write_firmware(dir.path(), 300_000);
    let flasher = flasher_for(&fake);

    let (outcome, events) = run_flash(
        &flasher,
        FlashRequest {
            device: device.clone(),
            firmware,
            size_mb: None,
        },
    )
    .await;

    assert_eq!(outcome.state, FlashState::Completed, "{:?}", outcome.error);
    assert_eq!(outcome.exit_code(), 0);
    assert!(outcome.warnings.is_empty(), "{:?}", outcome.warnings);
    assert!(outcome.checksum.as_ref().unwrap().matches());
    assert!(matches!(
        outcome.checks.get(CheckName::Checksum),
        Some(CheckStatus::Passed(_))
    ));

    assert_eq!(
        states(&events),
        vec![
            FlashState::Validating,
            FlashState::Unmounting,
            FlashState::Partitioning,
            FlashState::Formatting,
            FlashState::Writing,
            FlashState::Verifying,
            FlashState::Completed,
        ]
    );

    let last_progress = events
        .iter()
        .rev()
        .find_map(|e| match e {
            FlashEvent::Progress(p) => Some(p.clone()),
            _ => None,
        })
        .expect("progress reported");
    assert_eq!(last_progress.bytes_written, 300_000);
    assert_eq!(last_progress.percent, 100.0);

    let issued = fake.issued();
    assert_eq!(issued[0], format!("true umount {device}"));
    assert_eq!(issued[1], format!("true parted -s {device} mklabel msdos"));
    assert_eq!(
        issued[2],
        format!("true parted -s {device} mkpart primary fat32 1MiB 65504MiB")
    );
    assert_eq!(issued[3], format!("true parted -s {device} mkpart primary 65504MiB 100%"));
    assert_eq!(issued[4], format!("true mkfs.fat -F 32 -v -I {device}p1"));
    assert!(issued[5].starts_with("dd if="));
    assert!(issued[5].contains(&format!("of={device}p2")));

    assert_eq!(flasher.state(), FlashState::Completed);
    assert!(flasher.running_command().is_none());
}

#[tokio::test]
async fn checksum_mismatch_is_a_warning() {
    let dir = tempfile::tempdir().unwrap();
    let target = format!("{}/mmc0p2", dir.path().display());
    let fake = Arc::new(FakeDiskManager::new(dir.path()).with_copy_command(
        CommandSpec::new("sh")
            .arg("-c")
            .arg(format!("head -c 100000 /dev/zero > '{target}'")),
    ));
    let device = fake.create_device(0);
    let firmware = write_firmware(dir.path(), 100_000);
    let flasher = flasher_for(&fake);

    let (outcome, events) = run_flash(
        &flasher,
        FlashRequest {
            device,
            firmware,
            size_mb: Some(65536),
        },
    )
    .await;

    assert_eq!(outcome.state, FlashState::Completed);
    assert_eq!(outcome.exit_code(), 0);
    assert!(outcome.warnings.iter().any(|w| w.contains("Checksum mismatch")));
    assert!(!outcome.checksum.as_ref().unwrap().matches());
    assert!(matches!(
        outcome.checks.get(CheckName::Checksum),
        Some(CheckStatus::Failed(FlashError::ChecksumMismatch { .. }))
    ));
    assert!(messages(&events).iter().any(|m| m.contains("Checksum mismatch")));
}

#[tokio::test]
async fn partition_failure_stops_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeDiskManager::new(dir.path()).failing_partition_step(1));
    let device = fake.create_device(0);
    let firmware = write_firmware(dir.path(), 4096);
    let flasher = flasher_for(&fake);

    let (outcome, events) = run_flash(
        &flasher,
        FlashRequest {
            device,
            firmware,
            size_mb: None,
        },
    )
    .await;

    assert_eq!(outcome.state, FlashState::Failed);
    assert_eq!(outcome.exit_code(), 1);
    match &outcome.error {
        Some(FlashError::ExternalCommandFailed { command, code, .. }) => {
            assert!(command.contains("mkpart primary fat32"), "{command}");
            assert_eq!(*code, Some(1));
        }
        other => panic!("expected ExternalCommandFailed, got {other:?}"),
    }

    let states = states(&events);
    assert!(!states.contains(&FlashState::Writing));
    assert_eq!(states.last(), Some(&FlashState::Failed));
    assert!(messages(&events).iter().any(|m| m.starts_with("Error:")));
    // Nothing after the failed step ran, so no copy was ever requested.
    assert!(!fake.issued().iter().any(|c| c.starts_with("dd ")));
}

#[tokio::test]
async fn invalid_device_short_circuits_validation() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeDiskManager::new(dir.path()));
    let device = fake.create_device(0);
    let firmware = write_firmware(dir.path(), 4096);
    let flasher = flasher_for(&fake);

    let (outcome, events) = run_flash(
        &flasher,
        FlashRequest {
            device: format!("{device}p1"),
            firmware,
            size_mb: Some(65536),
        },
    )
    .await;

    assert_eq!(outcome.exit_code(), 2);
    assert!(matches!(outcome.error, Some(FlashError::ValidationFailed(_))));
    assert_eq!(outcome.checks.entries().len(), 1);
    assert!(matches!(
        outcome.checks.get(CheckName::Device),
        Some(CheckStatus::Failed(FlashError::InvalidDeviceFormat { .. }))
    ));
    assert_eq!(states(&events), vec![FlashState::Validating, FlashState::Failed]);
    assert!(fake.issued().is_empty());
}

#[tokio::test]
async fn unmount_failure_is_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeDiskManager::new(dir.path()).failing_unmount());
    let device = fake.create_device(0);
    let firmware = write_firmware(dir.path(), 10_000);
    let flasher = flasher_for(&fake);

    let (outcome, _events) = run_flash(
        &flasher,
        FlashRequest {
            device,
            firmware,
            size_mb: None,
        },
    )
    .await;

    assert_eq!(outcome.state, FlashState::Completed, "{:?}", outcome.error);
    assert!(outcome.warnings.iter().any(|w| w.starts_with("Unmount failed")));
}

#[tokio::test]
async fn formatting_during_partitioning_skips_format_step() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeDiskManager::new(dir.path()).formatting_while_partitioning());
    let device = fake.create_device(0);
    let firmware = write_firmware(dir.path(), 10_000);
    let flasher = flasher_for(&fake);

    let (outcome, events) = run_flash(
        &flasher,
        FlashRequest {
            device,
            firmware,
            size_mb: None,
        },
    )
    .await;

    assert!(outcome.is_success());
    assert!(!fake.issued().iter().any(|c| c.contains("mkfs.fat")));
    assert!(messages(&events)
        .iter()
        .any(|m| m.contains("formatted while partitioning")));
}

#[tokio::test]
async fn cancelled_before_start_runs_nothing_destructive() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeDiskManager::new(dir.path()));
    let device = fake.create_device(0);
    let firmware = write_firmware(dir.path(), 4096);
    let flasher = flasher_for(&fake);

    let cancel = CancelToken::new();
    cancel.cancel();
    let (outcome, _events) = run_flash_with(
        &flasher,
        FlashRequest {
            device,
            firmware,
            size_mb: None,
        },
        cancel,
    )
    .await;

    assert_eq!(outcome.exit_code(), 130);
    assert!(outcome.was_aborted());
    assert!(!fake.issued().iter().any(|c| c.contains("parted")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abort_during_write_ends_as_user_aborted() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(
        FakeDiskManager::new(dir.path()).with_copy_command(CommandSpec::new("sleep").arg("30")),
    );
    let device = fake.create_device(0);
    let firmware = write_firmware(dir.path(), 4096);
    let flasher = flasher_for(&fake);

    let run = {
        let flasher = flasher.clone();
        tokio::spawn(async move {
            run_flash(
                &flasher,
                FlashRequest {
                    device,
                    firmware,
                    size_mb: None,
                },
            )
            .await
        })
    };

    wait_for_command(&flasher, "sleep 30").await;
    assert_eq!(flasher.state(), FlashState::Writing);
    assert_eq!(flasher.abort(), AbortResponse::Requested);

    let (outcome, events) = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("abort should end the run promptly")
        .unwrap();

    assert_eq!(outcome.state, FlashState::Failed);
    assert!(matches!(outcome.error, Some(FlashError::UserAborted)));
    assert_eq!(outcome.exit_code(), 130);

    let states = states(&events);
    assert!(states.contains(&FlashState::Aborting));
    assert!(!states.contains(&FlashState::Verifying));
    assert_eq!(states.last(), Some(&FlashState::Failed));
    assert!(messages(&events).contains(&"Operation aborted by user"));

    assert!(flasher.running_command().is_none());
    assert_eq!(flasher.abort(), AbortResponse::NothingRunning);
}

/// A SIGINT that reaches the copier before the abort (as a terminal Ctrl-C
/// would) still ends the run as a user abort.
#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interrupted_copy_then_abort_ends_as_user_aborted() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("copy.pid");
    let fake = Arc::new(FakeDiskManager::new(dir.path()).with_copy_command(
        CommandSpec::new("sh")
            .arg("-c")
            .arg(format!("echo $$ > {}; exec sleep 31", pid_file.display())),
    ));
    let device = fake.create_device(0);
    let firmware = write_firmware(dir.path(), 4096);
    let disk_manager: Arc<dyn DiskManager> = fake.clone();
    let flasher = Arc::new(Flasher::new(
        disk_manager,
        FlashConfig {
            abort_grace_ms: 5000,
            ..test_config()
        },
    ));

    let cancel = CancelToken::new();
    let run = {
        let flasher = flasher.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            run_flash_with(
                &flasher,
                FlashRequest {
                    device,
                    firmware,
                    size_mb: None,
                },
                cancel,
            )
            .await
        })
    };

    wait_for_command(&flasher, "sleep 31").await;
    let pid = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(pid) = std::fs::read_to_string(&pid_file)
                .ok()
                .and_then(|raw| raw.trim().parse::<libc::pid_t>().ok())
            {
                return pid;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("copier should record its pid");

    // SAFETY: kill(2) on the copier the workflow spawned.
    assert_eq!(unsafe { libc::kill(pid, libc::SIGINT) }, 0);
    if flasher.abort() == AbortResponse::NothingRunning {
        cancel.cancel();
    }

    let (outcome, events) = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("interrupt should end the run promptly")
        .unwrap();

    assert_eq!(outcome.state, FlashState::Failed);
    assert!(
        matches!(outcome.error, Some(FlashError::UserAborted)),
        "unexpected error: {:?}",
        outcome.error
    );
    assert_eq!(outcome.exit_code(), 130);
    assert!(states(&events).contains(&FlashState::Aborting));
    assert!(flasher.running_command().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_flash_is_rejected_while_one_runs() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(
        FakeDiskManager::new(dir.path()).with_copy_command(CommandSpec::new("sleep").arg("30")),
    );
    let device = fake.create_device(0);
    let firmware = write_firmware(dir.path(), 4096);
    let flasher = flasher_for(&fake);

    let request = FlashRequest {
        device,
        firmware,
        size_mb: None,
    };
    let first = {
        let flasher = flasher.clone();
        let request = request.clone();
        tokio::spawn(async move { run_flash(&flasher, request).await })
    };
    wait_for_command(&flasher, "sleep 30").await;

    let (second, events) = run_flash(&flasher, request.clone()).await;
    assert!(matches!(second.error, Some(FlashError::FlashInProgress)));
    assert_eq!(second.exit_code(), 2);
    assert!(events.is_empty());
    // The running flash is untouched.
    assert_eq!(flasher.state(), FlashState::Writing);

    flasher.abort();
    let (first, _) = tokio::time::timeout(Duration::from_secs(10), first)
        .await
        .unwrap()
        .unwrap();
    assert!(first.was_aborted());

    // Once released, the flasher accepts a new run again.
    let cancel = CancelToken::new();
    cancel.cancel();
    let (third, _) = run_flash_with(&flasher, request, cancel).await;
    assert!(!matches!(third.error, Some(FlashError::FlashInProgress)));
}
