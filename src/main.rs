use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tokio::sync::mpsc;

use sdflash::cli::{Cli, Command};
use sdflash::config::FlashConfig;
use sdflash::core::flasher::{AbortResponse, FlashEvent, FlashProgress, FlashRequest, Flasher};
use sdflash::core::process::CancelToken;
use sdflash::platform::get_disk_manager;
use sdflash::utils::bytes_to_human;
use sdflash::{logging, utils};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            log::error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = FlashConfig::load(cli.config.as_deref())?;
    let flasher = Arc::new(Flasher::new(get_disk_manager(), config));

    match cli.command {
        Command::List { all } => list(&flasher, all).await,
        Command::Validate {
            device,
            firmware,
            size_mb,
        } => validate(&flasher, &device, firmware, size_mb).await,
        Command::Flash {
            device,
            firmware,
            size_mb,
            yes_i_know,
        } => {
            let request = FlashRequest {
                device,
                firmware,
                size_mb,
            };
            flash(flasher, request, yes_i_know).await
        }
        Command::Verify { device, firmware } => verify(&flasher, &device, firmware).await,
    }
}

async fn list(flasher: &Flasher, all: bool) -> Result<ExitCode> {
    let devices = flasher.list_devices(all).await?;
    if devices.is_empty() {
        println!("No removable devices found.");
        return Ok(ExitCode::SUCCESS);
    }

    for device in devices {
        let mut notes = Vec::new();
        if device.is_protected {
            notes.push("system");
        }
        if !device.is_removable {
            notes.push("fixed");
        }
        let notes = if notes.is_empty() {
            String::new()
        } else {
            format!(" [{}]", notes.join(", "))
        };
        println!(
            "{:<16} {:>10}  {}{}",
            device.path,
            bytes_to_human(device.size_bytes),
            device.label,
            notes
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn validate(
    flasher: &Flasher,
    device: &str,
    firmware: PathBuf,
    size_mb: Option<u64>,
) -> Result<ExitCode> {
    let result = flasher.validate(device, size_mb, Some(&firmware)).await;
    println!("{result}");

    if result.required_passed() {
        println!("\nAll required checks passed for {device}");
        Ok(ExitCode::SUCCESS)
    } else {
        println!("\nValidation failed: {}", result.failure_summary());
        Ok(ExitCode::from(2))
    }
}

async fn verify(flasher: &Flasher, device: &str, firmware: PathBuf) -> Result<ExitCode> {
    match flasher.verify(device, &firmware).await {
        Ok(record) if record.matches() => {
            println!("✓ checksum: sha256 {}", record.source_digest);
            Ok(ExitCode::SUCCESS)
        }
        Ok(record) => {
            println!(
                "✗ checksum: image {} != card {} ({} of {} bytes read)",
                record.source_digest, record.target_digest, record.bytes_read, record.expected_bytes
            );
            Ok(ExitCode::FAILURE)
        }
        Err(e) => {
            println!("✗ checksum: {e} (hint: {})", e.hint());
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Re-run under sudo/doas/pkexec when not root. This re-executes the
/// process, so it has to happen before the confirmation prompt.
fn escalate() -> Result<()> {
    if utils::is_root() {
        return Ok(());
    }
    eprintln!("Partitioning and writing a card needs root; re-running with elevated privileges.");
    elevate::escalate_if_needed().map_err(|e| anyhow!("Failed to gain root privileges: {e}"))?;
    Ok(())
}

/// Ask the user to type the device path back before anything is erased.
fn confirm_destructive(device: &str) -> Result<bool> {
    print!(
        "This will ERASE everything on {device}.\nType the device path to continue: "
    );
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("Failed to read confirmation")?;
    Ok(answer.trim() == device)
}

async fn flash(flasher: Arc<Flasher>, request: FlashRequest, yes_i_know: bool) -> Result<ExitCode> {
    escalate()?;

    if !yes_i_know && !confirm_destructive(&request.device)? {
        println!("Confirmation did not match; nothing was changed.");
        return Ok(ExitCode::from(130));
    }

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        let mut printer = EventPrinter::default();
        while let Some(event) = events_rx.recv().await {
            printer.print(event);
        }
        printer.finish();
    });

    let cancel = CancelToken::new();
    let interrupt = {
        let flasher = flasher.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                match flasher.abort() {
                    AbortResponse::Requested => eprintln!("\nAbort requested, stopping..."),
                    AbortResponse::NothingRunning => {
                        cancel.cancel();
                        eprintln!("\nAbort requested, stopping before the next step...");
                    }
                }
            }
        })
    };

    let outcome = flasher.flash(request, events_tx, cancel).await;
    interrupt.abort();
    if let Err(e) = printer.await {
        log::debug!("Event printer ended abnormally: {e}");
    }

    if !outcome.warnings.is_empty() {
        eprintln!("\nWarnings:");
        for warning in &outcome.warnings {
            eprintln!("  - {warning}");
        }
    }
    if let Some(record) = &outcome.checksum {
        eprintln!("Firmware sha256: {}", record.source_digest);
    }

    Ok(ExitCode::from(outcome.exit_code() as u8))
}

/// Prints flash events to stderr, redrawing a single progress line in place.
#[derive(Default)]
struct EventPrinter {
    mid_line: bool,
}

impl EventPrinter {
    fn print(&mut self, event: FlashEvent) {
        match event {
            FlashEvent::Progress(progress) => self.progress(&progress),
            FlashEvent::State(state) => {
                self.finish();
                eprintln!("==> {state}");
            }
            FlashEvent::Message(message) => {
                self.finish();
                eprintln!("{message}");
            }
        }
    }

    fn progress(&mut self, progress: &FlashProgress) {
        eprint!(
            "\r{:>5.1}%  {} / {}  {:.2} MB/s   ",
            progress.percent,
            bytes_to_human(progress.bytes_written),
            bytes_to_human(progress.total_bytes),
            progress.speed_mbps
        );
        let _ = io::stderr().flush();
        self.mid_line = true;
    }

    fn finish(&mut self) {
        if self.mid_line {
            eprintln!();
            self.mid_line = false;
        }
    }
}
