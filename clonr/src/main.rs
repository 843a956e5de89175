use anyhow::{Context, Result, anyhow, bail};
use clap::{ArgAction, Parser, Subcommand};
use clonr_core::active::{ActiveDisks, resolve_active_disks};
use clonr_core::clone::{
    CancelToken, CloneJob, CloneMethod, CloneOrchestrator, CloneSettings, DEFAULT_BLOCK_SIZE,
    JobHandle, JobReport, JobState,
};
use clonr_core::gate;
use clonr_core::inventory::{DiskSummary, summarize_disks};
use clonr_core::platform::LinuxProbe;
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::stdout;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::io::IsTerminal;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

const REDRAW_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "clonr")]
#[command(about = "A safe, interactive disk cloning tool", version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug). RUST_LOG overrides this.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Clone one disk onto another interactively
    Clone {
        /// Disk to copy from (prompted for if omitted)
        source: Option<PathBuf>,

        /// Disk to overwrite (prompted for if omitted)
        destination: Option<PathBuf>,

        /// Copy only used sectors (currently performs a full copy)
        #[arg(long)]
        smart: bool,

        /// Skip byte-for-byte verification after the copy
        #[arg(short = 'n', long = "no-verify")]
        no_verify: bool,

        /// Copy block size in bytes
        #[arg(
            long,
            env = "CLONR_BLOCK_SIZE",
            default_value_t = DEFAULT_BLOCK_SIZE,
            value_parser = clap::value_parser!(u64).range(512..)
        )]
        block_size: u64,

        /// How often the running copy is polled, in milliseconds
        #[arg(
            long,
            env = "CLONR_POLL_INTERVAL_MS",
            default_value_t = 1000,
            value_parser = clap::value_parser!(u64).range(10..)
        )]
        poll_interval_ms: u64,
    },
    /// List disks and whether the running system uses them
    List,
    /// Show the disks backing the running system
    Active,
}

/// Routes log output to stderr, filtered by `RUST_LOG` or the `-v` count.
fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .try_init()
        .ok();
}

/// Turns off `ECHOCTL` so Ctrl+C does not print `^C` over the progress bar.
/// The saved terminal settings are restored on drop.
struct EchoCtlGuard {
    #[cfg(unix)]
    saved: Option<Termios>,
}

impl EchoCtlGuard {
    fn install() -> Self {
        #[cfg(unix)]
        {
            let fd = stdout().as_raw_fd();
            let saved = stdout()
                .is_terminal()
                .then(|| Termios::from_fd(fd).ok())
                .flatten()
                .and_then(|original| {
                    let mut quiet = original;
                    quiet.c_lflag &= !ECHOCTL;
                    tcsetattr(fd, TCSANOW, &quiet).ok().map(|_| original)
                });
            Self { saved }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for EchoCtlGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref saved) = self.saved {
            tcsetattr(stdout().as_raw_fd(), TCSANOW, saved).ok();
        }
    }
}

#[cfg(unix)]
fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_root() -> bool {
    false
}

/// Presents an interactive menu for the user to select a disk.
fn select_disk(disks: &[&DiskSummary], prompt: &str) -> Result<PathBuf> {
    if disks.is_empty() {
        bail!("No disks available that the running system does not use.");
    }

    let items: Vec<String> = disks
        .iter()
        .map(|d| format!("{}  [{}]", d.device, d.identity))
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(disks[selection].device.path.clone())
}

fn confirm(prompt: &str) -> Result<bool> {
    Ok(Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?)
}

fn describe(path: &Path, disks: &[DiskSummary]) -> String {
    match disks.iter().find(|d| d.device.path == path) {
        Some(d) => format!(
            "{} ({:.1} GB, {}, {})",
            path.display(),
            d.device.size_gb(),
            d.device.model,
            if d.solid_state { "SSD" } else { "HDD" }
        ),
        None => path.display().to_string(),
    }
}

fn stage_bar(prefix: &'static str, color: &str) -> Result<ProgressBar> {
    let bar = ProgressBar::new(100);
    bar.set_prefix(prefix);
    bar.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.{color}/black}}] {{pos:>3}}%"
            ))?
            .progress_chars("■ "),
    );
    Ok(bar)
}

/// Mirrors the job's stage and progress onto progress bars until it ends.
fn watch(handle: &JobHandle) -> Result<()> {
    let mut shown = JobState::Idle;
    let mut bar: Option<ProgressBar> = None;

    while !handle.is_finished() {
        let state = handle.state();
        if state != shown {
            match state {
                JobState::Copying => bar = Some(stage_bar("Copying", "green")?),
                JobState::Verifying => {
                    if let Some(done) = bar.take() {
                        done.finish_with_message("Copy complete.");
                    }
                    bar = Some(stage_bar("Verifying", "magenta")?);
                }
                _ => {}
            }
            shown = state;
        }
        if let Some(ref bar) = bar {
            bar.set_position(u64::from(handle.progress()));
        }
        thread::sleep(REDRAW_INTERVAL);
    }

    if let Some(bar) = bar {
        match handle.state() {
            JobState::Completed => {
                bar.set_position(100);
                bar.finish();
            }
            _ => bar.abandon(),
        }
    }
    Ok(())
}

fn finish(report: JobReport) -> Result<()> {
    match report.state {
        JobState::Completed if report.is_mismatch() => {
            println!(
                "\n{} {} was copied to {}, but verification found differences.",
                style("WARNING:").yellow().bold(),
                style(report.source.display()).cyan(),
                style(report.destination.display()).cyan(),
            );
            Ok(())
        }
        JobState::Completed => {
            println!(
                "\n✨ Successfully cloned {} to {}.",
                style(report.source.display()).cyan(),
                style(report.destination.display()).cyan()
            );
            Ok(())
        }
        JobState::Cancelled => {
            println!(
                "\nClone cancelled. {} is incomplete.",
                style(report.destination.display()).cyan()
            );
            Err(clonr_core::Error::Cancelled.into())
        }
        _ => Err(match report.error {
            Some(err) => anyhow::Error::from(err).context("Clone failed"),
            None => anyhow!("Clone failed"),
        }),
    }
}

fn resolve_active(probe: &LinuxProbe) -> Result<ActiveDisks> {
    resolve_active_disks(probe).context("Could not determine which disks the running system uses")
}

fn run_clone(
    token: CancelToken,
    source: Option<PathBuf>,
    destination: Option<PathBuf>,
    smart: bool,
    no_verify: bool,
    block_size: u64,
    poll_interval_ms: u64,
) -> Result<()> {
    if !is_root() {
        bail!("clonr must run as root to read and write block devices.");
    }

    let probe = LinuxProbe::new();
    let active = resolve_active(&probe)?;
    println!("Disks in use by the running system: {}", style(&active).yellow());

    let disks = summarize_disks(&probe, Some(&active))?;
    let candidates: Vec<&DiskSummary> = disks.iter().filter(|d| d.active == Some(false)).collect();

    let source = match source {
        Some(path) => path,
        None => select_disk(&candidates, "Select the SOURCE disk to copy from")?,
    };
    let destination = match destination {
        Some(path) => path,
        None => {
            let remaining: Vec<&DiskSummary> = candidates
                .iter()
                .copied()
                .filter(|d| d.device.path != source)
                .collect();
            select_disk(&remaining, "Select the DESTINATION disk to overwrite")?
        }
    };

    gate::validate_paths(&source, &destination, &active)?;

    println!();
    println!(
        "{} This will erase all data on the destination.",
        style("WARNING:").red().bold(),
    );
    println!("  Source:      {}", style(describe(&source, &disks)).cyan());
    println!("  Destination: {}", style(describe(&destination, &disks)).cyan());
    println!();

    if !confirm("Are you sure you want to proceed?")? {
        println!("Clone cancelled.");
        return Ok(());
    }
    let last_chance = format!(
        "Last chance: overwrite {} completely?",
        destination.display()
    );
    if !confirm(&last_chance)? {
        println!("Clone cancelled.");
        return Ok(());
    }
    println!();

    let settings = CloneSettings {
        block_size,
        poll_interval: Duration::from_millis(poll_interval_ms),
        ..CloneSettings::default()
    };
    debug!(?settings, "clone settings");

    let method = if smart {
        CloneMethod::Smart
    } else {
        CloneMethod::Full
    };
    let job = CloneJob::new(source, destination)
        .with_method(method)
        .with_verify(!no_verify)
        .with_cancel_token(token);

    let orchestrator = CloneOrchestrator::new(probe, settings);
    let handle = orchestrator.start(job)?;
    watch(&handle)?;
    finish(handle.wait())
}

fn list() -> Result<()> {
    let probe = LinuxProbe::new();
    let active = match resolve_active_disks(&probe) {
        Ok(active) => Some(active),
        Err(err) => {
            warn!(%err, "active disks could not be resolved");
            None
        }
    };
    let disks = summarize_disks(&probe, active.as_ref())?;
    if disks.is_empty() {
        println!("No disks found.");
        return Ok(());
    }

    println!("Found {} disks:", disks.len());
    println!(
        "\n  {:<15} {:>11}  {:<5} {:<6} {:<24} {}",
        "DEVICE", "SIZE", "MEDIA", "ACTIVE", "IDENTITY", "MODEL"
    );
    println!("  {:-<15} {:->11}  {:-<5} {:-<6} {:-<24} {:-<20}", "", "", "", "", "", "");
    for disk in disks {
        let in_use = match disk.active {
            Some(true) => style("yes").red().to_string(),
            Some(false) => "no".to_string(),
            None => "?".to_string(),
        };
        println!(
            "  {:<15} {:>8.1} GB  {:<5} {:<6} {:<24} {}",
            disk.device.path.display(),
            disk.device.size_gb(),
            if disk.solid_state { "SSD" } else { "HDD" },
            in_use,
            disk.identity,
            disk.device.model
        );
    }
    if active.is_none() {
        println!(
            "\n{} Could not tell which disks the running system uses; cloning is disabled.",
            style("NOTE:").yellow().bold()
        );
    }
    Ok(())
}

fn show_active() -> Result<()> {
    let active = resolve_active(&LinuxProbe::new())?;
    for disk in active.iter() {
        println!("{disk}");
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // Dropped when main() exits, restoring the terminal.
    let _echo_guard = EchoCtlGuard::install();

    let token = CancelToken::new();
    let on_interrupt = token.clone();
    ctrlc::set_handler(move || on_interrupt.cancel())?;

    match cli.command {
        Commands::Clone {
            source,
            destination,
            smart,
            no_verify,
            block_size,
            poll_interval_ms,
        } => run_clone(
            token,
            source,
            destination,
            smart,
            no_verify,
            block_size,
            poll_interval_ms,
        ),
        Commands::List => list(),
        Commands::Active => show_active(),
    }
}
