use anyhow::{Context, Result, anyhow, bail};
use byte0_core::{
    Availability, CancelToken, DeviceDescriptor, DeviceId, Engine, EngineConfig, JobState,
    ListedDevice, Severity, WipeEvent,
};
use clap::{Args, Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Input, Select, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::io::{IsTerminal, stdout};
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

#[derive(Parser)]
#[command(name = "byte0")]
#[command(about = "A safe, interactive zero-fill disk wiper", version)]
struct Cli {
    #[command(flatten)]
    engine: EngineArgs,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct EngineArgs {
    /// Path to the dd executable used for zero-filling
    #[arg(long = "dd", env = "BYTE0_DD", global = true)]
    dd: Option<PathBuf>,

    /// Block size passed to dd (e.g. 1M, 4M)
    #[arg(long, env = "BYTE0_BLOCK_SIZE", global = true)]
    block_size: Option<String>,

    /// Give up on dd after this many seconds (default: wait until done or cancelled)
    #[arg(long, value_name = "SECS", global = true)]
    timeout: Option<u64>,
}

impl EngineArgs {
    fn to_config(&self) -> EngineConfig {
        let mut config = EngineConfig::default();
        if let Some(dd) = &self.dd {
            config = config.with_tool_path(dd);
        }
        if let Some(bs) = &self.block_size {
            config = config.with_block_size(bs);
        }
        config.with_wipe_timeout(self.timeout.map(Duration::from_secs))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Overwrite a device with zeros interactively
    Wipe {
        /// Device id to wipe (disk number on Windows, e.g. "sdb" on Linux)
        #[arg(short, long)]
        device: Option<String>,

        /// Skip the interactive confirmation prompts
        #[arg(long)]
        yes: bool,
    },
    /// List physical devices and whether they can be wiped
    List,
}

/// A helper struct that, on Unix, disables `ECHOCTL` for the terminal.
///
/// `ECHOCTL` is the terminal flag that causes Ctrl+C to be printed as `^C`.
/// By disabling it, we can have a cleaner exit when the user cancels the
/// wipe, as the `ctrlc` handler will print its own message.
/// The original terminal state is restored when this struct is dropped.
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            if !stdout().is_terminal() {
                return Self {
                    original_termios: None,
                };
            }

            let fd = stdout().as_raw_fd();
            let original_termios = Termios::from_fd(fd).ok().and_then(|original| {
                let mut new_termios = original;
                // Disable printing of control characters.
                new_termios.c_lflag &= !ECHOCTL;
                tcsetattr(fd, TCSANOW, &new_termios).ok().map(|_| original)
            });
            Self { original_termios }
        }
        #[cfg(not(unix))]
        {
            // This is a no-op on non-Unix platforms.
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original_termios) = self.original_termios {
            let fd = stdout().as_raw_fd();
            // Restore the original terminal settings.
            tcsetattr(fd, TCSANOW, original_termios).ok();
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

/// Presents an interactive menu for the user to select a device.
fn select_device(devices: &[DeviceDescriptor], prompt: &str) -> Result<DeviceDescriptor> {
    if devices.is_empty() {
        bail!("No wipeable devices found (the system disk is never offered).");
    }

    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(devices[selection].clone())
}

/// Presents a final "Yes/No" confirmation, then asks for the device id to be
/// typed back.
fn confirm_operation(device: &DeviceDescriptor) -> Result<bool> {
    let theme = ColorfulTheme::default();
    let proceed = Confirm::with_theme(&theme)
        .with_prompt("Are you sure you want to proceed?")
        .default(false)
        .interact()?;
    if !proceed {
        return Ok(false);
    }

    let typed: String = Input::with_theme(&theme)
        .with_prompt(format!("Type '{}' to confirm", device.index))
        .allow_empty(true)
        .interact_text()?;
    Ok(typed.trim() == device.index.as_str())
}

fn availability_label(availability: Availability) -> String {
    match availability {
        Availability::Available => style("available").green().to_string(),
        Availability::SystemDisk => style("SYSTEM DISK").red().bold().to_string(),
        Availability::Busy => style("busy").yellow().to_string(),
    }
}

fn list_devices(engine: &Engine) -> Result<()> {
    let devices: Vec<ListedDevice> = engine
        .enumerate_devices()
        .context("Failed to scan for devices")?;
    if devices.is_empty() {
        println!("No physical devices found.");
        return Ok(());
    }

    println!("Found {} physical devices:", devices.len());
    println!(
        "\n  {:<10} {:<22} {:<28} {:<10} {}",
        "ID", "DEVICE", "NAME", "SIZE", "STATUS"
    );
    println!("  {:-<10} {:-<22} {:-<28} {:-<10} {:-<12}", "", "", "", "", "");
    for listed in devices {
        let d = &listed.device;
        println!(
            "  {:<10} {:<22} {:<28} {:>7.1} GB  {}",
            d.index.as_str(),
            d.path.display(),
            d.display_name,
            d.size_gb(),
            availability_label(listed.availability)
        );
    }
    Ok(())
}

fn progress_bar(device: &DeviceDescriptor) -> ProgressBar {
    if device.size_bytes > 0 {
        let pb = ProgressBar::new(device.size_bytes);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{prefix:12} [{elapsed_precise}] [{bar:40.red/black}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
                )
                .expect("valid progress template")
                .progress_chars("■ "),
        );
        pb
    } else {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{prefix:12} [{elapsed_precise}] {spinner} {bytes} ({bytes_per_sec})")
                .expect("valid progress template"),
        );
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }
}

fn wipe(engine: &Engine, device: Option<String>, yes: bool, interrupted: &CancelToken) -> Result<()> {
    let candidates = engine
        .wipe_candidates()
        .context("Failed to scan for devices")?;

    let device = match device {
        Some(id) => {
            let id = DeviceId::new(id);
            candidates
                .iter()
                .find(|d| d.index == id)
                .cloned()
                .ok_or_else(|| anyhow!("Device '{id}' is not available for wiping."))?
        }
        None => select_device(&candidates, "Select the device to WIPE")?,
    };

    println!(
        "{} This will overwrite ALL data on '{}' ({:.1} GB) with zeros.",
        style("WARNING:").red().bold(),
        device.display_name,
        device.size_gb(),
    );
    println!("  Device: {}", style(device.path.display()).cyan());
    println!("  Tool:   {}", style(engine.config().tool_path.display()).cyan());
    println!();

    if !yes && !confirm_operation(&device)? {
        println!("Wipe cancelled.");
        return Ok(());
    }
    if interrupted.is_cancelled() {
        println!("Wipe cancelled.");
        return Ok(());
    }

    println!();

    let job = engine
        .start_wipe(&device.index, &device.confirmation_token())
        .with_context(|| format!("Refusing to wipe {}", device.index))?;

    let events = job.events();
    let pb = progress_bar(&device);
    pb.set_prefix("Starting");
    let mut cancel_sent = false;

    let report = loop {
        if interrupted.is_cancelled() && !cancel_sent {
            pb.println(format!("{}", style("Cancelling, stopping dd...").yellow()));
            engine.cancel(&job);
            cancel_sent = true;
        }

        let event = match events.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => event,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                break job.wait();
            }
        };

        match event {
            WipeEvent::State(s) => match s.state {
                JobState::Unlocking => pb.set_prefix("Unlocking"),
                JobState::Wiping => pb.set_prefix("Wiping"),
                _ => {}
            },
            WipeEvent::Progress(p) => pb.set_position(p.bytes_written),
            WipeEvent::Log(l) => {
                let line = match l.severity {
                    Severity::Info => style(l.message).dim().to_string(),
                    Severity::Warning => style(l.message).yellow().to_string(),
                    Severity::Error => style(l.message).red().to_string(),
                };
                pb.println(format!("  {line}"));
            }
            WipeEvent::Done(_) => break job.wait(),
        }
    };

    match report.state() {
        JobState::Completed => {
            pb.finish_with_message("Wipe complete.");
            println!(
                "\n✨ Successfully zero-filled {}.",
                style(device.path.display()).cyan()
            );
            Ok(())
        }
        JobState::Cancelled => {
            pb.abandon_with_message("Cancelled.");
            bail!(
                "Wipe of {} cancelled; the device is partially overwritten.",
                device.path.display()
            )
        }
        _ => {
            pb.abandon_with_message("❌ Wipe failed.");
            match report.error {
                Some(err) => Err(err).context(format!("Wipe of {} failed", device.path.display())),
                None => bail!("Wipe of {} failed", device.path.display()),
            }
        }
    }
}

fn main() -> Result<()> {
    // This guard will be dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();

    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Ctrl+C only raises this flag; the wipe loop turns it into a job cancel.
    let interrupted = CancelToken::new();
    let flag = interrupted.clone();
    ctrlc::set_handler(move || {
        flag.cancel();
    })?;

    let engine = Engine::new(cli.engine.to_config());

    match cli.command {
        Commands::List => list_devices(&engine),
        Commands::Wipe { device, yes } => wipe(&engine, device, yes, &interrupted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_shape_the_engine_config() {
        let cli = Cli::try_parse_from([
            "byte0", "--dd", "/opt/dd", "--block-size", "1M", "--timeout", "30", "list",
        ])
        .unwrap();
        let config = cli.engine.to_config();
        assert_eq!(config.tool_path, PathBuf::from("/opt/dd"));
        assert_eq!(config.block_size, "1M");
        assert_eq!(config.wipe_timeout, Some(Duration::from_secs(30)));
        assert!(matches!(cli.command, Commands::List));
    }

    #[test]
    fn no_timeout_flag_waits_indefinitely() {
        let cli = Cli::try_parse_from(["byte0", "wipe", "--device", "1", "--yes"]).unwrap();
        assert_eq!(cli.engine.to_config().wipe_timeout, None);
        match cli.command {
            Commands::Wipe { device, yes } => {
                assert_eq!(device.as_deref(), Some("1"));
                assert!(yes);
            }
            Commands::List => panic!("expected wipe"),
        }
    }

    #[test]
    fn terminal_restorer_round_trips() {
        let restorer = TermRestorer::new();
        drop(restorer);
    }
}
