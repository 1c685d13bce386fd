//! stm32-uart-prog - mass-program STM32 devices over a shared UART bus.
//!
//! One target at a time is silenced onto its ROM bootloader, erased
//! sector-by-sector and written/verified page-by-page from an Intel HEX
//! image, then released. The bus-control side (muting application firmware,
//! forcing bootloader entry) is the library's `ContextHooks` boundary; this
//! binary uses the sample RS-485 hooks.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use console::style;
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, warn};

use stm32_uart_prog::{
    bootloader::Timeouts,
    fleet::{Fleet, FleetConfig, ProgressEvent},
    port::{NativePort, NativePortEnumerator, PortEnumerator},
    session::{RetryPolicy, SessionEvent},
    McuDescriptor, Rs485Hooks, SerialConfig,
};

mod hexfile;
mod serial;
mod targets;

use serial::{select_serial_port, SerialOptions};

/// Mass-program STM32 devices on a shared UART bus via the ROM bootloader.
///
/// Environment variables:
///   STM32_UART_PROG_PORT    - Default serial port
///   STM32_UART_PROG_BAUD    - Default baud rate
#[derive(Parser)]
#[command(name = "stm32-uart-prog")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Intel HEX image to program.
    #[arg(long, value_name = "PATH", required_unless_present = "list_ports")]
    hexfile: Option<PathBuf>,

    /// Target ids: comma-separated singles and inclusive ranges, e.g. "1,3-5,8".
    #[arg(long, value_name = "SPEC", required_unless_present = "list_ports")]
    targets: Option<String>,

    /// Serial port (prompted interactively if omitted and several exist).
    #[arg(short, long, env = "STM32_UART_PROG_PORT")]
    port: Option<String>,

    /// UART baud rate for the bootloader session.
    #[arg(short, long, default_value_t = 115_200, env = "STM32_UART_PROG_BAUD")]
    baud: u32,

    /// Jump to the application after successful programming.
    #[arg(long, conflicts_with = "no_go")]
    go: bool,

    /// Leave targets in the bootloader after programming (the default).
    #[arg(long)]
    no_go: bool,

    /// Jump address for --go (defaults to the flash base).
    #[arg(long, value_name = "ADDR", value_parser = parse_hex_u32, requires = "go")]
    go_address: Option<u32>,

    /// Transport retries per bootloader command.
    #[arg(long, value_name = "N", default_value_t = 3)]
    retries_cmd: u32,

    /// Write/verify attempts per chunk before the sector is re-erased.
    #[arg(long, value_name = "N", default_value_t = 3)]
    retries_chunk: u32,

    /// Sector recovery passes (re-erase and rewrite) per sector.
    #[arg(long, value_name = "N", default_value_t = 2)]
    retries_sector: u32,

    /// Erase attempts per sector pass.
    #[arg(long, value_name = "N", default_value_t = 3)]
    retries_erase: u32,

    /// Bus-idle delay between targets, in milliseconds.
    #[arg(long, value_name = "MS", default_value_t = 50)]
    inter_target_delay: u64,

    /// Stop at the first failed target instead of continuing.
    #[arg(long)]
    stop_on_failure: bool,

    /// List available serial ports and exit.
    #[arg(long)]
    list_ports: bool,

    /// With --list-ports: print the list as JSON on stdout.
    #[arg(long, requires = "list_ports")]
    json: bool,

    /// Never prompt; fail where interaction would be needed.
    #[arg(long)]
    non_interactive: bool,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long)]
    quiet: bool,
}

/// Parse a hexadecimal address (0x prefix and underscores allowed).
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    let s: String = s.chars().filter(|c| *c != '_').collect();
    u32::from_str_radix(&s, 16).map_err(|e| format!("invalid hex address: {e}"))
}

const EXIT_TARGET_FAILED: u8 = 1;
const EXIT_USAGE: u8 = 2;
const EXIT_TRANSPORT: u8 = 3;
const EXIT_CANCELLED: u8 = 130;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    if std::env::var("NO_COLOR").is_ok() || !console::Term::stderr().is_term() {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    // Ctrl-C trips the library's cancellation checker; the session engine
    // aborts between commands and the fleet releases the bus.
    let cancelled = Arc::new(AtomicBool::new(false));
    {
        let flag = Arc::clone(&cancelled);
        stm32_uart_prog::set_cancel_checker(move || flag.load(Ordering::Relaxed));
    }
    let flag = Arc::clone(&cancelled);
    if let Err(e) = ctrlc::set_handler(move || {
        flag.store(true, Ordering::Relaxed);
        eprintln!("\ncancellation requested, finishing current command...");
    }) {
        warn!("could not install Ctrl-C handler: {e}");
    }

    if cli.list_ports {
        return cmd_list_ports(cli.json);
    }

    match run(&cli) {
        Ok(code) => code,
        Err(classified) => {
            eprintln!("{} {:#}", style("error:").red().bold(), classified.error);
            ExitCode::from(classified.exit_code)
        }
    }
}

/// An error plus the exit code its phase maps to.
struct ClassifiedError {
    error: anyhow::Error,
    exit_code: u8,
}

trait Classify<T> {
    fn usage(self) -> Result<T, ClassifiedError>;
    fn transport(self) -> Result<T, ClassifiedError>;
}

impl<T> Classify<T> for Result<T> {
    fn usage(self) -> Result<T, ClassifiedError> {
        self.map_err(|error| ClassifiedError { error, exit_code: EXIT_USAGE })
    }

    fn transport(self) -> Result<T, ClassifiedError> {
        self.map_err(|error| ClassifiedError { error, exit_code: EXIT_TRANSPORT })
    }
}

fn run(cli: &Cli) -> Result<ExitCode, ClassifiedError> {
    let mcu = McuDescriptor::stm32f405_417();

    // Input validation: everything here exits 2 without touching the bus.
    let hexfile = cli.hexfile.as_deref().expect("clap requires --hexfile");
    let spec = cli.targets.as_deref().expect("clap requires --targets");
    let target_list = targets::parse_targets(spec).usage()?;
    let image = hexfile::load_hex(hexfile, mcu).usage()?;

    let go_address = resolve_go_address(cli, &image, mcu);

    let config = FleetConfig {
        policy: RetryPolicy {
            cmd: cli.retries_cmd,
            erase: cli.retries_erase,
            chunk: cli.retries_chunk,
            sector_recover: cli.retries_sector,
            ..RetryPolicy::default()
        },
        timeouts: Timeouts::default(),
        inter_target_delay: Duration::from_millis(cli.inter_target_delay),
        go_address,
        abort_on_failure: cli.stop_on_failure,
    };

    // Transport setup: failures here exit 3.
    let port_name = select_serial_port(&SerialOptions {
        port: cli.port.clone(),
        non_interactive: cli.non_interactive,
    })
    .transport()?;
    let port = NativePort::open(&SerialConfig::bootloader(&port_name, cli.baud))
        .with_context(|| format!("opening {port_name}"))
        .transport()?;

    let mut fleet = Fleet::new(port, Rs485Hooks::default(), mcu, &image, config)
        .context("building the programming plan")
        .usage()?;

    if !cli.quiet {
        let (lo, hi) = image.extent().expect("image is non-empty");
        eprintln!(
            "{} {} ({} bytes, {lo:#010x}..={hi:#010x}), {} chunk(s) in sector(s) {:?}",
            style("firmware:").bold(),
            hexfile.display(),
            image.len(),
            fleet.plan().len(),
            fleet.plan().dirty_sectors(),
        );
        eprintln!(
            "{} {port_name} at {} baud, {} target(s)",
            style("bus:").bold(),
            cli.baud,
            target_list.len()
        );
    }

    let started = Instant::now();
    let report = run_fleet(cli, &mut fleet, &target_list)
        .context("running the fleet")
        .transport()?;

    // Summary.
    if !cli.quiet {
        eprintln!("\n{}", style("Programming summary:").bold());
        for (target, outcome) in &report.outcomes {
            let line = if outcome.is_done() {
                style("done").green().to_string()
            } else {
                style(outcome.to_string()).red().to_string()
            };
            eprintln!("  {target}: {line}");
        }
        eprintln!("  duration: {}", format_duration(started.elapsed()));
    }

    if report.cancelled {
        eprintln!("{}", style("programming cancelled").yellow());
        return Ok(ExitCode::from(EXIT_CANCELLED));
    }
    if report.failed() > 0 {
        return Ok(ExitCode::from(EXIT_TARGET_FAILED));
    }
    Ok(ExitCode::SUCCESS)
}

/// Drive the fleet with a total progress bar over chunks x targets.
fn run_fleet(
    cli: &Cli,
    fleet: &mut Fleet<NativePort, Rs485Hooks>,
    target_list: &[stm32_uart_prog::TargetId],
) -> stm32_uart_prog::Result<stm32_uart_prog::FleetReport> {
    let plan_len = fleet.plan().len();
    let total = (plan_len * target_list.len()) as u64;

    let bar = if cli.quiet || !console::Term::stderr().is_term() {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} chunks {msg}")
                .expect("static template")
                .progress_chars("#>-"),
        );
        bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        bar
    };

    let mut base = 0u64;
    let report = fleet.run(target_list, &mut |event| match event {
        ProgressEvent::TargetStarted { target, index, total } => {
            base = (index * plan_len) as u64;
            bar.set_position(base);
            bar.set_message(format!("{target} ({}/{total})", index + 1));
        }
        ProgressEvent::Session { target, event } => match event {
            SessionEvent::ChunkProgrammed { done, .. } => {
                bar.set_position(base + done as u64);
            }
            SessionEvent::SectorErased { sector, attempt } => {
                debug!("{target}: sector {sector} erased (attempt {attempt})");
            }
            SessionEvent::SectorRecovery { sector, pass } => {
                bar.println(format!(
                    "  {} {target}: retrying sector {sector} (pass {})",
                    style("!").yellow(),
                    pass + 1
                ));
            }
        },
        ProgressEvent::TargetFinished { target, ok } => {
            let mark = if ok {
                style("ok").green().to_string()
            } else {
                style("failed").red().to_string()
            };
            bar.println(format!("  {target}: {mark}"));
        }
    })?;
    bar.finish_and_clear();
    Ok(report)
}

/// Resolve the GO address: none by default, flash base with `--go`, explicit
/// with `--go-address`. Warns when it differs from the image start.
fn resolve_go_address(
    cli: &Cli,
    image: &stm32_uart_prog::HexImage,
    mcu: &McuDescriptor,
) -> Option<u32> {
    if !cli.go {
        return None;
    }
    let addr = cli.go_address.unwrap_or_else(|| mcu.flash_start());
    if let Some((lo, _)) = image.extent() {
        if lo != addr {
            eprintln!(
                "{} image starts at {lo:#010x} but GO will jump to {addr:#010x}",
                style("warning:").yellow().bold()
            );
        }
    }
    Some(addr)
}

/// List ports, as text or JSON.
fn cmd_list_ports(json: bool) -> ExitCode {
    let ports = match NativePortEnumerator::list_ports() {
        Ok(ports) => ports,
        Err(e) => {
            eprintln!("{} {e}", style("error:").red().bold());
            return ExitCode::from(EXIT_TRANSPORT);
        }
    };

    if json {
        let entries: Vec<serde_json::Value> = ports
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "vid": p.vid,
                    "pid": p.pid,
                    "manufacturer": p.manufacturer,
                    "product": p.product,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&entries).unwrap_or_default()
        );
        return ExitCode::SUCCESS;
    }

    if ports.is_empty() {
        eprintln!("{}", style("no serial ports found").dim());
    } else {
        for port in &ports {
            eprintln!("  {}", serial::describe_port(port));
        }
    }
    ExitCode::SUCCESS
}

/// `1h-2min-3s-450ms` style duration, largest unit first.
fn format_duration(elapsed: Duration) -> String {
    let ms = elapsed.subsec_millis();
    let total = elapsed.as_secs();
    let (days, rem) = (total / 86_400, total % 86_400);
    let (hours, rem) = (rem / 3_600, rem % 3_600);
    let (minutes, seconds) = (rem / 60, rem % 60);

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{days}d"));
    }
    if hours > 0 || !parts.is_empty() {
        parts.push(format!("{hours}h"));
    }
    if minutes > 0 || !parts.is_empty() {
        parts.push(format!("{minutes}min"));
    }
    if seconds > 0 || !parts.is_empty() {
        parts.push(format!("{seconds}s"));
    }
    parts.push(format!("{ms}ms"));
    parts.join("-")
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_minimal_invocation() {
        let cli = Cli::try_parse_from([
            "stm32-uart-prog",
            "--hexfile",
            "fw.hex",
            "--targets",
            "1,3-5,8",
        ])
        .unwrap();
        assert_eq!(cli.hexfile.as_deref().unwrap().to_str().unwrap(), "fw.hex");
        assert_eq!(cli.targets.as_deref(), Some("1,3-5,8"));
        assert_eq!(cli.baud, 115_200);
        assert!(!cli.go);
        assert_eq!(cli.retries_cmd, 3);
        assert_eq!(cli.retries_chunk, 3);
        assert_eq!(cli.retries_sector, 2);
        assert_eq!(cli.retries_erase, 3);
        assert_eq!(cli.inter_target_delay, 50);
    }

    #[test]
    fn hexfile_and_targets_are_required() {
        assert!(Cli::try_parse_from(["stm32-uart-prog"]).is_err());
        assert!(Cli::try_parse_from(["stm32-uart-prog", "--hexfile", "fw.hex"]).is_err());
        assert!(Cli::try_parse_from(["stm32-uart-prog", "--targets", "1"]).is_err());
    }

    #[test]
    fn list_ports_needs_no_hexfile() {
        let cli = Cli::try_parse_from(["stm32-uart-prog", "--list-ports"]).unwrap();
        assert!(cli.list_ports);
        assert!(cli.hexfile.is_none());
    }

    #[test]
    fn json_requires_list_ports() {
        assert!(Cli::try_parse_from(["stm32-uart-prog", "--json"]).is_err());
        assert!(Cli::try_parse_from(["stm32-uart-prog", "--list-ports", "--json"]).is_ok());
    }

    #[test]
    fn go_and_no_go_conflict() {
        let result = Cli::try_parse_from([
            "stm32-uart-prog",
            "--hexfile",
            "fw.hex",
            "--targets",
            "1",
            "--go",
            "--no-go",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn go_address_requires_go() {
        let result = Cli::try_parse_from([
            "stm32-uart-prog",
            "--hexfile",
            "fw.hex",
            "--targets",
            "1",
            "--go-address",
            "0x08000000",
        ]);
        assert!(result.is_err());

        let cli = Cli::try_parse_from([
            "stm32-uart-prog",
            "--hexfile",
            "fw.hex",
            "--targets",
            "1",
            "--go",
            "--go-address",
            "0x0800_0000",
        ])
        .unwrap();
        assert_eq!(cli.go_address, Some(0x0800_0000));
    }

    #[test]
    fn retries_are_overridable() {
        let cli = Cli::try_parse_from([
            "stm32-uart-prog",
            "--hexfile",
            "fw.hex",
            "--targets",
            "1",
            "--retries-cmd",
            "5",
            "--retries-chunk",
            "7",
            "--retries-sector",
            "1",
            "--retries-erase",
            "9",
        ])
        .unwrap();
        assert_eq!(cli.retries_cmd, 5);
        assert_eq!(cli.retries_chunk, 7);
        assert_eq!(cli.retries_sector, 1);
        assert_eq!(cli.retries_erase, 9);
    }

    #[test]
    fn parse_hex_u32_variants() {
        assert_eq!(parse_hex_u32("0x08000000").unwrap(), 0x0800_0000);
        assert_eq!(parse_hex_u32("0X0800_0000").unwrap(), 0x0800_0000);
        assert_eq!(parse_hex_u32("ff").unwrap(), 0xFF);
        assert!(parse_hex_u32("zz").is_err());
        assert!(parse_hex_u32("0x1FFFFFFFF").is_err());
    }

    #[test]
    fn format_duration_examples() {
        assert_eq!(format_duration(Duration::from_millis(450)), "450ms");
        assert_eq!(format_duration(Duration::from_secs(3)), "3s-0ms");
        assert_eq!(format_duration(Duration::from_secs(62)), "1min-2s-0ms");
        assert_eq!(
            format_duration(Duration::from_secs(3_723)),
            "1h-2min-3s-0ms"
        );
        assert_eq!(
            format_duration(Duration::from_secs(90_061)),
            "1d-1h-1min-1s-0ms"
        );
    }
}
