//! Serial port selection.
//!
//! Order of preference: an explicit `--port`, a single detected port, an
//! interactive picker. Non-interactive runs fail instead of prompting so
//! they stay CI-safe.

use anyhow::{bail, Context, Result};
use console::style;
use dialoguer::{theme::ColorfulTheme, Select};
use log::info;
use stm32_uart_prog::port::{NativePortEnumerator, PortEnumerator, PortInfo};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// Non-interactive mode (fail instead of prompting).
    pub non_interactive: bool,
}

/// Pick the port to use for the run.
pub fn select_serial_port(options: &SerialOptions) -> Result<String> {
    if let Some(name) = &options.port {
        return Ok(name.clone());
    }

    let ports = NativePortEnumerator::list_ports().context("enumerating serial ports")?;
    if ports.is_empty() {
        bail!("no serial ports found; connect an adapter or pass --port");
    }

    if ports.len() == 1 {
        let name = ports[0].name.clone();
        info!("auto-selected only port: {name}");
        return Ok(name);
    }

    if options.non_interactive {
        bail!(
            "{} serial ports found; pass --port to choose one in non-interactive mode",
            ports.len()
        );
    }

    select_port_interactive(&ports)
}

fn select_port_interactive(ports: &[PortInfo]) -> Result<String> {
    eprintln!(
        "{} detected {} serial ports",
        style("i").blue(),
        ports.len()
    );

    let labels: Vec<String> = ports.iter().map(describe_port).collect();
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select a serial port")
        .items(&labels)
        .default(0)
        .interact_opt()
        .context("showing port selection")?;

    match selection {
        Some(index) => Ok(ports[index].name.clone()),
        None => bail!("port selection cancelled"),
    }
}

/// One display line per port: name, VID:PID when known, product string.
pub fn describe_port(port: &PortInfo) -> String {
    let vid_pid = match (port.vid, port.pid) {
        (Some(vid), Some(pid)) => format!(" ({vid:04X}:{pid:04X})"),
        _ => String::new(),
    };
    let product = port
        .product
        .as_deref()
        .map(|p| format!(" - {}", style(p).dim()))
        .unwrap_or_default();
    format!("{}{vid_pid}{product}", style(&port.name).cyan())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_port_wins_without_enumeration() {
        let options = SerialOptions {
            port: Some("/dev/ttyUSB7".into()),
            non_interactive: true,
        };
        assert_eq!(select_serial_port(&options).unwrap(), "/dev/ttyUSB7");
    }

    #[test]
    fn describe_port_includes_ids() {
        let info = PortInfo {
            name: "/dev/ttyUSB0".into(),
            vid: Some(0x0403),
            pid: Some(0x6001),
            manufacturer: None,
            product: Some("FT232R".into()),
        };
        let line = console::strip_ansi_codes(&describe_port(&info)).to_string();
        assert!(line.contains("/dev/ttyUSB0"));
        assert!(line.contains("0403:6001"));
        assert!(line.contains("FT232R"));
    }
}
