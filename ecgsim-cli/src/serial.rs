//! Interactive serial port selection.
//!
//! Explicit ports (flag, env or config) win. Otherwise ports are discovered,
//! recognized USB bridges are preferred, and the user is asked only when
//! the choice is ambiguous. `--non-interactive` never prompts.

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    ecgsim::{DetectedPort, detect_ports, device::select_port},
    log::{debug, info},
    std::{cmp::Ordering, io::IsTerminal},
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// Non-interactive mode (fail if the choice is ambiguous).
    pub non_interactive: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

fn select_non_interactive_port(selection_ports: &[DetectedPort]) -> Result<DetectedPort> {
    match selection_ports.len().cmp(&1) {
        Ordering::Equal => Ok(selection_ports[0].clone()),
        Ordering::Greater => Err(usage_err(
            "multiple serial ports found; pass --port to choose one",
        )),
        Ordering::Less => Err(no_ports_err()),
    }
}

fn no_ports_err() -> anyhow::Error {
    CliError::DeviceNotFound("no serial ports found; is the simulator connected?".to_string())
        .into()
}

/// Resolve the serial port name to use.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<String> {
    if let Some(port_name) = &options.port {
        return Ok(port_name.clone());
    }

    if let Some(port_name) = &config.connection.port {
        debug!("Using port from config: {port_name}");
        return Ok(port_name.clone());
    }

    let ports = detect_ports();
    if ports.is_empty() {
        return Err(no_ports_err());
    }

    let known_ports: Vec<DetectedPort> = ports
        .iter()
        .filter(|p| p.is_likely_simulator())
        .cloned()
        .collect();
    let selection_ports = if known_ports.is_empty() {
        ports
    } else {
        known_ports
    };

    if options.non_interactive {
        return select_non_interactive_port(&selection_ports).map(|port| port.name);
    }

    match selection_ports.len().cmp(&1) {
        Ordering::Greater => {
            ensure_interactive_terminal()?;
            select_port_interactive(selection_ports)
        },
        Ordering::Equal => {
            let port = &selection_ports[0];
            if port.is_likely_simulator() {
                info!("Auto-selected port: {} [{}]", port.name, port.device.name());
                Ok(port.name.clone())
            } else {
                ensure_interactive_terminal()?;
                confirm_single_port(port)
            }
        },
        Ordering::Less => Err(no_ports_err()),
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "port selection needs an interactive terminal; pass --port",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("port selection cancelled".to_string()).into()
            } else {
                usage_err("port selection prompt failed")
            }
        },
    }
}

/// Order ports so the best candidate comes first.
fn rank_ports(mut ports: Vec<DetectedPort>) -> Vec<DetectedPort> {
    if let Some(best) = select_port(&ports).map(|p| p.name.clone()) {
        ports.sort_by_key(|p| (p.name != best, !p.device.is_high_priority(), !p.device.is_known()));
    }
    ports
}

fn port_label(port: &DetectedPort) -> String {
    let name = if port.is_likely_simulator() {
        style(&port.name).bold().to_string()
    } else {
        port.name.clone()
    };

    let device_info = if port.device.is_known() {
        format!(" [{}]", style(port.device.name()).yellow())
    } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        format!(" ({vid:04X}:{pid:04X})")
    } else {
        String::new()
    };

    let product = port
        .product
        .as_ref()
        .map(|p| format!(" - {}", style(p).dim()))
        .unwrap_or_default();

    format!("{name}{device_info}{product}")
}

/// Interactive port selection.
fn select_port_interactive(ports: Vec<DetectedPort>) -> Result<String> {
    let ports = rank_ports(ports);
    eprintln!(
        "{} Found {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );

    // Keep labels on one line in narrow terminals.
    let term_width = usize::from(console::Term::stderr().size().1);
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|port| console::truncate_str(&port_label(port), max_item_width, "\u{2026}").into_owned())
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the simulator's serial port")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => ports
            .into_iter()
            .nth(index)
            .map(|port| port.name)
            .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}")),
        None => Err(CliError::Cancelled("port selection cancelled".to_string()).into()),
    }
}

/// Confirm use of a single unrecognized port.
fn confirm_single_port(port: &DetectedPort) -> Result<String> {
    let product_info = port
        .product
        .as_ref()
        .map(|p| format!(" - {p}"))
        .unwrap_or_default();

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Use {}{product_info}?", port.name))
        .default(true)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        Ok(port.name.clone())
    } else {
        Err(CliError::Cancelled("port selection cancelled".to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        console::{measure_text_width, truncate_str},
        ecgsim::DeviceKind,
    };

    fn usb(name: &str, vid: u16, pid: u16) -> DetectedPort {
        DetectedPort {
            vid: Some(vid),
            pid: Some(pid),
            device: DeviceKind::from_vid_pid(vid, pid),
            ..DetectedPort::plain(name)
        }
    }

    #[test]
    fn test_explicit_port_wins_over_config() {
        let options = SerialOptions {
            port: Some("/dev/ttyUSB3".to_string()),
            non_interactive: true,
        };
        let mut config = Config::default();
        config.connection.port = Some("/dev/ttyUSB0".to_string());

        assert_eq!(select_serial_port(&options, &config).unwrap(), "/dev/ttyUSB3");
    }

    #[test]
    fn test_config_port_used_without_flag() {
        let options = SerialOptions {
            non_interactive: true,
            ..Default::default()
        };
        let mut config = Config::default();
        config.connection.port = Some("COM7".to_string());

        assert_eq!(select_serial_port(&options, &config).unwrap(), "COM7");
    }

    #[test]
    fn test_rank_ports_puts_st_link_first() {
        let ports = vec![
            DetectedPort::plain("/dev/ttyS0"),
            usb("/dev/ttyUSB0", 0x1A86, 0x7523),
            usb("/dev/ttyACM0", 0x0483, 0x374B),
        ];
        let ranked = rank_ports(ports);
        let names: Vec<&str> = ranked.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["/dev/ttyACM0", "/dev/ttyUSB0", "/dev/ttyS0"]);
    }

    #[test]
    fn test_port_label_truncates_on_one_line() {
        let mut port = usb("/dev/verylongttyacm0", 0x0483, 0x374B);
        port.product = Some("STM32 STLink Virtual COM Port".to_string());
        let max_item_width = 26usize;
        let truncated = truncate_str(&port_label(&port), max_item_width, "…").into_owned();

        assert!(!truncated.contains('\n'));
        assert!(measure_text_width(&truncated) <= max_item_width);
    }

    #[test]
    fn test_select_non_interactive_multiple_ports_returns_usage_error() {
        let ports = vec![usb("/dev/ttyUSB0", 0x1A86, 0x7523), usb("/dev/ttyUSB1", 0x1A86, 0x7523)];

        let err = select_non_interactive_port(&ports).unwrap_err();
        assert!(matches!(err.downcast_ref::<CliError>(), Some(CliError::Usage(_))));
    }

    #[test]
    fn test_select_non_interactive_no_ports_is_device_not_found() {
        let err = select_non_interactive_port(&[]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_select_non_interactive_single_port() {
        let ports = vec![DetectedPort::plain("/dev/ttyUSB0")];
        let selected = select_non_interactive_port(&ports).unwrap();
        assert_eq!(selected.name, "/dev/ttyUSB0");
    }
}
