//! List-ports command.

use {
    anyhow::Result,
    console::style,
    ecgsim::{DetectedPort, detect_ports, device::select_port, format_port_list},
};

fn port_json(port: &DetectedPort) -> serde_json::Value {
    serde_json::json!({
        "name": port.name,
        "device": port.device.name(),
        "known": port.device.is_known(),
        "vid": port.vid,
        "pid": port.pid,
        "manufacturer": port.manufacturer,
        "product": port.product,
        "serial": port.serial,
    })
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let detected = detect_ports();

    if json {
        let ports: Vec<serde_json::Value> = detected.iter().map(port_json).collect();
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "ports": ports,
                "suggested": select_port(&detected).map(|p| p.name.as_str()),
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!("{}", style("Available serial ports").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for line in format_port_list(&detected) {
        eprintln!("  {} {}", style("•").green(), line);
    }

    if let Some(best) = select_port(&detected) {
        eprintln!(
            "\n{} Auto-selection would use {}",
            style("→").green().bold(),
            style(&best.name).cyan().bold()
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecgsim::DeviceKind;

    #[test]
    fn test_port_json_fields() {
        let port = DetectedPort {
            vid: Some(0x0483),
            pid: Some(0x374B),
            device: DeviceKind::StLink,
            product: Some("STM32 STLink".to_string()),
            ..DetectedPort::plain("/dev/ttyACM0")
        };
        let value = port_json(&port);
        assert_eq!(value["name"], "/dev/ttyACM0");
        assert_eq!(value["device"], "ST-LINK VCP");
        assert_eq!(value["known"], true);
        assert_eq!(value["vid"], 0x0483);
        assert_eq!(value["product"], "STM32 STLink");
        assert!(value["serial"].is_null());
    }
}
