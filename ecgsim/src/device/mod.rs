//! Serial port discovery and classification.
//!
//! The simulator board is an STM32 part reached either through the ST-LINK
//! virtual COM port or through a separate USB-UART bridge. Discovery ranks
//! candidates so the CLI can pick one without asking when the choice is
//! obvious.

use crate::error::{Error, Result};

use log::info;
#[cfg(feature = "native")]
use log::{debug, trace};

/// Known USB bridge/device kinds commonly used with the simulator board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum DeviceKind {
    /// ST-LINK virtual COM port (Nucleo / Discovery boards).
    StLink,
    /// CH340/CH341 USB-to-Serial converter.
    Ch340,
    /// Silicon Labs CP210x USB-to-Serial converter.
    Cp210x,
    /// FTDI FT232/FT2232/FT4232 USB-to-Serial converter.
    Ftdi,
    /// Prolific PL2303 USB-to-Serial converter.
    Prolific,
    /// Unknown device.
    Unknown,
}

/// Known USB VID/PID pairs. An empty PID list matches any product.
const KNOWN_USB_DEVICES: &[(u16, &[u16], DeviceKind)] = &[
    (
        0x0483,
        &[0x374B, 0x374E, 0x374F, 0x3752, 0x3753, 0x5740],
        DeviceKind::StLink,
    ),
    (
        0x1A86,
        &[0x7523, 0x7522, 0x5523, 0x5512, 0x55D4],
        DeviceKind::Ch340,
    ),
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71, 0xEA63], DeviceKind::Cp210x),
    (
        0x0403,
        &[0x6001, 0x6010, 0x6011, 0x6014, 0x6015],
        DeviceKind::Ftdi,
    ),
    (0x067B, &[0x2303, 0x23A3, 0x23C3, 0x23D3], DeviceKind::Prolific),
];

impl DeviceKind {
    /// Classify a USB VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        KNOWN_USB_DEVICES
            .iter()
            .find(|(known_vid, pids, _)| vid == *known_vid && (pids.is_empty() || pids.contains(&pid)))
            .map_or(Self::Unknown, |(_, _, device)| *device)
    }

    /// Get a human-readable name for the device kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StLink => "ST-LINK VCP",
            Self::Ch340 => "CH340/CH341",
            Self::Cp210x => "CP210x",
            Self::Ftdi => "FTDI",
            Self::Prolific => "PL2303",
            Self::Unknown => "Unknown",
        }
    }

    /// Check if this is a known/expected device kind.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Check if this device kind should be preferred during auto-selection.
    pub fn is_high_priority(&self) -> bool {
        matches!(self, Self::StLink | Self::Ch340 | Self::Cp210x)
    }
}

/// Discovered serial port information.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DetectedPort {
    /// Port name/path (e.g., "/dev/ttyACM0" or "COM3").
    pub name: String,
    /// Classified device kind.
    pub device: DeviceKind,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

impl DetectedPort {
    /// A port without USB metadata.
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            device: DeviceKind::Unknown,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    /// Check if this port is likely the simulator board.
    pub fn is_likely_simulator(&self) -> bool {
        self.device.is_known()
    }
}

#[cfg(feature = "native")]
impl From<serialport::SerialPortInfo> for DetectedPort {
    fn from(info: serialport::SerialPortInfo) -> Self {
        let serialport::SerialPortType::UsbPort(usb) = info.port_type else {
            return Self::plain(info.port_name);
        };

        let device = DeviceKind::from_vid_pid(usb.vid, usb.pid);
        trace!(
            "USB port {} VID {:04X} PID {:04X} -> {device:?}",
            info.port_name, usb.vid, usb.pid
        );
        Self {
            name: info.port_name,
            device,
            vid: Some(usb.vid),
            pid: Some(usb.pid),
            manufacturer: usb.manufacturer,
            product: usb.product,
            serial: usb.serial_number,
        }
    }
}

/// Enumerate serial ports with their USB metadata.
///
/// Enumeration failures are logged and yield an empty list.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    serialport::available_ports()
        .map(|ports| ports.into_iter().map(DetectedPort::from).collect())
        .unwrap_or_else(|e| {
            debug!("Failed to enumerate serial ports: {e}");
            Vec::new()
        })
}

/// Detect all available serial ports (always empty without `native`).
#[cfg(not(feature = "native"))]
pub fn detect_ports() -> Vec<DetectedPort> {
    Vec::new()
}

/// Pick the best candidate from `ports`.
///
/// ST-LINK first, then other preferred bridges, then any known bridge, then
/// whatever comes first.
pub fn select_port(ports: &[DetectedPort]) -> Option<&DetectedPort> {
    ports
        .iter()
        .find(|p| p.device == DeviceKind::StLink)
        .or_else(|| ports.iter().find(|p| p.device.is_high_priority()))
        .or_else(|| ports.iter().find(|p| p.device.is_known()))
        .or_else(|| ports.first())
}

/// Auto-detect a single serial port.
pub fn auto_detect_port() -> Result<DetectedPort> {
    let ports = detect_ports();
    let port = select_port(&ports).ok_or(Error::DeviceNotFound)?;

    if port.device.is_known() {
        info!("Auto-detected {} port: {}", port.device.name(), port.name);
    } else {
        info!("Using first available port: {}", port.name);
    }

    Ok(port.clone())
}

/// Format a list of detected ports for display.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    ports
        .iter()
        .map(|port| {
            let device_info = if port.device.is_known() {
                format!(" [{}]", port.device.name())
            } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
                format!(" [VID:{vid:04X} PID:{pid:04X}]")
            } else {
                String::new()
            };

            let product_info = port
                .product
                .as_ref()
                .map(|p| format!(" - {p}"))
                .unwrap_or_default();

            format!("{}{}{}", port.name, device_info, product_info)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb(name: &str, vid: u16, pid: u16) -> DetectedPort {
        DetectedPort {
            vid: Some(vid),
            pid: Some(pid),
            device: DeviceKind::from_vid_pid(vid, pid),
            ..DetectedPort::plain(name)
        }
    }

    #[test]
    fn test_device_kind_from_vid_pid() {
        assert_eq!(DeviceKind::from_vid_pid(0x0483, 0x374B), DeviceKind::StLink);
        assert_eq!(DeviceKind::from_vid_pid(0x1A86, 0x7523), DeviceKind::Ch340);
        assert_eq!(DeviceKind::from_vid_pid(0x10C4, 0xEA60), DeviceKind::Cp210x);
        assert_eq!(DeviceKind::from_vid_pid(0x0403, 0x6001), DeviceKind::Ftdi);
        assert_eq!(DeviceKind::from_vid_pid(0x067B, 0x2303), DeviceKind::Prolific);
        assert_eq!(DeviceKind::from_vid_pid(0x0483, 0x0001), DeviceKind::Unknown);
        assert_eq!(DeviceKind::from_vid_pid(0x1234, 0x5678), DeviceKind::Unknown);
    }

    #[test]
    fn test_select_port_prefers_st_link() {
        let ports = vec![
            DetectedPort::plain("/dev/ttyS0"),
            usb("/dev/ttyUSB0", 0x0403, 0x6001),
            usb("/dev/ttyUSB1", 0x1A86, 0x7523),
            usb("/dev/ttyACM0", 0x0483, 0x374B),
        ];
        assert_eq!(select_port(&ports).map(|p| p.name.as_str()), Some("/dev/ttyACM0"));

        let bridges = &ports[..3];
        assert_eq!(select_port(bridges).map(|p| p.name.as_str()), Some("/dev/ttyUSB1"));

        let ftdi_only = &ports[..2];
        assert_eq!(select_port(ftdi_only).map(|p| p.name.as_str()), Some("/dev/ttyUSB0"));

        assert_eq!(select_port(&ports[..1]).map(|p| p.name.as_str()), Some("/dev/ttyS0"));
        assert!(select_port(&[]).is_none());
    }

    #[test]
    fn test_format_port_list() {
        let mut stlink = usb("/dev/ttyACM0", 0x0483, 0x374B);
        stlink.product = Some("STM32 STLink".to_string());
        let ports = vec![
            stlink,
            usb("/dev/ttyUSB1", 0x1234, 0x5678),
            DetectedPort::plain("/dev/ttyS0"),
        ];

        let formatted = format_port_list(&ports);
        assert_eq!(formatted[0], "/dev/ttyACM0 [ST-LINK VCP] - STM32 STLink");
        assert_eq!(formatted[1], "/dev/ttyUSB1 [VID:1234 PID:5678]");
        assert_eq!(formatted[2], "/dev/ttyS0");
    }

    #[test]
    fn test_likely_simulator_needs_known_bridge() {
        assert!(usb("/dev/ttyACM0", 0x0483, 0x374B).is_likely_simulator());
        assert!(usb("/dev/ttyUSB0", 0x067B, 0x2303).is_likely_simulator());
        assert!(!usb("/dev/ttyUSB1", 0x1234, 0x5678).is_likely_simulator());
        assert!(!DetectedPort::plain("COM1").is_likely_simulator());
    }

    #[cfg(feature = "native")]
    #[test]
    fn test_from_port_info_without_usb_is_plain() {
        let info = serialport::SerialPortInfo {
            port_name: "/dev/ttyS0".to_string(),
            port_type: serialport::SerialPortType::Unknown,
        };
        let port = DetectedPort::from(info);
        assert_eq!(port.name, "/dev/ttyS0");
        assert_eq!(port.device, DeviceKind::Unknown);
        assert!(port.vid.is_none());
    }
}
