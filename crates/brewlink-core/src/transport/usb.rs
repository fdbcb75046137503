//! USB discovery of the controller's serial endpoint.
//!
//! nusb tells us whether a controller is attached and in which mode; the
//! serialport enumeration then supplies the OS device name of its CDC
//! endpoint. The two are joined on VID/PID and, when both sides know it, the
//! USB serial number.

use nusb::{MaybeFuture, list_devices};
use serialport::{SerialPortInfo, SerialPortType};
use tracing::{debug, info, instrument, trace, warn};

use crate::device::{DeviceIdentity, DiscoveredPort};

/// A controller seen on the USB bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbCandidate {
    pub identity: DeviceIdentity,
    pub serial_number: Option<String>,
}

/// A serial port backed by a USB device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortCandidate {
    pub name: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
}

impl PortCandidate {
    fn from_info(info: SerialPortInfo) -> Option<Self> {
        match info.port_type {
            SerialPortType::UsbPort(usb) => Some(Self {
                name: info.port_name,
                vendor_id: usb.vid,
                product_id: usb.pid,
                serial_number: usb.serial_number,
            }),
            _ => None,
        }
    }

    /// macOS lists every modem twice; the `tty.` dial-in node blocks on open
    /// until carrier detect, the `cu.` callout node does not.
    fn is_dial_in(&self) -> bool {
        self.name.starts_with("/dev/tty.")
    }
}

/// Enumerate USB devices and return the first controller that exposes a
/// serial port.
#[instrument(level = "debug")]
pub fn find_controller() -> Option<DiscoveredPort> {
    let devices: Vec<UsbCandidate> = match list_devices().wait() {
        Ok(devices) => devices
            .filter_map(|d| {
                let identity = DeviceIdentity::from_ids(d.vendor_id(), d.product_id())?;
                Some(UsbCandidate {
                    identity,
                    serial_number: d.serial_number().map(str::to_owned),
                })
            })
            .collect(),
        Err(e) => {
            warn!(error = %e, "USB enumeration failed");
            return None;
        }
    };

    if devices.is_empty() {
        trace!("No controller on the USB bus");
        return None;
    }

    let ports: Vec<PortCandidate> = match serialport::available_ports() {
        Ok(ports) => ports.into_iter().filter_map(PortCandidate::from_info).collect(),
        Err(e) => {
            warn!(error = %e, "Serial port enumeration failed");
            return None;
        }
    };

    let found = match_serial_port(&devices, &ports);
    match &found {
        Some(port) => info!(
            port = %port.port,
            vid = %format!("{:04X}", port.identity.vendor_id),
            pid = %format!("{:04X}", port.identity.product_id),
            bootloader = port.identity.is_bootloader(),
            "Found controller"
        ),
        None => debug!(
            devices = devices.len(),
            "Controller present but no serial endpoint yet"
        ),
    }
    found
}

/// Pair USB devices with serial ports. Devices are tried in bus order.
pub fn match_serial_port(
    devices: &[UsbCandidate],
    ports: &[PortCandidate],
) -> Option<DiscoveredPort> {
    devices.iter().find_map(|device| {
        ports
            .iter()
            .filter(|p| {
                p.vendor_id == device.identity.vendor_id
                    && p.product_id == device.identity.product_id
            })
            .filter(|p| match (&p.serial_number, &device.serial_number) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            })
            .min_by_key(|p| p.is_dial_in())
            .map(|p| DiscoveredPort::new(p.name.clone(), device.identity))
    })
}
