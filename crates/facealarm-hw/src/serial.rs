//! Serial presence channel to the alarm microcontroller.
//!
//! One ASCII byte per frame: `'1'` while a face is present, `'0'` otherwise.
//! The receiver treats every byte as the complete current state, so there is
//! no framing, acknowledgement, or retry.

use facealarm_core::Presence;
use std::io::Write;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BAUD_RATE: u32 = 9600;
/// Boards that reset when the port opens need this long before they listen.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);
const WRITE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },
    #[error("serial write failed: {0}")]
    Write(#[from] std::io::Error),
}

/// Ordered, byte-oriented link that carries presence updates.
pub trait SignalChannel {
    fn send(&mut self, presence: Presence) -> Result<(), ChannelError>;
}

/// Info about a discovered serial port.
#[derive(Debug, Clone)]
pub struct PortInfo {
    pub name: String,
    /// USB vendor:product and product string, when the port is a USB device.
    pub usb: Option<(u16, u16, Option<String>)>,
}

/// An open serial connection to the alarm board.
pub struct SerialChannel {
    port: Box<dyn serialport::SerialPort>,
    name: String,
}

impl SerialChannel {
    /// Open `port` at `baud` (8N1, no flow control), then wait `settle`
    /// before returning so the first write reaches a ready board.
    pub fn open(port: &str, baud: u32, settle: Duration) -> Result<Self, ChannelError> {
        let handle = serialport::new(port, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(WRITE_TIMEOUT)
            .open()
            .map_err(|source| ChannelError::Open {
                port: port.to_string(),
                source,
            })?;

        tracing::info!(port, baud, settle_ms = settle.as_millis() as u64, "opened serial port");

        if !settle.is_zero() {
            std::thread::sleep(settle);
        }

        Ok(Self {
            port: handle,
            name: port.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// List serial ports the OS knows about.
    pub fn list_ports() -> Vec<PortInfo> {
        let ports = match serialport::available_ports() {
            Ok(ports) => ports,
            Err(e) => {
                tracing::warn!(error = %e, "failed to enumerate serial ports");
                return Vec::new();
            }
        };

        ports
            .into_iter()
            .map(|p| {
                let usb = match p.port_type {
                    serialport::SerialPortType::UsbPort(info) => {
                        Some((info.vid, info.pid, info.product))
                    }
                    _ => None,
                };
                PortInfo {
                    name: p.port_name,
                    usb,
                }
            })
            .collect()
    }
}

impl SignalChannel for SerialChannel {
    fn send(&mut self, presence: Presence) -> Result<(), ChannelError> {
        write_presence(&mut self.port, presence)
    }
}

impl Drop for SerialChannel {
    fn drop(&mut self) {
        tracing::info!(port = %self.name, "serial port closed");
    }
}

/// Write exactly one presence byte and flush it.
pub fn write_presence<W: Write + ?Sized>(out: &mut W, presence: Presence) -> Result<(), ChannelError> {
    out.write_all(&[presence.as_byte()])?;
    out.flush()?;
    Ok(())
}
