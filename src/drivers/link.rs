// src/drivers/link.rs
use std::collections::VecDeque;
use std::io::{ErrorKind, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use log::{debug, info};
use serialport::{SerialPort, SerialPortType};
use crate::config::AcquisitionConfig;
use crate::drivers::framing::LineAssembler;
use crate::drivers::AcquisitionError;
/// Shared stop flag. Tripping it makes any in-flight `read_line` return
/// `LineRead::Cancelled` within one poll slice.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);
impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LineRead {
    Line(String),
    Timeout,
    Cancelled,
}
/// Line-oriented connection to the SMU microcontroller.
pub trait DeviceLink {
    /// Sends `line` followed by a newline and flushes it.
    fn send_line(&mut self, line: &str) -> Result<(), AcquisitionError>;
    /// Reads one newline-terminated line, trimmed, bounded by the link timeout.
    fn read_line(&mut self, cancel: &CancelToken) -> Result<LineRead, AcquisitionError>;
    /// Hardware reset handshake performed on a freshly opened link.
    fn reset(&mut self) -> Result<(), AcquisitionError>;
    fn close(&mut self) -> Result<(), AcquisitionError>;
}
/// Something that can open a `DeviceLink`.
pub trait Connector {
    type Link: DeviceLink;
    fn connect(&mut self) -> Result<Self::Link, AcquisitionError>;
}
/// Opens the SMU over a serial port, discovered by USB vendor id unless a
/// port name is configured.
pub struct SerialConnector {
    config: AcquisitionConfig,
}
impl SerialConnector {
    pub fn new(config: AcquisitionConfig) -> Self {
        Self { config }
    }
}
impl Connector for SerialConnector {
    type Link = SerialLink;
    fn connect(&mut self) -> Result<SerialLink, AcquisitionError> {
        let port_name = match &self.config.port_name {
            Some(name) => name.clone(),
            None => find_port(self.config.usb_vid)?,
        };
        let port = serialport::new(&port_name, self.config.baud_rate)
            .timeout(self.config.poll_slice())
            .open()?;
        info!("Serial connected on {port_name}");
        Ok(SerialLink {
            port,
            port_name,
            lines: LineAssembler::new(self.config.max_line_bytes),
            read_timeout: self.config.read_timeout(),
            reset_settle: self.config.reset_settle(),
        })
    }
}
/// Description of one serial port, for listing.
#[derive(Clone, Debug, serde::Serialize)]
pub struct PortSummary {
    pub port_name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub product: Option<String>,
}
pub fn list_ports() -> Result<Vec<PortSummary>, AcquisitionError> {
    Ok(serialport::available_ports()?
        .into_iter()
        .map(|info| match info.port_type {
            SerialPortType::UsbPort(usb) => PortSummary {
                port_name: info.port_name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                product: usb.product,
            },
            _ => PortSummary {
                port_name: info.port_name,
                vid: None,
                pid: None,
                product: None,
            },
        })
        .collect())
}
fn find_port(vid: u16) -> Result<String, AcquisitionError> {
    list_ports()?
        .into_iter()
        .find(|port| port.vid == Some(vid))
        .map(|port| port.port_name)
        .ok_or(AcquisitionError::DeviceNotFound { vid })
}
pub struct SerialLink {
    port: Box<dyn SerialPort>,
    port_name: String,
    lines: LineAssembler,
    read_timeout: Duration,
    reset_settle: Duration,
}
impl DeviceLink for SerialLink {
    fn send_line(&mut self, line: &str) -> Result<(), AcquisitionError> {
        self.port.write_all(format!("{line}\n").as_bytes())?;
        self.port.flush()?;
        debug!("Sent {line:?} to {}", self.port_name);
        Ok(())
    }
    fn read_line(&mut self, cancel: &CancelToken) -> Result<LineRead, AcquisitionError> {
        let deadline = Instant::now() + self.read_timeout;
        let mut chunk = [0u8; 256];
        loop {
            if let Some(line) = self.lines.next_line() {
                return Ok(LineRead::Line(line));
            }
            if cancel.is_cancelled() {
                return Ok(LineRead::Cancelled);
            }
            if Instant::now() >= deadline {
                return Ok(LineRead::Timeout);
            }
            self.lines.fill_from(&mut self.port, &mut chunk)?;
        }
    }
    fn reset(&mut self) -> Result<(), AcquisitionError> {
        self.port.write_data_terminal_ready(false)?;
        thread::sleep(self.reset_settle);
        self.port.write_data_terminal_ready(true)?;
        self.lines.clear();
        Ok(())
    }
    fn close(&mut self) -> Result<(), AcquisitionError> {
        self.port.flush()?;
        self.lines.clear();
        info!("Serial connection {} closed", self.port_name);
        Ok(())
    }
}
/// Observable side of a scripted link: the commands it received and how
/// often it was opened and reset.
#[derive(Clone, Debug, Default)]
pub struct ScriptLog {
    sent: Arc<Mutex<Vec<String>>>,
    connects: Arc<AtomicUsize>,
    resets: Arc<AtomicUsize>,
}
impl ScriptLog {
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}
/// In-memory connector that replays fixed device output; useful for tests and
/// offline playback of captured serial logs.
pub struct ScriptedConnector {
    lines: VecDeque<String>,
    fail_when_exhausted: bool,
    available: bool,
    log: ScriptLog,
}
impl ScriptedConnector {
    pub fn new(lines: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
            fail_when_exhausted: false,
            available: true,
            log: ScriptLog::default(),
        }
    }
    /// Reading past the end of the script raises an I/O error instead of timing out.
    pub fn failing_when_exhausted(mut self) -> Self {
        self.fail_when_exhausted = true;
        self
    }
    /// Simulates an unplugged device.
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }
    pub fn log(&self) -> ScriptLog {
        self.log.clone()
    }
}
impl Connector for ScriptedConnector {
    type Link = ScriptedLink;
    fn connect(&mut self) -> Result<ScriptedLink, AcquisitionError> {
        if !self.available {
            return Err(AcquisitionError::DeviceNotFound {
                vid: crate::config::TEENSY_VID,
            });
        }
        self.log.connects.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedLink {
            lines: std::mem::take(&mut self.lines),
            fail_when_exhausted: self.fail_when_exhausted,
            log: self.log.clone(),
        })
    }
}
pub struct ScriptedLink {
    lines: VecDeque<String>,
    fail_when_exhausted: bool,
    log: ScriptLog,
}
impl DeviceLink for ScriptedLink {
    fn send_line(&mut self, line: &str) -> Result<(), AcquisitionError> {
        if let Ok(mut sent) = self.log.sent.lock() {
            sent.push(line.to_string());
        }
        Ok(())
    }
    fn read_line(&mut self, cancel: &CancelToken) -> Result<LineRead, AcquisitionError> {
        if cancel.is_cancelled() {
            return Ok(LineRead::Cancelled);
        }
        match self.lines.pop_front() {
            Some(line) => Ok(LineRead::Line(line.trim().to_string())),
            None if self.fail_when_exhausted => Err(AcquisitionError::Io(
                std::io::Error::new(ErrorKind::BrokenPipe, "scripted device unplugged"),
            )),
            None => Ok(LineRead::Timeout),
        }
    }
    fn reset(&mut self) -> Result<(), AcquisitionError> {
        self.log.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn close(&mut self) -> Result<(), AcquisitionError> {
        Ok(())
    }
}
