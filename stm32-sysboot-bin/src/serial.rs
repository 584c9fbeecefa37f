//! Serial transport for the bootloader engine.

use std::io::Read;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use log::{debug, info};
use stm32_sysboot::{ControlLine, Error, Flags, Port, Result};

/// Default baud rate of the UART bootloader.
pub const DEFAULT_BAUDRATE: u32 = 57_600;

/// A [`Port`] over a local serial device.
///
/// The UART bootloader talks 8E1 and announces itself after an autobaud
/// init byte, so the link declares `BYTE`, `GVR_ETX`, `CMD_INIT` and
/// `RETRY`.
pub struct SerialLink {
    serial: Box<dyn serialport::SerialPort>,
    config: String,
}

impl SerialLink {
    pub fn open(path: &str, baud_rate: u32, timeout: Duration) -> anyhow::Result<Self> {
        info!("opening serial port: {path} {baud_rate} 8E1");
        let serial = serialport::new(path, baud_rate)
            .parity(serialport::Parity::Even)
            .stop_bits(serialport::StopBits::One)
            .data_bits(serialport::DataBits::Eight)
            .timeout(timeout)
            .open()
            .context("Failed to open serialport device")?;
        Ok(Self {
            serial,
            config: format!("{path} {baud_rate} 8E1"),
        })
    }

    /// Reset the target into its ROM bootloader over the modem lines, with
    /// RTS wired to reset and DTR to BOOT0 (or swapped when `inverted`).
    pub fn enter_bootloader(&mut self, inverted: bool) -> anyhow::Result<()> {
        debug!("pulsing control lines to enter bootloader");
        let (boot, reset) = if inverted {
            (ControlLine::Rts, ControlLine::Dtr)
        } else {
            (ControlLine::Dtr, ControlLine::Rts)
        };
        self.set_control(boot, true)?;
        self.set_control(reset, true)?;
        thread::sleep(Duration::from_millis(100));
        self.set_control(reset, false)?;
        // Give the ROM time to sample BOOT0 and start listening.
        thread::sleep(Duration::from_millis(100));
        self.set_control(boot, false)?;
        Ok(())
    }
}

impl Port for SerialLink {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let deadline = Instant::now() + self.serial.timeout();
        let mut filled = 0;
        while filled < buf.len() {
            match self.serial.read(&mut buf[filled..]) {
                Ok(0) => return Err(Error::Unknown),
                Ok(n) => filled += n,
                Err(e)
                    if e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => return Err(Error::Unknown),
            }
        }
        Ok(())
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        use std::io::Write;
        self.serial.write_all(buf).map_err(|_| Error::Unknown)?;
        self.serial.flush().map_err(|_| Error::Unknown)
    }

    fn flush(&mut self) -> Result<()> {
        self.serial
            .clear(serialport::ClearBuffer::Input)
            .map_err(|_| Error::Unknown)
    }

    fn set_control(&mut self, line: ControlLine, level: bool) -> Result<()> {
        match line {
            ControlLine::Rts => self
                .serial
                .write_request_to_send(level)
                .map_err(|_| Error::Unknown),
            ControlLine::Dtr => self
                .serial
                .write_data_terminal_ready(level)
                .map_err(|_| Error::Unknown),
            // Break is not routed on plain USB-serial adapters.
            ControlLine::Brk => Ok(()),
        }
    }

    fn flags(&self) -> Flags {
        Flags::BYTE | Flags::GVR_ETX | Flags::CMD_INIT | Flags::RETRY
    }

    fn config_str(&self) -> String {
        self.config.clone()
    }
}
