//! Bootloader session: establishment, command framing and the memory,
//! protection and reset operations built on top of it.
//!
//! Every exchange is a strictly ordered request/response over the owned
//! [`Port`]; there is no pipelining and no concurrency. A [`Session`] is
//! created through [`Builder`], used for any number of operations, and torn
//! down by dropping it (or [`Session::into_port`] to reclaim the link).

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};

use crate::device::{self, Device, DeviceFlags};
use crate::port::{Flags, Port};
use crate::{
    crc, opcode, stub, Command, CommandMap, Error, Result, Version, ACK, BUSY, INIT,
    MASS_ERASE, MAX_ERASE_PAGE_COUNT, MAX_READ_BYTES_COUNT, MAX_WRITE_BYTES_COUNT, NACK,
};

/// Wall clock spent trying to regain framing after a desync.
const RESYNC_TIMEOUT: Duration = Duration::from_secs(35);
/// Pause between resync attempts when the link refuses writes.
const RESYNC_RETRY_DELAY: Duration = Duration::from_millis(500);
/// A mass erase can keep the device busy for a long time.
const MASS_ERASE_TIMEOUT: Duration = Duration::from_secs(35);
/// Per-page allowance for page-range erases.
const PAGE_ERASE_TIMEOUT: Duration = Duration::from_secs(5);
const BLOCK_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const WRITE_PROTECT_TIMEOUT: Duration = Duration::from_secs(1);
const WRITE_UNPROTECT_TIMEOUT: Duration = Duration::from_secs(1);
const READOUT_PROTECT_TIMEOUT: Duration = Duration::from_secs(1);
/// Readout unprotect mass-erases the flash internally before acknowledging.
const READOUT_UNPROTECT_TIMEOUT: Duration = MASS_ERASE_TIMEOUT;

/// Fallback guess for the GET reply length byte on frame-oriented links.
const GET_REPLY_GUESS: usize = 17;

/// Highest page index the extended erase wire format can address.
const MAX_PAGES: u32 = 0xFFFF;

/// Largest reply the protocol can produce: length byte plus 256 payload
/// bytes plus a trailing byte.
const REPLY_BUF: usize = 258;

/// Whether the device kept running after an acknowledged command.
///
/// The protection commands make the bootloader reset the chip right after
/// the ACK; a caller seeing [`DeviceState::Reset`] must not issue a reset of
/// its own and should consider the session finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    Running,
    Reset,
}

/// Session construction in the style of a builder.
///
/// ```no_run
/// use stm32_sysboot::{Builder, ControlLine, Flags, Port, Result};
/// # struct Link;
/// # impl Port for Link {
/// #     fn read_exact(&mut self, _: &mut [u8]) -> Result<()> { Ok(()) }
/// #     fn write_all(&mut self, _: &[u8]) -> Result<()> { Ok(()) }
/// #     fn flush(&mut self) -> Result<()> { Ok(()) }
/// #     fn set_control(&mut self, _: ControlLine, _: bool) -> Result<()> { Ok(()) }
/// #     fn flags(&self) -> Flags { Flags::BYTE }
/// #     fn config_str(&self) -> String { String::new() }
/// # }
/// # let link = Link;
/// let mut session = Builder::with_port(link).establish()?;
/// let mut buf = [0u8; 16];
/// session.read_memory(0x0800_0000, &mut buf)?;
/// # Ok::<(), stm32_sysboot::Error>(())
/// ```
pub struct Builder<P> {
    port: P,
    init: bool,
}

impl<P: Port> Builder<P> {
    pub fn with_port(port: P) -> Self {
        Self { port, init: true }
    }

    /// Skip the autobaud init byte even on transports that want one.
    ///
    /// Useful when the bootloader has already been talked to on this link;
    /// the device treats a second init byte as a command prefix.
    pub fn skip_initialization(mut self) -> Self {
        self.init = false;
        self
    }

    /// Run the full establishment sequence and return a ready session.
    pub fn establish(self) -> Result<Session<P>> {
        Session::establish(self.port, self.init)
    }
}

/// An established bootloader session.
pub struct Session<P> {
    port: P,
    version: u8,
    option1: u8,
    option2: u8,
    bl_version: u8,
    product_id: u16,
    commands: CommandMap,
    device: &'static Device,
}

impl<P: Port> Session<P> {
    fn establish(mut port: P, init: bool) -> Result<Self> {
        // Drop stale input a previous session may have left behind.
        if port.flush().is_err() {
            warn!("could not drop buffered input");
        }

        if init && port.flags().contains(Flags::CMD_INIT) {
            send_init_seq(&mut port)?;
        }

        // Product version and read-protection status.
        send_command(&mut port, opcode::GET_VERSION)?;
        let etx = port.flags().contains(Flags::GVR_ETX);
        let mut buf = [0u8; 3];
        let len = if etx { 3 } else { 1 };
        port.read_exact(&mut buf[..len]).map_err(|_| Error::Unknown)?;
        get_ack(&mut port).map_err(|_| Error::Unknown)?;
        let version = buf[0];
        let (option1, option2) = if etx { (buf[1], buf[2]) } else { (0, 0) };
        debug!("product version 0x{version:02X}, options 0x{option1:02X} 0x{option2:02X}");

        // Capability negotiation.
        let mut reply = [0u8; REPLY_BUF];
        let guess = port.get_reply_len(version).unwrap_or(GET_REPLY_GUESS);
        read_variable_reply(&mut port, opcode::GET, guess, &mut reply)?;
        let count = reply[0] as usize;
        let bl_version = reply[1];
        info!("bootloader version 0x{bl_version:02X}");
        let mut commands = CommandMap::empty();
        let mut unknown = Vec::new();
        for &code in &reply[2..count + 2] {
            if !commands.latch(code) {
                unknown.push(code);
            }
        }
        if !unknown.is_empty() {
            warn!("GET returned unknown commands: {unknown:02X?}");
        }

        // Product ID.
        read_variable_reply(&mut port, opcode::GET_ID, 1, &mut reply)?;
        let count = reply[0] as usize + 1;
        if count < 2 {
            error!("short product id reply");
            return Err(Error::Unknown);
        }
        let product_id = u16::from_be_bytes([reply[1], reply[2]]);
        if count > 2 {
            warn!("this bootloader returns {count} bytes in the product id");
        }

        let device = match device::by_product_id(product_id) {
            Some(device) => device,
            None => {
                error!("unknown/unsupported device (product id 0x{product_id:03X})");
                return Err(Error::Unknown);
            }
        };
        info!("device: {} (0x{product_id:03X})", device.name);

        if !(commands.supports(Command::Get)
            && commands.supports(Command::GetVersion)
            && commands.supports(Command::GetId))
        {
            error!("bootloader did not return correct information from GET command");
            return Err(Error::Unknown);
        }

        debug!("session established over {}", port.config_str());
        Ok(Session {
            port,
            version,
            option1,
            option2,
            bl_version,
            product_id,
            commands,
            device,
        })
    }

    pub fn device(&self) -> &'static Device {
        self.device
    }

    pub fn product_id(&self) -> u16 {
        self.product_id
    }

    /// Bootloader version reported in the GET reply.
    pub fn bootloader_version(&self) -> Version {
        Version::from(self.bl_version)
    }

    /// Product version byte from the version command.
    pub fn version(&self) -> Version {
        Version::from(self.version)
    }

    /// Option bytes from the version command; zero unless the transport
    /// declares the three-byte version reply.
    pub fn option_bytes(&self) -> (u8, u8) {
        (self.option1, self.option2)
    }

    pub fn commands(&self) -> &CommandMap {
        &self.commands
    }

    /// Give the transport back, ending the session.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Read up to 256 bytes starting at `address`.
    pub fn read_memory(&mut self, address: u32, data: &mut [u8]) -> Result<()> {
        if data.is_empty() {
            warn!("no bytes to read, doing nothing");
            return Ok(());
        }
        if data.len() > MAX_READ_BYTES_COUNT {
            error!("read length limit is {MAX_READ_BYTES_COUNT} bytes");
            return Err(Error::Unknown);
        }
        let cmd = self.commands.require(Command::ReadMemory)?;

        debug!("reading {} bytes at 0x{address:08X}", data.len());
        send_command(&mut self.port, cmd)?;
        write_checked_word(&mut self.port, address)?;
        get_ack(&mut self.port).map_err(|_| Error::Unknown)?;
        send_command(&mut self.port, (data.len() - 1) as u8)?;
        self.port.read_exact(data).map_err(|_| Error::Unknown)
    }

    /// Write up to 256 bytes starting at the 4-byte aligned `address`.
    ///
    /// Lengths that are not a multiple of 4 are padded with `0xFF` on the
    /// wire; the padding lands in memory.
    pub fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            warn!("no bytes to write, doing nothing");
            return Ok(());
        }
        if data.len() > MAX_WRITE_BYTES_COUNT {
            error!("write length limit is {MAX_WRITE_BYTES_COUNT} bytes");
            return Err(Error::Unknown);
        }
        if address % 4 != 0 {
            error!("write address alignment error");
            return Err(Error::Unknown);
        }
        let cmd = self.commands.require(Command::WriteMemory)?;

        debug!("writing {} bytes at 0x{address:08X}", data.len());
        send_command(&mut self.port, cmd)?;
        write_checked_word(&mut self.port, address)?;
        get_ack(&mut self.port).map_err(|_| Error::Unknown)?;

        let aligned = (data.len() + 3) & !3;
        let mut frame = Vec::with_capacity(aligned + 2);
        frame.push((aligned - 1) as u8);
        frame.extend_from_slice(data);
        frame.resize(aligned + 1, 0xFF);
        let checksum = frame.iter().fold(0u8, |acc, b| acc ^ b);
        frame.push(checksum);
        self.port.write_all(&frame).map_err(|_| Error::Unknown)?;

        if get_ack_timeout(&mut self.port, Some(BLOCK_WRITE_TIMEOUT)).is_err() {
            self.warn_stretching(cmd, opcode::WRITE_MEMORY_NS, "write");
            return Err(Error::Unknown);
        }
        Ok(())
    }

    /// Erase `pages` flash pages starting at `first_page`, splitting into
    /// as many wire commands as needed. [`MASS_ERASE`] as the page count
    /// erases the whole device, degrading to a full page-range erase on
    /// parts whose bootloader has no mass-erase operation.
    pub fn erase_memory(&mut self, first_page: u32, pages: u32) -> Result<()> {
        if pages == 0
            || first_page > MAX_PAGES
            || (pages != MASS_ERASE && pages > MAX_PAGES - first_page)
        {
            debug!("ignoring erase request outside the addressable page range");
            return Ok(());
        }
        let cmd = self.commands.require(Command::Erase)?;

        if pages == MASS_ERASE && !self.device.flags.contains(DeviceFlags::NO_ME) {
            return self.mass_erase(cmd);
        }

        let (mut first, mut left) = if pages == MASS_ERASE {
            warn!("mass erase is not supported by the device, falling back to page erase");
            (0, self.device.page_ceil(self.device.fl_end))
        } else {
            (first_page, pages)
        };

        // The legacy erase carries single-byte page counts.
        let batch = if cmd == opcode::ERASE {
            0x100
        } else {
            MAX_ERASE_PAGE_COUNT as u32
        };
        while left > 0 {
            let count = left.min(batch);
            self.pages_erase(cmd, first, count)?;
            first += count;
            left -= count;
        }
        Ok(())
    }

    fn mass_erase(&mut self, cmd: u8) -> Result<()> {
        info!("mass erasing flash");
        send_command(&mut self.port, cmd)?;

        if cmd == opcode::ERASE {
            // Legacy erase: page count 0xFF means the whole device and is
            // framed like a command byte.
            if send_command_timeout(&mut self.port, 0xFF, Some(MASS_ERASE_TIMEOUT)).is_err() {
                self.warn_stretching(cmd, opcode::EXTENDED_ERASE_NS, "mass erase");
                return Err(Error::Unknown);
            }
            return Ok(());
        }

        // Extended erase: magic page count 0xFFFF plus its checksum.
        self.port
            .write_all(&[0xFF, 0xFF, 0x00])
            .map_err(|_| Error::Unknown)?;
        if get_ack_timeout(&mut self.port, Some(MASS_ERASE_TIMEOUT)).is_err() {
            error!("mass erase failed, try specifying the number of pages");
            self.warn_stretching(cmd, opcode::EXTENDED_ERASE_NS, "mass erase");
            return Err(Error::Unknown);
        }
        Ok(())
    }

    fn pages_erase(&mut self, cmd: u8, first: u32, pages: u32) -> Result<()> {
        debug!("erasing {pages} pages starting at page {first}");
        send_command(&mut self.port, cmd)?;

        let mut frame;
        if cmd == opcode::ERASE {
            frame = Vec::with_capacity(pages as usize + 2);
            frame.push((pages - 1) as u8);
            for page in first..first + pages {
                frame.push(page as u8);
            }
        } else {
            frame = Vec::with_capacity(2 * pages as usize + 3);
            frame.extend_from_slice(&((pages - 1) as u16).to_be_bytes());
            for page in first..first + pages {
                frame.extend_from_slice(&(page as u16).to_be_bytes());
            }
        }
        let checksum = frame.iter().fold(0u8, |acc, b| acc ^ b);
        frame.push(checksum);
        self.port.write_all(&frame).map_err(|_| Error::Unknown)?;

        if get_ack_timeout(&mut self.port, Some(PAGE_ERASE_TIMEOUT * pages)).is_err() {
            error!("page erase failed");
            self.warn_stretching(cmd, opcode::EXTENDED_ERASE_NS, "erase");
            return Err(Error::Unknown);
        }
        Ok(())
    }

    /// Transfer execution to `address`.
    ///
    /// After the final ACK the device is running user code; the session is
    /// over and should be dropped.
    pub fn go(&mut self, address: u32) -> Result<()> {
        let cmd = self.commands.require(Command::Go)?;
        info!("jumping to 0x{address:08X}");
        send_command(&mut self.port, cmd)?;
        write_checked_word(&mut self.port, address)?;
        get_ack(&mut self.port).map_err(|_| Error::Unknown)
    }

    /// CRC over `length` bytes at `address`; both must be 4-byte aligned.
    ///
    /// Computed by the device when the bootloader implements the checksum
    /// command, otherwise by reading the memory back and running the same
    /// polynomial on the host.
    pub fn checksum(&mut self, address: u32, length: u32) -> Result<u32> {
        if address % 4 != 0 || length % 4 != 0 {
            error!("checksum address and length must be 4 byte aligned");
            return Err(Error::Unknown);
        }

        if self.commands.supports(Command::Checksum) {
            return self.device_checksum(address, length);
        }

        debug!("bootloader has no checksum command, computing on the host");
        let mut value = crc::INIT;
        let mut buf = [0u8; MAX_READ_BYTES_COUNT];
        let mut address = address;
        let mut left = length;
        while left > 0 {
            let chunk = left.min(MAX_READ_BYTES_COUNT as u32) as usize;
            if self.read_memory(address, &mut buf[..chunk]).is_err() {
                error!("failed to read memory at 0x{address:08X}, target may be read protected");
                return Err(Error::Unknown);
            }
            value = crc::update(value, &buf[..chunk]);
            address += chunk as u32;
            left -= chunk as u32;
        }
        Ok(value)
    }

    fn device_checksum(&mut self, address: u32, length: u32) -> Result<u32> {
        let cmd = self.commands.require(Command::Checksum)?;
        debug!("requesting checksum of {length} bytes at 0x{address:08X}");
        send_command(&mut self.port, cmd)?;
        write_checked_word(&mut self.port, address)?;
        get_ack(&mut self.port).map_err(|_| Error::Unknown)?;
        write_checked_word(&mut self.port, length)?;
        get_ack(&mut self.port).map_err(|_| Error::Unknown)?;
        // The compute phase is delimited by a second ACK.
        get_ack(&mut self.port).map_err(|_| Error::Unknown)?;

        let mut reply = [0u8; 5];
        self.port.read_exact(&mut reply).map_err(|_| Error::Unknown)?;
        if reply[4] != reply[0] ^ reply[1] ^ reply[2] ^ reply[3] {
            error!("checksum reply failed its own integrity check");
            return Err(Error::Unknown);
        }
        Ok(u32::from_be_bytes([reply[0], reply[1], reply[2], reply[3]]))
    }

    /// Enable write protection. The device keeps running.
    pub fn write_protect(&mut self) -> Result<DeviceState> {
        self.protect_command(
            Command::WriteProtect,
            opcode::WRITE_PROTECT_NS,
            WRITE_PROTECT_TIMEOUT,
            "write protect",
            DeviceState::Running,
        )
    }

    /// Disable write protection. The device resets itself after the ACK.
    pub fn write_unprotect(&mut self) -> Result<DeviceState> {
        self.protect_command(
            Command::WriteUnprotect,
            opcode::WRITE_UNPROTECT_NS,
            WRITE_UNPROTECT_TIMEOUT,
            "write unprotect",
            DeviceState::Reset,
        )
    }

    /// Enable readout protection. The device resets itself after the ACK.
    pub fn readout_protect(&mut self) -> Result<DeviceState> {
        self.protect_command(
            Command::ReadoutProtect,
            opcode::READOUT_PROTECT_NS,
            READOUT_PROTECT_TIMEOUT,
            "readout protect",
            DeviceState::Reset,
        )
    }

    /// Disable readout protection, mass-erasing the flash. The device
    /// resets itself after the ACK.
    pub fn readout_unprotect(&mut self) -> Result<DeviceState> {
        self.protect_command(
            Command::ReadoutUnprotect,
            opcode::READOUT_UNPROTECT_NS,
            READOUT_UNPROTECT_TIMEOUT,
            "readout unprotect",
            DeviceState::Reset,
        )
    }

    fn protect_command(
        &mut self,
        kind: Command,
        no_stretch: u8,
        timeout: Duration,
        what: &str,
        on_success: DeviceState,
    ) -> Result<DeviceState> {
        let cmd = self.commands.require(kind)?;
        info!("sending {what} command");
        send_command(&mut self.port, cmd)?;
        match get_ack_timeout(&mut self.port, Some(timeout)) {
            Ok(()) => {
                if on_success == DeviceState::Reset {
                    info!("device will reset itself now");
                }
                Ok(on_success)
            }
            Err(Error::Nack) => {
                error!("failed to {what}");
                Err(Error::Nack)
            }
            Err(_) => {
                error!("failed to {what}");
                self.warn_stretching(cmd, no_stretch, what);
                Err(Error::Unknown)
            }
        }
    }

    /// Stage raw Thumb code at the 4-byte aligned `target_address` and jump
    /// to it. The code runs with the stack and entry header described in
    /// [`stub`].
    pub fn run_raw_code(&mut self, target_address: u32, code: &[u8]) -> Result<()> {
        if target_address % 4 != 0 {
            error!("code address must be 4 byte aligned");
            return Err(Error::Unknown);
        }
        let image = stub::staging_image(target_address, code);
        let mut address = target_address;
        for chunk in image.chunks(MAX_WRITE_BYTES_COUNT) {
            self.write_memory(address, chunk)?;
            address += chunk.len() as u32;
        }
        self.go(target_address)
    }

    /// Reset the device by injecting the reset stub its family needs into
    /// RAM and executing it.
    pub fn reset_device(&mut self) -> Result<()> {
        let target = self.device.ram_start;
        if self.device.flags.contains(DeviceFlags::OBLL) {
            info!("resetting device through an option-byte reload");
            self.run_raw_code(target, stub::OBL_LAUNCH)
        } else if self.device.flags.contains(DeviceFlags::PEMPTY) {
            info!("resetting device with a flash-empty fixup");
            self.run_raw_code(target, stub::PEMPTY_LAUNCH)
        } else {
            info!("resetting device");
            self.run_raw_code(target, stub::RESET)
        }
    }

    fn warn_stretching(&self, cmd: u8, no_stretch: u8, what: &str) {
        if self.port.flags().contains(Flags::STRETCH_W) && cmd != no_stretch {
            warn!(
                "{what} failures over I2C can be caused by a link that cannot \
                 tolerate clock stretching; use a bootloader offering the \
                 no-stretch command variant"
            );
        }
    }
}

/// Send the single init byte and interpret the reply.
fn send_init_seq<P: Port>(port: &mut P) -> Result<()> {
    info!("sending autobaud init byte");
    if port.write_all(&[INIT]).is_err() {
        error!("failed to send init byte");
        return Err(Error::Unknown);
    }
    let mut byte = [0u8; 1];
    match port.read_exact(&mut byte) {
        Ok(()) if byte[0] == ACK => return Ok(()),
        Ok(()) if byte[0] == NACK => {
            // The device only answers NACK here when a previous session was
            // never closed; the link is already synchronized.
            warn!("the interface was not closed properly");
            return Ok(());
        }
        Ok(()) => {
            error!("failed to init device");
            return Err(Error::Unknown);
        }
        Err(Error::Timeout) => {}
        Err(_) => {
            error!("failed to init device");
            return Err(Error::Unknown);
        }
    }

    // No reply at all: the previous init byte may have been swallowed as the
    // first half of a command frame. A second one must then be rejected.
    debug!("no reply to init byte, probing with a second one");
    if port.write_all(&[INIT]).is_err() {
        error!("failed to send init byte");
        return Err(Error::Unknown);
    }
    match port.read_exact(&mut byte) {
        Ok(()) if byte[0] == NACK => Ok(()),
        _ => {
            error!("failed to init device");
            Err(Error::Unknown)
        }
    }
}

/// Transmit a command with its complement and consume the acknowledgement.
fn send_command<P: Port>(port: &mut P, cmd: u8) -> Result<()> {
    send_command_timeout(port, cmd, None)
}

fn send_command_timeout<P: Port>(port: &mut P, cmd: u8, timeout: Option<Duration>) -> Result<()> {
    trace!("sending command 0x{cmd:02X}");
    if port.write_all(&[cmd, cmd ^ 0xFF]).is_err() {
        error!("failed to send command");
        return Err(Error::Unknown);
    }
    match get_ack_timeout(port, timeout) {
        Ok(()) => Ok(()),
        Err(Error::Nack) => {
            warn!("got NACK from device on command 0x{cmd:02X}");
            Err(Error::Unknown)
        }
        Err(_) => {
            warn!("unexpected reply from device on command 0x{cmd:02X}");
            Err(Error::Unknown)
        }
    }
}

fn get_ack<P: Port>(port: &mut P) -> Result<()> {
    get_ack_timeout(port, None)
}

/// Read one acknowledgement byte, waiting out BUSY markers.
///
/// A read timeout is retried until `timeout` has elapsed, but only when the
/// caller supplied one and the port opted into wall-clock retries.
fn get_ack_timeout<P: Port>(port: &mut P, timeout: Option<Duration>) -> Result<()> {
    let deadline = match timeout {
        Some(timeout) if port.flags().contains(Flags::RETRY) => Some(Instant::now() + timeout),
        _ => None,
    };

    loop {
        let mut byte = [0u8; 1];
        match port.read_exact(&mut byte) {
            Ok(()) => match byte[0] {
                ACK => {
                    trace!("received ACK");
                    return Ok(());
                }
                NACK => {
                    warn!("received NACK");
                    return Err(Error::Nack);
                }
                BUSY => {
                    debug!("received BUSY, device still working");
                    continue;
                }
                other => {
                    error!("got byte 0x{other:02X} instead of ACK");
                    return Err(Error::Unknown);
                }
            },
            Err(Error::Timeout) => {
                if let Some(deadline) = deadline {
                    if Instant::now() < deadline {
                        continue;
                    }
                }
                error!("failed to read ACK byte");
                return Err(Error::Unknown);
            }
            Err(_) => {
                error!("failed to read ACK byte");
                return Err(Error::Unknown);
            }
        }
    }
}

/// Write a 32-bit value MSB-first followed by its XOR checksum.
fn write_checked_word<P: Port>(port: &mut P, value: u32) -> Result<()> {
    let bytes = value.to_be_bytes();
    let frame = [
        bytes[0],
        bytes[1],
        bytes[2],
        bytes[3],
        bytes[0] ^ bytes[1] ^ bytes[2] ^ bytes[3],
    ];
    port.write_all(&frame).map_err(|_| Error::Unknown)
}

/// Push an invalid command frame until the device answers NACK, realigning
/// host and device framing.
fn resync<P: Port>(port: &mut P) -> Result<()> {
    debug!("resynchronizing with bootloader");
    let frame = [opcode::UNSUPPORTED, 0x00];
    let deadline = Instant::now() + RESYNC_TIMEOUT;
    while Instant::now() < deadline {
        if port.write_all(&frame).is_err() {
            thread::sleep(RESYNC_RETRY_DELAY);
            continue;
        }
        let mut byte = [0u8; 1];
        if let Ok(()) = port.read_exact(&mut byte) {
            if byte[0] == NACK {
                return Ok(());
            }
        }
    }
    error!("failed to resynchronize with bootloader");
    Err(Error::Unknown)
}

/// Send a command whose reply starts with a length byte `L` and fill `buf`
/// with the length byte plus `L + 1` payload bytes.
///
/// Byte-streamed ports read the length prefix first and then exactly the
/// announced payload, with the trailing acknowledgement consumed separately.
/// Frame-oriented ports must read the whole reply in one transaction, so
/// `guess` is tried first and a wrong guess is recovered through resync.
fn read_variable_reply<P: Port>(
    port: &mut P,
    cmd: u8,
    guess: usize,
    buf: &mut [u8],
) -> Result<usize> {
    send_command(port, cmd)?;

    if port.flags().contains(Flags::BYTE) {
        port.read_exact(&mut buf[..1]).map_err(|_| Error::Unknown)?;
        let len = buf[0] as usize;
        port.read_exact(&mut buf[1..len + 2]).map_err(|_| Error::Unknown)?;
        get_ack(port).map_err(|_| Error::Unknown)?;
        return Ok(len + 2);
    }

    if port.read_exact(&mut buf[..guess + 2]).is_ok() && buf[0] as usize == guess {
        return Ok(guess + 2);
    }

    // Wrong guess. Realign, ask again just for the length byte, then
    // realign once more and fetch the complete reply.
    debug!("guessed reply length {guess} was wrong");
    resync(port)?;
    send_command(port, cmd)?;
    port.read_exact(&mut buf[..1]).map_err(|_| Error::Unknown)?;
    let len = buf[0] as usize;
    resync(port)?;
    send_command(port, cmd)?;
    port.read_exact(&mut buf[..len + 2]).map_err(|_| Error::Unknown)?;
    Ok(len + 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::ControlLine;
    use std::collections::VecDeque;

    /// Scripted in-memory port: `rx` is what the device will send, `tx`
    /// records everything the host wrote.
    struct FakePort {
        flags: Flags,
        rx: VecDeque<u8>,
        tx: Vec<u8>,
        /// Reads that fail with `Timeout` before any data flows.
        timeouts: usize,
    }

    impl FakePort {
        fn new(flags: Flags, rx: &[u8]) -> Self {
            Self {
                flags,
                rx: rx.iter().copied().collect(),
                tx: Vec::new(),
                timeouts: 0,
            }
        }
    }

    impl Port for FakePort {
        fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
            if self.timeouts > 0 {
                self.timeouts -= 1;
                return Err(Error::Timeout);
            }
            if self.rx.len() < buf.len() {
                return Err(Error::Timeout);
            }
            for slot in buf.iter_mut() {
                *slot = self.rx.pop_front().unwrap();
            }
            Ok(())
        }

        fn write_all(&mut self, buf: &[u8]) -> Result<()> {
            self.tx.extend_from_slice(buf);
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            // The script in `rx` is the device's future output, never stale
            // input, so there is nothing to drop.
            Ok(())
        }

        fn set_control(&mut self, _line: ControlLine, _level: bool) -> Result<()> {
            Ok(())
        }

        fn flags(&self) -> Flags {
            self.flags
        }

        fn config_str(&self) -> String {
            String::from("fake")
        }
    }

    /// Map with every legacy opcode latched, as a v2.2 UART bootloader
    /// reports them.
    fn uart_command_map() -> CommandMap {
        let mut map = CommandMap::empty();
        for code in [0x00, 0x01, 0x02, 0x11, 0x21, 0x31, 0x43, 0x63, 0x73, 0x82, 0x92] {
            assert!(map.latch(code));
        }
        map
    }

    fn test_session(port: FakePort, commands: CommandMap, product_id: u16) -> Session<FakePort> {
        Session {
            port,
            version: 0x22,
            option1: 0,
            option2: 0,
            bl_version: 0x22,
            product_id,
            commands,
            device: device::by_product_id(product_id).unwrap(),
        }
    }

    fn xor(bytes: &[u8]) -> u8 {
        bytes.iter().fold(0, |acc, b| acc ^ b)
    }

    #[test]
    fn establishes_session_on_byte_port() {
        #[rustfmt::skip]
        let rx = [
            ACK,                                     // init
            ACK, 0x22, 0x00, 0x00, ACK,              // version + options
            ACK, 0x0B, 0x22, 0x00, 0x01, 0x02, 0x11, // GET
            0x21, 0x31, 0x43, 0x63, 0x73, 0x82, 0x92, ACK,
            ACK, 0x01, 0x04, 0x10, ACK,              // GID
        ];
        let port = FakePort::new(Flags::BYTE | Flags::GVR_ETX | Flags::CMD_INIT, &rx);

        let session = Builder::with_port(port).establish().expect("establishment");

        assert_eq!(session.product_id(), 0x410);
        assert_eq!(session.bootloader_version().value(), (2, 2));
        assert_eq!(session.version().value(), (2, 2));
        assert_eq!(session.option_bytes(), (0, 0));
        assert_eq!(session.device().name, "STM32F10xxx Medium-density");
        let commands = session.commands();
        assert_eq!(commands.opcode(Command::WriteMemory), Some(0x31));
        assert_eq!(commands.opcode(Command::Erase), Some(0x43));
        assert_eq!(commands.opcode(Command::Checksum), None);

        let port = session.into_port();
        #[rustfmt::skip]
        let expected = [
            0x7F,       // init
            0x01, 0xFE, // version
            0x00, 0xFF, // GET
            0x02, 0xFD, // GID
        ];
        assert_eq!(port.tx, expected);
    }

    #[test]
    fn establishment_skips_init_when_asked() {
        #[rustfmt::skip]
        let rx = [
            ACK, 0x22, ACK,
            ACK, 0x0B, 0x22, 0x00, 0x01, 0x02, 0x11,
            0x21, 0x31, 0x43, 0x63, 0x73, 0x82, 0x92, ACK,
            ACK, 0x01, 0x04, 0x10, ACK,
        ];
        let port = FakePort::new(Flags::BYTE | Flags::CMD_INIT, &rx);

        let session = Builder::with_port(port)
            .skip_initialization()
            .establish()
            .expect("establishment");

        // Single-byte version reply without the option bytes.
        assert_eq!(session.option_bytes(), (0, 0));
        assert_eq!(session.into_port().tx[..2], [0x01, 0xFE]);
    }

    #[test]
    fn establishment_warns_but_continues_on_unknown_opcodes() {
        #[rustfmt::skip]
        let rx = [
            ACK, 0x22, ACK,
            ACK, 0x0C, 0x22, 0x00, 0x01, 0x02, 0x11,
            0x21, 0x31, 0x43, 0x50, 0x63, 0x73, 0x82, 0x92, ACK,
            ACK, 0x01, 0x04, 0x10, ACK,
        ];
        let port = FakePort::new(Flags::BYTE, &rx);

        let session = Builder::with_port(port).establish().expect("establishment");
        assert!(session.commands().supports(Command::Get));
        assert_eq!(session.commands().opcode(Command::Erase), Some(0x43));
    }

    #[test]
    fn establishment_fails_on_unknown_product_id() {
        #[rustfmt::skip]
        let rx = [
            ACK, 0x22, ACK,
            ACK, 0x0B, 0x22, 0x00, 0x01, 0x02, 0x11,
            0x21, 0x31, 0x43, 0x63, 0x73, 0x82, 0x92, ACK,
            ACK, 0x01, 0x07, 0x77, ACK,
        ];
        let port = FakePort::new(Flags::BYTE, &rx);

        assert_eq!(Builder::with_port(port).establish().err(), Some(Error::Unknown));
    }

    #[test]
    fn init_nack_means_open_interface() {
        let mut port = FakePort::new(Flags::BYTE | Flags::CMD_INIT, &[NACK]);
        assert_eq!(send_init_seq(&mut port), Ok(()));
        assert_eq!(port.tx, [INIT]);
    }

    #[test]
    fn init_retries_with_second_byte_on_timeout() {
        let mut port = FakePort::new(Flags::BYTE | Flags::CMD_INIT, &[NACK]);
        port.timeouts = 1;
        assert_eq!(send_init_seq(&mut port), Ok(()));
        assert_eq!(port.tx, [INIT, INIT]);
    }

    #[test]
    fn init_gives_up_when_second_byte_is_not_nacked() {
        let mut port = FakePort::new(Flags::BYTE | Flags::CMD_INIT, &[ACK]);
        port.timeouts = 1;
        assert_eq!(send_init_seq(&mut port), Err(Error::Unknown));
        assert_eq!(port.tx, [INIT, INIT]);
    }

    #[test]
    fn ack_loop_waits_out_busy() {
        let mut port = FakePort::new(Flags::NONE, &[BUSY, BUSY, ACK]);
        assert_eq!(get_ack(&mut port), Ok(()));
        assert!(port.rx.is_empty());
    }

    #[test]
    fn ack_loop_rejects_garbage() {
        let mut port = FakePort::new(Flags::NONE, &[0x42]);
        assert_eq!(get_ack(&mut port), Err(Error::Unknown));
    }

    #[test]
    fn ack_timeout_retries_only_with_retry_capability() {
        let mut port = FakePort::new(Flags::RETRY, &[ACK]);
        port.timeouts = 3;
        assert_eq!(get_ack_timeout(&mut port, Some(Duration::from_secs(35))), Ok(()));

        let mut port = FakePort::new(Flags::NONE, &[ACK]);
        port.timeouts = 3;
        assert_eq!(
            get_ack_timeout(&mut port, Some(Duration::from_secs(35))),
            Err(Error::Unknown)
        );

        // Without a caller timeout the retry capability does not matter.
        let mut port = FakePort::new(Flags::RETRY, &[ACK]);
        port.timeouts = 1;
        assert_eq!(get_ack_timeout(&mut port, None), Err(Error::Unknown));
    }

    #[test]
    fn command_frames_carry_complement() {
        let mut port = FakePort::new(Flags::NONE, &[ACK, ACK, ACK]);
        send_command(&mut port, 0x11).unwrap();
        send_command(&mut port, 0x92).unwrap();
        send_command(&mut port, 0x00).unwrap();
        assert_eq!(port.tx, [0x11, 0xEE, 0x92, 0x6D, 0x00, 0xFF]);
        for frame in port.tx.chunks(2) {
            assert_eq!(frame[0] ^ frame[1], 0xFF);
        }
    }

    #[test]
    fn checked_word_frames() {
        let mut port = FakePort::new(Flags::NONE, &[]);
        write_checked_word(&mut port, 0x0800_0000).unwrap();
        write_checked_word(&mut port, 0x2000_0200).unwrap();
        assert_eq!(
            port.tx,
            [0x08, 0x00, 0x00, 0x00, 0x08, 0x20, 0x00, 0x02, 0x00, 0x22]
        );
        for frame in port.tx.chunks(5) {
            assert_eq!(xor(&frame[..4]), frame[4]);
        }
    }

    #[test]
    fn read_memory_wire_format() {
        let mut session = test_session(
            FakePort::new(Flags::BYTE, &[ACK, ACK, ACK, 0xDE, 0xAD, 0xBE, 0xEF]),
            uart_command_map(),
            0x410,
        );
        let mut data = [0u8; 4];
        session.read_memory(0x0800_0000, &mut data).unwrap();
        assert_eq!(data, [0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(
            session.port.tx,
            [0x11, 0xEE, 0x08, 0x00, 0x00, 0x00, 0x08, 0x03, 0xFC]
        );
    }

    #[test]
    fn read_memory_needs_the_command() {
        let mut map = CommandMap::empty();
        map.latch(0x31);
        let mut session = test_session(FakePort::new(Flags::BYTE, &[]), map, 0x410);
        let mut data = [0u8; 4];
        assert_eq!(
            session.read_memory(0x0800_0000, &mut data),
            Err(Error::NoCommand)
        );
        assert!(session.port.tx.is_empty());
    }

    #[test]
    fn write_memory_wire_format() {
        let mut session = test_session(
            FakePort::new(Flags::BYTE, &[ACK, ACK, ACK]),
            uart_command_map(),
            0x410,
        );
        session
            .write_memory(0x0800_0000, &[0xDE, 0xAD, 0xBE, 0xEF])
            .unwrap();
        #[rustfmt::skip]
        let expected = [
            0x31, 0xCE,                   // command
            0x08, 0x00, 0x00, 0x00, 0x08, // address
            0x03, 0xDE, 0xAD, 0xBE, 0xEF, 0x21, // N-1, data, checksum
        ];
        assert_eq!(session.port.tx, expected);
    }

    #[test]
    fn write_memory_pads_to_word_multiple() {
        let mut session = test_session(
            FakePort::new(Flags::BYTE, &[ACK, ACK, ACK]),
            uart_command_map(),
            0x410,
        );
        session.write_memory(0x0800_0000, &[0x01, 0x02, 0x03]).unwrap();

        let payload = &session.port.tx[7..];
        assert_eq!(payload, [0x03, 0x01, 0x02, 0x03, 0xFF, 0xFC]);
        // Checksum covers the count byte, the data and the padding.
        assert_eq!(xor(&payload[..payload.len() - 1]), payload[payload.len() - 1]);
    }

    #[test]
    fn write_memory_rejects_unaligned_address_before_any_traffic() {
        let mut session = test_session(FakePort::new(Flags::BYTE, &[]), uart_command_map(), 0x410);
        assert_eq!(
            session.write_memory(0x0800_0001, &[0x00]),
            Err(Error::Unknown)
        );
        assert!(session.port.tx.is_empty());
    }

    #[test]
    fn write_memory_rejects_oversized_blocks() {
        let mut session = test_session(FakePort::new(Flags::BYTE, &[]), uart_command_map(), 0x410);
        let data = [0u8; 257];
        assert_eq!(session.write_memory(0x0800_0000, &data), Err(Error::Unknown));
        assert!(session.port.tx.is_empty());
    }

    #[test]
    fn legacy_mass_erase() {
        let mut session = test_session(
            FakePort::new(Flags::BYTE, &[ACK, ACK]),
            uart_command_map(),
            0x410,
        );
        session.erase_memory(0, MASS_ERASE).unwrap();
        assert_eq!(session.port.tx, [0x43, 0xBC, 0xFF, 0x00]);
    }

    #[test]
    fn extended_mass_erase() {
        let mut map = uart_command_map();
        map.latch(0x44);
        let mut session = test_session(FakePort::new(Flags::BYTE, &[ACK, ACK]), map, 0x413);
        session.erase_memory(0, MASS_ERASE).unwrap();
        assert_eq!(session.port.tx, [0x44, 0xBB, 0xFF, 0xFF, 0x00]);
    }

    #[test]
    fn legacy_page_erase_payload() {
        let mut session = test_session(
            FakePort::new(Flags::BYTE, &[ACK, ACK]),
            uart_command_map(),
            0x410,
        );
        session.erase_memory(3, 2).unwrap();
        // Count-1, page list, XOR over all of it.
        assert_eq!(session.port.tx, [0x43, 0xBC, 0x01, 0x03, 0x04, 0x06]);
    }

    #[test]
    fn extended_page_erase_payload() {
        let mut map = uart_command_map();
        map.latch(0x44);
        let mut session = test_session(FakePort::new(Flags::BYTE, &[ACK, ACK]), map, 0x413);
        session.erase_memory(256, 2).unwrap();
        #[rustfmt::skip]
        let expected = [
            0x44, 0xBB,
            0x00, 0x01,             // count - 1
            0x01, 0x00, 0x01, 0x01, // pages 256 and 257
            0x00,                   // checksum
        ];
        assert_eq!(session.port.tx, expected);
    }

    #[test]
    fn mass_erase_degrades_to_page_ranges_without_the_opcode() {
        let mut map = uart_command_map();
        map.latch(0x44);
        // L1 Cat.1: no mass erase, 512 pages of 256 bytes.
        let mut session = test_session(FakePort::new(Flags::BYTE, &[ACK, ACK]), map, 0x416);
        session.erase_memory(0, MASS_ERASE).unwrap();

        let tx = &session.port.tx;
        assert_eq!(tx[..2], [0x44, 0xBB]);
        // Page-range payload, not the mass-erase magic.
        assert_ne!(tx[2..5], [0xFF, 0xFF, 0x00]);
        assert_eq!(tx.len(), 2 + 2 + 2 * 512 + 1);
        assert_eq!(tx[2..4], [0x01, 0xFF]); // count - 1 = 511
        assert_eq!(tx[4..6], [0x00, 0x00]); // first page
        assert_eq!(tx[tx.len() - 3..tx.len() - 1], [0x01, 0xFF]); // last page
        assert_eq!(xor(&tx[2..tx.len() - 1]), tx[tx.len() - 1]);
    }

    #[test]
    fn page_erase_batches_at_512_pages() {
        let mut map = uart_command_map();
        map.latch(0x44);
        let mut session = test_session(FakePort::new(Flags::BYTE, &[ACK; 4]), map, 0x413);
        session.erase_memory(0, 1000).unwrap();

        let tx = &session.port.tx;
        // First command: 512 pages -> 2 + 2 + 1024 + 1 payload bytes.
        let first_payload = 2 + 2 * 512 + 1;
        assert_eq!(tx[..2], [0x44, 0xBB]);
        assert_eq!(tx[2..4], [0x01, 0xFF]);
        // Second command follows immediately with the remaining 488 pages.
        let second = 2 + first_payload;
        assert_eq!(tx[second..second + 2], [0x44, 0xBB]);
        assert_eq!(tx[second + 2..second + 4], [0x01, 0xE7]);
        assert_eq!(tx.len(), second + 2 + 2 + 2 * 488 + 1);
    }

    #[test]
    fn erase_ignores_out_of_range_requests() {
        let mut session = test_session(FakePort::new(Flags::BYTE, &[]), uart_command_map(), 0x410);
        session.erase_memory(0, 0).unwrap();
        session.erase_memory(0x1_0000, 1).unwrap();
        session.erase_memory(0xFFFF, 2).unwrap();
        assert!(session.port.tx.is_empty());
    }

    #[test]
    fn go_wire_format() {
        let mut session = test_session(
            FakePort::new(Flags::BYTE, &[ACK, ACK]),
            uart_command_map(),
            0x410,
        );
        session.go(0x0800_0000).unwrap();
        assert_eq!(session.port.tx, [0x21, 0xDE, 0x08, 0x00, 0x00, 0x00, 0x08]);
    }

    #[test]
    fn device_checksum_round_trip() {
        let mut map = uart_command_map();
        map.latch(0xA1);
        let reply_xor = 0xC7 ^ 0x04 ^ 0xDD ^ 0x7B;
        let mut session = test_session(
            FakePort::new(
                Flags::BYTE,
                &[ACK, ACK, ACK, ACK, 0xC7, 0x04, 0xDD, 0x7B, reply_xor],
            ),
            map,
            0x410,
        );
        assert_eq!(session.checksum(0x0800_0000, 4), Ok(0xC704_DD7B));
        #[rustfmt::skip]
        let expected = [
            0xA1, 0x5E,
            0x08, 0x00, 0x00, 0x00, 0x08, // address
            0x00, 0x00, 0x00, 0x04, 0x04, // length
        ];
        assert_eq!(session.port.tx, expected);
    }

    #[test]
    fn device_checksum_rejects_corrupt_reply() {
        let mut map = uart_command_map();
        map.latch(0xA1);
        let mut session = test_session(
            FakePort::new(Flags::BYTE, &[ACK, ACK, ACK, ACK, 0xC7, 0x04, 0xDD, 0x7B, 0x00]),
            map,
            0x410,
        );
        assert_eq!(session.checksum(0x0800_0000, 4), Err(Error::Unknown));
    }

    #[test]
    fn checksum_requires_word_alignment() {
        let mut session = test_session(FakePort::new(Flags::BYTE, &[]), uart_command_map(), 0x410);
        assert_eq!(session.checksum(0x0800_0002, 4), Err(Error::Unknown));
        assert_eq!(session.checksum(0x0800_0000, 6), Err(Error::Unknown));
        assert!(session.port.tx.is_empty());
    }

    #[test]
    fn checksum_falls_back_to_host_computation() {
        // No 0xA1 in the map: the engine reads the memory back instead.
        let mut session = test_session(
            FakePort::new(Flags::BYTE, &[ACK, ACK, ACK, 0x00, 0x00, 0x00, 0x00]),
            uart_command_map(),
            0x410,
        );
        assert_eq!(session.checksum(0x0800_0000, 4), Ok(0xC704_DD7B));
        // The wire saw a read, not a checksum command.
        assert_eq!(session.port.tx[..2], [0x11, 0xEE]);
    }

    #[test]
    fn protect_operations_report_the_self_reset() {
        let map = uart_command_map();

        let mut session = test_session(FakePort::new(Flags::BYTE, &[ACK, ACK]), map, 0x410);
        assert_eq!(session.readout_unprotect(), Ok(DeviceState::Reset));
        assert_eq!(session.port.tx, [0x92, 0x6D]);

        let mut session = test_session(FakePort::new(Flags::BYTE, &[ACK, ACK]), map, 0x410);
        assert_eq!(session.readout_protect(), Ok(DeviceState::Reset));

        let mut session = test_session(FakePort::new(Flags::BYTE, &[ACK, ACK]), map, 0x410);
        assert_eq!(session.write_unprotect(), Ok(DeviceState::Reset));

        // Write protect leaves the device running.
        let mut session = test_session(FakePort::new(Flags::BYTE, &[ACK, ACK]), map, 0x410);
        assert_eq!(session.write_protect(), Ok(DeviceState::Running));
    }

    #[test]
    fn protect_nack_is_surfaced_as_nack() {
        let mut session = test_session(
            FakePort::new(Flags::BYTE, &[ACK, NACK]),
            uart_command_map(),
            0x410,
        );
        assert_eq!(session.readout_unprotect(), Err(Error::Nack));
    }

    #[test]
    fn reset_device_stages_stub_and_jumps() {
        let mut session = test_session(
            FakePort::new(Flags::BYTE, &[ACK; 5]),
            uart_command_map(),
            0x410,
        );
        session.reset_device().unwrap();

        let tx = &session.port.tx;
        // One write covers the 24-byte image.
        assert_eq!(tx[..2], [0x31, 0xCE]);
        assert_eq!(tx[2..7], [0x20, 0x00, 0x02, 0x00, 0x22]);
        assert_eq!(tx[7], 23); // image length - 1
        assert_eq!(tx[8..12], 0x2000_2000u32.to_le_bytes()); // stack pointer
        assert_eq!(tx[12..16], 0x2000_0209u32.to_le_bytes()); // Thumb entry
        assert_eq!(tx[16..32], *stub::RESET);
        assert_eq!(xor(&tx[7..32]), tx[32]);
        // Then the jump to the staging address.
        assert_eq!(tx[33..40], [0x21, 0xDE, 0x20, 0x00, 0x02, 0x00, 0x22]);
    }

    #[test]
    fn reset_device_picks_the_quirk_stub() {
        // F09x needs the option-byte reload stub.
        let mut session = test_session(
            FakePort::new(Flags::BYTE, &[ACK; 5]),
            uart_command_map(),
            0x442,
        );
        session.reset_device().unwrap();
        let tx = session.port.tx.clone();
        assert_eq!(tx[16..32], *stub::OBL_LAUNCH);

        // G0 parts get the flash-empty fixup.
        let mut session = test_session(
            FakePort::new(Flags::BYTE, &[ACK; 5]),
            uart_command_map(),
            0x466,
        );
        session.reset_device().unwrap();
        let tx = session.port.tx.clone();
        assert_eq!(tx[16..16 + 48], *stub::PEMPTY_LAUNCH);
    }

    #[test]
    fn run_raw_code_chunks_ascending() {
        let mut session = test_session(
            FakePort::new(Flags::BYTE, &[ACK; 8]),
            uart_command_map(),
            0x410,
        );
        let code = vec![0xAA; 300];
        session.run_raw_code(0x2000_0200, &code).unwrap();

        let tx = &session.port.tx;
        // First chunk at the target address.
        assert_eq!(tx[..7], [0x31, 0xCE, 0x20, 0x00, 0x02, 0x00, 0x22]);
        assert_eq!(tx[7], 255);
        // Second chunk 256 bytes later: 308 - 256 = 52 bytes.
        let second = 7 + 1 + 256 + 1;
        assert_eq!(
            tx[second..second + 7],
            [0x31, 0xCE, 0x20, 0x00, 0x03, 0x00, 0x23]
        );
        assert_eq!(tx[second + 7], 51);
    }

    #[test]
    fn run_raw_code_rejects_unaligned_target() {
        let mut session = test_session(FakePort::new(Flags::BYTE, &[]), uart_command_map(), 0x410);
        assert_eq!(
            session.run_raw_code(0x2000_0201, stub::RESET),
            Err(Error::Unknown)
        );
        assert!(session.port.tx.is_empty());
    }

    #[test]
    fn variable_reply_resyncs_after_a_wrong_guess() {
        // Frame-oriented port; the device claims length 2 while we guess 1.
        #[rustfmt::skip]
        let rx = [
            ACK,              // command ack
            0x02, 0xAA, 0xBB, // reply not matching the guess
            NACK,             // resync
            ACK,              // command ack
            0x02,             // announced length
            NACK,             // resync
            ACK,              // command ack
            0x02, 0x04, 0x10, 0x55, // full reply
        ];
        let mut port = FakePort::new(Flags::NONE, &rx);
        let mut buf = [0u8; REPLY_BUF];

        let total = read_variable_reply(&mut port, 0x02, 1, &mut buf).unwrap();

        assert_eq!(total, 4);
        assert_eq!(buf[..4], [0x02, 0x04, 0x10, 0x55]);
        // Only invalid-command probes between the retries, no data reads.
        #[rustfmt::skip]
        let expected = [
            0x02, 0xFD,
            0xFF, 0x00,
            0x02, 0xFD,
            0xFF, 0x00,
            0x02, 0xFD,
        ];
        assert_eq!(port.tx, expected);
    }

    #[test]
    fn variable_reply_takes_the_frame_fast_path_on_a_good_guess() {
        let rx = [ACK, 0x01, 0x04, 0x10];
        let mut port = FakePort::new(Flags::NONE, &rx);
        let mut buf = [0u8; REPLY_BUF];

        let total = read_variable_reply(&mut port, 0x02, 1, &mut buf).unwrap();

        assert_eq!(total, 3);
        assert_eq!(buf[..3], [0x01, 0x04, 0x10]);
        assert_eq!(port.tx, [0x02, 0xFD]);
    }
}
