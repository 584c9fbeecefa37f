//! Host-side driver for the STM32 system-memory (ROM) bootloader.
//!
//! The bootloader burned into every STM32's system memory speaks a small
//! framed command protocol (documented in ST's AN3155 for USART, AN3154 for
//! CAN and AN4221 for I2C). This crate implements the host side of that
//! protocol on top of an abstract byte-oriented [`Port`]: session
//! establishment and capability negotiation, memory read/write/erase,
//! checksum, protection toggling and execution transfer, plus the RAM-staged
//! reset stubs some parts need to get out of the bootloader again.
//!
//! Concrete transports (serial, I2C adapters, ...) live outside this crate;
//! they only need to implement [`Port`].

use thiserror::Error as ThisError;

pub mod crc;
pub mod device;
pub mod port;
pub mod session;
pub mod stub;

pub use device::{Device, DeviceFlags, DEVICES};
pub use port::{ControlLine, Flags, Port};
pub use session::{Builder, DeviceState, Session};

/// Byte the device answers with when it accepts a frame.
pub const ACK: u8 = 0x79;
/// Byte the device answers with when it rejects a frame.
pub const NACK: u8 = 0x1F;
/// Byte some bootloaders emit while a long operation is still running.
pub const BUSY: u8 = 0x76;
/// Autobaud init byte sent once to let the UART bootloader measure the host
/// baud rate.
pub const INIT: u8 = 0x7F;

/// Maximum number of bytes a single read memory command can transfer.
pub const MAX_READ_BYTES_COUNT: usize = 256;

/// Maximum number of bytes a single write memory command can transfer.
pub const MAX_WRITE_BYTES_COUNT: usize = 256;

/// Maximum number of pages a single erase command may carry.
pub const MAX_ERASE_PAGE_COUNT: usize = 512;

/// Page-count sentinel requesting erasure of the whole device.
///
/// Strictly greater than any page count the wire format can express, so a
/// real page count can never collide with it.
pub const MASS_ERASE: u32 = 0x0010_0000;

/// Raw command bytes of the bootloader protocol.
///
/// Several operations exist in two flavours: the original opcode and an
/// I2C "no-stretch" variant with a numerically greater opcode. The device
/// reports whichever subset it implements in its GET reply.
pub mod opcode {
    /// Gets the version and the allowed commands supported by the current version of the protocol.
    pub const GET: u8 = 0x00;
    /// Gets the protocol version and the read protection status.
    pub const GET_VERSION: u8 = 0x01;
    /// Gets the chip ID.
    pub const GET_ID: u8 = 0x02;
    /// Reads up to 256 bytes of memory starting from a given address.
    pub const READ_MEMORY: u8 = 0x11;
    /// Jumps to user application code located in flash memory or in SRAM.
    pub const GO: u8 = 0x21;
    /// Writes up to 256 bytes to RAM or flash starting from a given address.
    pub const WRITE_MEMORY: u8 = 0x31;
    /// No-stretch variant of [`WRITE_MEMORY`].
    pub const WRITE_MEMORY_NS: u8 = 0x32;
    /// Erases from one to all flash memory pages, one-byte page indices.
    pub const ERASE: u8 = 0x43;
    /// Erases flash pages using two-byte page indices.
    pub const EXTENDED_ERASE: u8 = 0x44;
    /// No-stretch variant of [`EXTENDED_ERASE`].
    pub const EXTENDED_ERASE_NS: u8 = 0x45;
    /// Enables write protection for some sectors.
    pub const WRITE_PROTECT: u8 = 0x63;
    /// No-stretch variant of [`WRITE_PROTECT`].
    pub const WRITE_PROTECT_NS: u8 = 0x64;
    /// Disables write protection for all flash memory sectors.
    pub const WRITE_UNPROTECT: u8 = 0x73;
    /// No-stretch variant of [`WRITE_UNPROTECT`].
    pub const WRITE_UNPROTECT_NS: u8 = 0x74;
    /// Enables readout protection.
    pub const READOUT_PROTECT: u8 = 0x82;
    /// No-stretch variant of [`READOUT_PROTECT`].
    pub const READOUT_PROTECT_NS: u8 = 0x83;
    /// Disables readout protection.
    pub const READOUT_UNPROTECT: u8 = 0x92;
    /// No-stretch variant of [`READOUT_UNPROTECT`].
    pub const READOUT_UNPROTECT_NS: u8 = 0x93;
    /// Computes a CRC over a memory area whose size is a multiple of 4 bytes.
    pub const CHECKSUM: u8 = 0xA1;
    /// Sentinel marking a command kind the bootloader does not implement.
    pub const UNSUPPORTED: u8 = 0xFF;
}

#[derive(ThisError, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The negotiated command map marks this command kind as unsupported.
    #[error("command not implemented in bootloader")]
    NoCommand,

    /// The device replied with NACK.
    #[error("received a NACK from bootloader")]
    Nack,

    /// The transport deadline elapsed without the expected bytes arriving.
    #[error("timed out waiting for bootloader")]
    Timeout,

    /// Transport fault, unexpected byte, checksum mismatch or logic failure.
    #[error("transport error or unexpected bootloader reply")]
    Unknown,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Abstract command kinds the protocol engine negotiates with the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    Get = 0,
    GetVersion,
    GetId,
    ReadMemory,
    Go,
    WriteMemory,
    Erase,
    WriteProtect,
    WriteUnprotect,
    ReadoutProtect,
    ReadoutUnprotect,
    Checksum,
}

impl Command {
    const COUNT: usize = 12;

    /// All command kinds, in negotiation-map order.
    pub const ALL: [Command; Command::COUNT] = [
        Command::Get,
        Command::GetVersion,
        Command::GetId,
        Command::ReadMemory,
        Command::Go,
        Command::WriteMemory,
        Command::Erase,
        Command::WriteProtect,
        Command::WriteUnprotect,
        Command::ReadoutProtect,
        Command::ReadoutUnprotect,
        Command::Checksum,
    ];
}

/// Command kinds mapped to the opcode the connected bootloader actually
/// reported, with [`opcode::UNSUPPORTED`] marking absent kinds.
///
/// For kinds with a legacy/no-stretch opcode pair the numerically greater
/// opcode wins; the no-stretch variants are the newer ones by convention.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandMap([u8; Command::COUNT]);

impl CommandMap {
    pub(crate) fn empty() -> Self {
        Self([opcode::UNSUPPORTED; Command::COUNT])
    }

    /// Opcode negotiated for `kind`, or `None` when the bootloader does not
    /// implement it.
    pub fn opcode(&self, kind: Command) -> Option<u8> {
        match self.0[kind as usize] {
            opcode::UNSUPPORTED => None,
            value => Some(value),
        }
    }

    pub fn supports(&self, kind: Command) -> bool {
        self.opcode(kind).is_some()
    }

    pub(crate) fn require(&self, kind: Command) -> Result<u8> {
        self.opcode(kind).ok_or(Error::NoCommand)
    }

    /// Record an opcode from the GET reply. Returns `false` when the byte
    /// does not match any known command kind.
    pub(crate) fn latch(&mut self, value: u8) -> bool {
        let kind = match value {
            opcode::GET => Command::Get,
            opcode::GET_VERSION => Command::GetVersion,
            opcode::GET_ID => Command::GetId,
            opcode::READ_MEMORY => Command::ReadMemory,
            opcode::GO => Command::Go,
            opcode::WRITE_MEMORY | opcode::WRITE_MEMORY_NS => Command::WriteMemory,
            opcode::ERASE | opcode::EXTENDED_ERASE | opcode::EXTENDED_ERASE_NS => Command::Erase,
            opcode::WRITE_PROTECT | opcode::WRITE_PROTECT_NS => Command::WriteProtect,
            opcode::WRITE_UNPROTECT | opcode::WRITE_UNPROTECT_NS => Command::WriteUnprotect,
            opcode::READOUT_PROTECT | opcode::READOUT_PROTECT_NS => Command::ReadoutProtect,
            opcode::READOUT_UNPROTECT | opcode::READOUT_UNPROTECT_NS => Command::ReadoutUnprotect,
            opcode::CHECKSUM => Command::Checksum,
            _ => return false,
        };
        let slot = &mut self.0[kind as usize];
        *slot = match *slot {
            opcode::UNSUPPORTED => value,
            current if value > current => value,
            current => current,
        };
        true
    }
}

/// Bootloader version byte, one hex nibble per component.
///
/// # Example
/// ```
/// # use stm32_sysboot::Version;
/// let ver = Version::from(0x10);
///
/// assert_eq!(1, ver.major());
/// assert_eq!(0, ver.minor());
/// assert_eq!((1, 0), ver.value());
/// ```
pub struct Version(u8);

impl Version {
    pub fn value(&self) -> (u8, u8) {
        (self.major(), self.minor())
    }

    pub fn major(&self) -> u8 {
        self.0 >> 4
    }

    pub fn minor(&self) -> u8 {
        self.0 & 0x0F
    }
}

impl From<u8> for Version {
    fn from(v: u8) -> Self {
        Self(v)
    }
}
