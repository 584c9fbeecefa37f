use anyhow::{bail, Context};
use clap::Parser;
use log::{debug, info};
use std::fs;
use std::time::Duration;

use stm32_sysboot::{
    Builder, Command as BootCommand, DeviceState, Session, MASS_ERASE, MAX_READ_BYTES_COUNT,
    MAX_WRITE_BYTES_COUNT,
};

mod serial;
use serial::{SerialLink, DEFAULT_BAUDRATE};

#[derive(clap::Parser)]
#[command(author, version, about, long_about = None)]
struct Opt {
    /// Serial port
    #[arg(short, long, default_value_t = String::from("/dev/ttyUSB0"))]
    port: String,

    /// Baud rate
    #[arg(short, long, default_value_t = DEFAULT_BAUDRATE)]
    baud_rate: u32,

    /// Serial read timeout in milliseconds
    #[arg(long, default_value_t = 1000)]
    timeout: u64,

    /// Skip sending the autobaud init byte
    #[arg(short, long)]
    skip_initialization: bool,

    /// Pulse RTS/DTR to reset the target into its bootloader first
    #[arg(short, long)]
    enter: bool,

    /// Swap the RTS/DTR wiring used by --enter
    #[arg(long)]
    inverted: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Print bootloader and device information to stdout
    Info,
    /// Flash new firmware from a raw binary file
    Flash {
        /// Filename of raw firmware binary
        file: String,

        /// Starting address to write firmware to
        #[arg(short, long, default_value_t = String::from("0x08000000"))]
        address: String,

        /// Skip reading the firmware back for verification
        #[arg(long)]
        no_verify: bool,
    },
    /// Read memory into a raw binary file
    Read {
        /// Filename to write the memory contents to
        file: String,

        /// Starting address to read from
        #[arg(short, long, default_value_t = String::from("0x08000000"))]
        address: String,

        /// Number of bytes to read
        #[arg(short, long)]
        length: u32,
    },
    /// Erase flash pages
    Erase {
        /// Erase the whole device
        #[arg(long, conflicts_with_all = ["first", "pages"])]
        all: bool,

        /// First page to erase
        #[arg(long, default_value_t = 0)]
        first: u32,

        /// Number of pages to erase
        #[arg(long, default_value_t = 0)]
        pages: u32,
    },
    /// Jump to code at the given address
    Go {
        /// Address to transfer execution to
        #[arg(short, long, default_value_t = String::from("0x08000000"))]
        address: String,
    },
    /// Compute a CRC over a memory range
    Crc {
        /// Starting address, 4-byte aligned
        #[arg(short, long, default_value_t = String::from("0x08000000"))]
        address: String,

        /// Number of bytes, a multiple of 4
        #[arg(short, long)]
        length: u32,
    },
    /// Enable write protection
    WriteProtect,
    /// Disable write protection
    WriteUnprotect,
    /// Enable readout protection
    ReadoutProtect,
    /// Disable readout protection (mass-erases the flash)
    ReadoutUnprotect,
    /// Reset the device by staging a reset stub in RAM
    Reset,
}

fn parse_address(text: &str) -> anyhow::Result<u32> {
    u32::from_str_radix(text.trim_start_matches("0x"), 16)
        .with_context(|| format!("Unable to parse address from string: {text}"))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Opt::parse();

    let mut link = SerialLink::open(&cli.port, cli.baud_rate, Duration::from_millis(cli.timeout))?;
    if cli.enter {
        link.enter_bootloader(cli.inverted)?;
    }

    let builder = Builder::with_port(link);
    let builder = if cli.skip_initialization {
        builder.skip_initialization()
    } else {
        builder
    };
    let mut session = builder
        .establish()
        .context("Failed to establish bootloader session")?;

    match cli.command.unwrap_or(Command::Info) {
        Command::Info => print_info(&session),
        Command::Flash {
            file,
            address,
            no_verify,
        } => flash(&mut session, &file, parse_address(&address)?, !no_verify)?,
        Command::Read {
            file,
            address,
            length,
        } => read_to_file(&mut session, &file, parse_address(&address)?, length)?,
        Command::Erase { all, first, pages } => {
            if all {
                session.erase_memory(0, MASS_ERASE)?;
            } else if pages == 0 {
                bail!("Nothing to erase; pass --pages or --all");
            } else {
                session.erase_memory(first, pages)?;
            }
            println!("Erase complete");
        }
        Command::Go { address } => {
            session.go(parse_address(&address)?)?;
        }
        Command::Crc { address, length } => {
            let crc = session.checksum(parse_address(&address)?, length)?;
            println!("CRC: 0x{crc:08X}");
        }
        Command::WriteProtect => finish_protect(session.write_protect()?),
        Command::WriteUnprotect => finish_protect(session.write_unprotect()?),
        Command::ReadoutProtect => finish_protect(session.readout_protect()?),
        Command::ReadoutUnprotect => finish_protect(session.readout_unprotect()?),
        Command::Reset => {
            session.reset_device()?;
            println!("Device reset");
        }
    }

    Ok(())
}

fn print_info(session: &Session<SerialLink>) {
    let device = session.device();
    let (major, minor) = session.bootloader_version().value();
    let (option1, option2) = session.option_bytes();
    println!("Device: {} (PID 0x{:03X})", device.name, session.product_id());
    println!("Bootloader version: {major}.{minor}");
    println!("Option bytes: 0x{option1:02X} 0x{option2:02X}");
    println!(
        "Flash: 0x{:08X}..0x{:08X} ({} KiB, {} pages per protection sector)",
        device.fl_start,
        device.fl_end,
        (device.fl_end - device.fl_start) / 1024,
        device.fl_pps
    );
    println!("RAM: 0x{:08X}..0x{:08X}", device.ram_start, device.ram_end);
    println!(
        "System memory: 0x{:08X}..0x{:08X}",
        device.mem_start, device.mem_end
    );
    println!(
        "Option bytes area: 0x{:08X}..=0x{:08X}",
        device.opt_start, device.opt_end
    );
    print!("Available commands:");
    for kind in BootCommand::ALL {
        if let Some(code) = session.commands().opcode(kind) {
            print!(" {kind:?}(0x{code:02X})");
        }
    }
    println!();
}

fn flash(
    session: &mut Session<SerialLink>,
    file: &str,
    address: u32,
    verify: bool,
) -> anyhow::Result<()> {
    let bytes = fs::read(file)?;
    let size = bytes.len() as u32;
    let device = session.device();
    if !device.in_flash(address) || address + size > device.fl_end {
        bail!(
            "Image of {size} bytes at 0x{address:08X} does not fit the flash of a {}",
            device.name
        );
    }
    info!("flashing {size} bytes from {file} to 0x{address:08X}");

    let first_page = device.page_floor(address);
    let page_count = device.page_ceil(address + size) - first_page;
    debug!("erasing {page_count} pages starting at page {first_page}");
    session.erase_memory(first_page, page_count)?;

    for (index, chunk) in bytes.chunks(MAX_WRITE_BYTES_COUNT).enumerate() {
        let addr = address + (index * MAX_WRITE_BYTES_COUNT) as u32;
        debug!("writing chunk #{} to address 0x{addr:08X}", index + 1);
        session.write_memory(addr, chunk)?;
    }

    if verify {
        info!("reading back memory for verification");
        let mut readback = vec![0u8; bytes.len()];
        for (index, chunk) in readback.chunks_mut(MAX_READ_BYTES_COUNT).enumerate() {
            let addr = address + (index * MAX_READ_BYTES_COUNT) as u32;
            debug!("reading chunk #{} from address 0x{addr:08X}", index + 1);
            session.read_memory(addr, chunk)?;
        }
        for (offset, (original, written)) in bytes.iter().zip(readback.iter()).enumerate() {
            if original != written {
                bail!("Verification failed for byte #{offset}");
            }
        }
    }

    println!("Flashed {size} bytes to 0x{address:08X}");
    Ok(())
}

fn read_to_file(
    session: &mut Session<SerialLink>,
    file: &str,
    address: u32,
    length: u32,
) -> anyhow::Result<()> {
    info!("reading {length} bytes at 0x{address:08X} into {file}");
    let mut data = vec![0u8; length as usize];
    for (index, chunk) in data.chunks_mut(MAX_READ_BYTES_COUNT).enumerate() {
        let addr = address + (index * MAX_READ_BYTES_COUNT) as u32;
        debug!("reading chunk #{} from address 0x{addr:08X}", index + 1);
        session.read_memory(addr, chunk)?;
    }
    fs::write(file, &data)?;
    println!("Read {length} bytes to {file}");
    Ok(())
}

fn finish_protect(state: DeviceState) {
    match state {
        DeviceState::Running => println!("Protection updated"),
        DeviceState::Reset => println!("Protection updated; the device has reset itself"),
    }
}
