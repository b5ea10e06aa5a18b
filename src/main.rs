use chrono::NaiveDateTime;
use clap::{Parser, Subcommand};
use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use stratacart::cartridge::{CartridgeRecord, KeyFragment, DEFAULT_SIGNATURE};
use stratacart::formatter::{DiagPort, HexAscii, TextFormat};
use stratacart::{material, DeviceUid, FormatVersion, MachineType, Manager, ManagerOptions};

#[derive(Parser)]
#[command(name = "stratacart", about = "Encode and decode material cartridge EEPROM images")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encrypt a JSON cartridge record into an EEPROM image
    Encode {
        /// Printer model: fox, fox2, ktype, prodigy, quantum, uprint, uprintse
        #[arg(short = 't', long)]
        machine_type: MachineType,
        /// Chip UID as 16 hex digits
        #[arg(short = 'e', long)]
        eeprom_uid: DeviceUid,
        #[arg(short, long, default_value = "v3", value_parser = parse_format)]
        format: FormatVersion,
        /// Write the ASCII format used over the printer diagnostic port
        #[arg(short = 'D', long)]
        diag_format: bool,
        /// Write a commented hex dump instead of raw bytes
        #[arg(short = 'a', long = "ascii")]
        ascii: bool,
        /// Record JSON (default: stdin)
        input: Option<PathBuf>,
        /// Image (default: stdout)
        output: Option<PathBuf>,
    },
    /// Decrypt an EEPROM image into a JSON cartridge record
    Decode {
        #[arg(short = 't', long)]
        machine_type: MachineType,
        #[arg(short = 'e', long)]
        eeprom_uid: DeviceUid,
        /// Format to assume when the image size does not identify one
        #[arg(short, long, default_value = "v3", value_parser = parse_format)]
        format: FormatVersion,
        /// Read the ASCII format used over the printer diagnostic port
        #[arg(short = 'D', long)]
        diag_format: bool,
        /// Read a hex dump instead of raw bytes
        #[arg(short = 'a', long = "ascii")]
        ascii: bool,
        input: Option<PathBuf>,
        output: Option<PathBuf>,
    },
    /// Build a JSON cartridge record from flags
    Create {
        #[arg(short = 's', long)]
        serial_number: f64,
        #[arg(short = 'm', long)]
        material_name: String,
        #[arg(short = 'l', long)]
        manufacturing_lot: String,
        /// YYYY-MM-DDTHH:MM:SS
        #[arg(short = 'd', long)]
        manufacturing_date: NaiveDateTime,
        #[arg(short = 'u', long)]
        use_date: NaiveDateTime,
        #[arg(short = 'n', long)]
        initial_material_quantity: f64,
        #[arg(short = 'c', long)]
        current_material_quantity: f64,
        #[arg(short = 'k', long)]
        key_fragment: KeyFragment,
        #[arg(short = 'v', long, default_value = "1")]
        version: u16,
        #[arg(short = 'g', long, default_value = DEFAULT_SIGNATURE)]
        signature: String,
        output: Option<PathBuf>,
    },
    /// Material catalog
    Material {
        /// Print supported materials
        #[arg(short, long)]
        list: bool,
    },
    /// List known printer models and their identities
    Machines,
}

fn parse_format(s: &str) -> Result<FormatVersion, String> {
    FormatVersion::from_name(s).ok_or_else(|| format!("unknown format '{s}': expected v1 or v3"))
}

fn read_input(path: &Option<PathBuf>) -> io::Result<Vec<u8>> {
    match path {
        Some(p) => fs::read(p),
        None => {
            let mut buf = Vec::new();
            io::stdin().read_to_end(&mut buf)?;
            Ok(buf)
        }
    }
}

fn write_output(path: &Option<PathBuf>, data: &[u8]) -> io::Result<()> {
    match path {
        Some(p) => fs::write(p, data),
        None => {
            let mut out = io::stdout().lock();
            out.write_all(data)?;
            out.flush()
        }
    }
}

fn manager(format: FormatVersion) -> Manager {
    Manager::with_options(
        Box::new(stratacart::crypto::DesX),
        Box::new(stratacart::checksum::Crc16),
        ManagerOptions { format, ..ManagerOptions::default() },
    )
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(io::stderr)
        .init();

    match Cli::parse().command {

        // ── Encode ───────────────────────────────────────────────────────────
        Commands::Encode { machine_type, eeprom_uid, format, diag_format, ascii, input, output } => {
            let text   = String::from_utf8(read_input(&input)?)?;
            let record = CartridgeRecord::from_json(&text)?;
            let image  = manager(format).encode(&machine_type.identity(), &eeprom_uid, &record)?;

            let bytes = if diag_format {
                DiagPort.format(&image).into_bytes()
            } else if ascii {
                let mut header: Vec<String> = record.to_json()?.lines().map(str::to_owned).collect();
                header.push(format!("eeprom uid: {eeprom_uid}"));
                header.push(format!("machine type: {machine_type}"));
                HexAscii::with_header(header).format(&image).into_bytes()
            } else {
                image
            };
            write_output(&output, &bytes)?;
        }

        // ── Decode ───────────────────────────────────────────────────────────
        Commands::Decode { machine_type, eeprom_uid, format, diag_format, ascii, input, output } => {
            let raw = read_input(&input)?;
            let image = if diag_format {
                DiagPort.parse(&String::from_utf8(raw)?)?
            } else if ascii {
                HexAscii::default().parse(&String::from_utf8(raw)?)?
            } else {
                raw
            };
            let record = manager(format).decode(&machine_type.identity(), &eeprom_uid, &image)?;
            let mut json = record.to_json()?;
            json.push('\n');
            write_output(&output, json.as_bytes())?;
        }

        // ── Create ───────────────────────────────────────────────────────────
        Commands::Create {
            serial_number, material_name, manufacturing_lot, manufacturing_date, use_date,
            initial_material_quantity, current_material_quantity, key_fragment, version,
            signature, output,
        } => {
            material::id_for(&material_name)?;
            let record = CartridgeRecord {
                serial_number,
                material_name,
                manufacturing_lot,
                manufacturing_date,
                last_use_date: use_date,
                initial_material_quantity,
                current_material_quantity,
                key_fragment,
                version,
                signature,
            };
            let mut json = record.to_json()?;
            json.push('\n');
            write_output(&output, json.as_bytes())?;
        }

        // ── Material ─────────────────────────────────────────────────────────
        Commands::Material { list } => {
            if list {
                for (id, name) in material::all() {
                    println!("{id}\t{name}");
                }
            }
        }

        // ── Machines ─────────────────────────────────────────────────────────
        Commands::Machines => {
            for machine in MachineType::ALL {
                println!("{:<10} {}", machine.name(), machine.identity());
            }
        }
    }

    Ok(())
}
