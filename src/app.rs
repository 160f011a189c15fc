use std::path::PathBuf;

use clap::{
    Args, Parser, Subcommand,
    builder::{Styles, styling},
};

use crate::commands::{hiber, hivescan, ident};
use crate::config::Config;
use crate::local_logger::init_local_logger;
use crate::prelude::*;

fn create_styles() -> Styles {
    styling::Styles::styled()
        .header(styling::AnsiColor::Green.on_default() | styling::Effects::BOLD)
        .usage(styling::AnsiColor::Green.on_default() | styling::Effects::BOLD)
        .literal(styling::AnsiColor::Cyan.on_default() | styling::Effects::BOLD)
        .placeholder(styling::AnsiColor::Cyan.on_default())
}

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Reconstructs OS state from physical memory images",
    styles = create_styles()
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
pub struct ImageArgs {
    /// Path to the memory image
    #[arg(value_name = "IMAGE")]
    pub image: PathBuf,

    /// Profile name, skipping profile discovery
    #[arg(long, env = "EXHUME_PROFILE")]
    pub profile: Option<String>,

    /// Directory table base, skipping DTB discovery
    #[arg(long, value_parser = parse_hex)]
    pub dtb: Option<u64>,

    /// Enable write support (asks for an interactive confirmation)
    #[arg(short = 'w', long)]
    pub write: bool,

    /// SYSTEM hive offset (virtual), forwarded to plugins
    #[arg(long, value_parser = parse_hex, hide = true)]
    pub sys_offset: Option<u64>,

    /// SAM hive offset (virtual), forwarded to plugins
    #[arg(long, value_parser = parse_hex, hide = true)]
    pub sam_offset: Option<u64>,

    /// SECURITY hive offset (virtual), forwarded to plugins
    #[arg(long, value_parser = parse_hex, hide = true)]
    pub sec_offset: Option<u64>,

    /// Hive offset (virtual), forwarded to plugins
    #[arg(long, value_parser = parse_hex, hide = true)]
    pub hive_offset: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Identify the image: layers, profile and DTB
    Ident {
        #[command(flatten)]
        image: ImageArgs,
        /// Emit the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Scan physical memory for registry hive allocations
    Hivescan {
        #[command(flatten)]
        image: ImageArgs,
    },
    /// Show hibernation file information
    Hibinfo {
        #[command(flatten)]
        image: ImageArgs,
    },
    /// Convert a hibernation file to a raw image
    Hibdump {
        #[command(flatten)]
        image: ImageArgs,
        /// Output dump file
        #[arg(short = 'D', long)]
        dump_file: PathBuf,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_local_logger()?;

    match cli.command {
        Commands::Ident { image, json } => {
            let config = Config::try_from(&image)?;
            ident::run(&config, json)
        }
        Commands::Hivescan { image } => {
            let config = Config::try_from(&image)?;
            hivescan::run(&config)
        }
        Commands::Hibinfo { image } => {
            let config = Config::try_from(&image)?;
            hiber::info(&config)
        }
        Commands::Hibdump { image, dump_file } => {
            let config = Config::try_from(&image)?;
            hiber::dump(&config, &dump_file)
        }
    }
}

fn parse_hex(value: &str) -> Result<u64, String> {
    let value = value.trim();
    let (digits, radix) = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => (hex, 16),
        None => (value, 10),
    };
    u64::from_str_radix(digits, radix).map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_accepts_both_radixes() {
        assert_eq!(parse_hex("0x39000"), Ok(0x39000));
        assert_eq!(parse_hex("0X1aB"), Ok(0x1ab));
        assert_eq!(parse_hex("4096"), Ok(4096));
        assert!(parse_hex("zz").is_err());
        assert!(parse_hex("0x").is_err());
    }

    #[test]
    fn test_cli_parses_ident() {
        let cli = Cli::try_parse_from([
            "exhume", "ident", "--json", "--dtb", "0x39000", "image.raw",
        ])
        .unwrap();
        match cli.command {
            Commands::Ident { image, json } => {
                assert!(json);
                assert_eq!(image.dtb, Some(0x39000));
                assert_eq!(image.image, PathBuf::from("image.raw"));
                assert!(!image.write);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
