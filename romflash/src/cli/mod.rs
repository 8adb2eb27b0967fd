//! Types and functions for the command-line interface
//!
//! The contents of this module are intended for use with the [romflash]
//! command-line application, and are likely not of much use otherwise.
//!
//! Important note: The cli module DOES NOT provide SemVer guarantees,
//! feel free to opt-out by disabling the default `cli` feature.
//!
//! [romflash]: https://crates.io/crates/romflash

use std::{fs, path::PathBuf};

use clap::{Args, ValueEnum};
use indicatif::{style::ProgressStyle, HumanBytes, ProgressBar};
use log::{info, warn};
use miette::{IntoDiagnostic, Result, WrapErr};
use strum::Display;
use tokio_serial::{FlowControl, SerialStream};

use crate::{
    flasher::{stubs::StubImage, Flasher, FlasherConfig},
    targets::{ChipProfile, ProgressCallbacks},
    transport::SerialTransport,
};

/// Built-in chip profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, ValueEnum)]
#[strum(serialize_all = "lowercase")]
#[non_exhaustive]
pub enum ChipName {
    /// ESP32
    Esp32,
    /// ESP8266
    Esp8266,
}

impl ChipName {
    pub fn profile(self) -> ChipProfile {
        match self {
            ChipName::Esp32 => ChipProfile::esp32(),
            ChipName::Esp8266 => ChipProfile::esp8266(),
        }
    }
}

/// Establish a connection with a target device
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct ConnectArgs {
    /// Serial port connected to target device
    #[arg(short = 'p', long, env = "ROMFLASH_PORT")]
    pub port: String,
    /// Baud rate at which to communicate with target device
    #[arg(short = 'B', long, env = "ROMFLASH_BAUD")]
    pub baud: Option<u32>,
    /// Built-in chip profile to use
    #[arg(short = 'c', long, conflicts_with = "profile")]
    pub chip: Option<ChipName>,
    /// TOML file describing the chip profile
    #[arg(long)]
    pub profile: Option<PathBuf>,
    /// TOML file holding the flasher stub, overriding the profile's
    #[arg(long, conflicts_with = "no_stub")]
    pub stub: Option<PathBuf>,
    /// Do not use the RAM stub for loading
    #[arg(long)]
    pub no_stub: bool,
}

/// Progress callback implementations for use in the command-line interface
#[derive(Debug, Default)]
pub struct FlashProgress {
    pb: Option<ProgressBar>,
}

impl ProgressCallbacks for FlashProgress {
    /// Initialize the progress bar
    fn init(&mut self, addr: u32, len: usize) {
        let pb = ProgressBar::new(len as u64)
            .with_message(format!("{addr:#X}"))
            .with_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] [{bar:40}] {bytes:>9}/{total_bytes:9} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=> "),
            );

        self.pb = Some(pb);
    }

    /// Set the bytes written so far
    fn update(&mut self, current: usize) {
        if let Some(ref pb) = self.pb {
            pb.set_position(current as u64);
        }
    }

    /// End the progress bar
    fn finish(&mut self) {
        if let Some(ref pb) = self.pb {
            pb.finish();
        }
    }
}

/// Resolve the chip profile selected on the command line
pub fn chip_profile(args: &ConnectArgs) -> Result<ChipProfile> {
    let mut profile = match (&args.profile, args.chip) {
        (Some(path), _) => {
            let toml = fs::read_to_string(path)
                .into_diagnostic()
                .wrap_err_with(|| format!("Failed to read profile {}", path.display()))?;
            ChipProfile::from_toml(&toml)?
        }
        (None, Some(chip)) => chip.profile(),
        (None, None) => ChipProfile::esp32(),
    };

    if let Some(path) = &args.stub {
        let toml = fs::read_to_string(path)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to read stub {}", path.display()))?;
        profile.stub = Some(StubImage::from_toml(&toml)?);
    }

    Ok(profile)
}

/// Open the serial port without resetting the device
pub fn open_port(args: &ConnectArgs, config: &FlasherConfig) -> Result<SerialTransport> {
    let builder = tokio_serial::new(&args.port, config.baud).flow_control(FlowControl::None);
    let port = SerialStream::open(&builder)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to open serial port {}", args.port))?;

    Ok(SerialTransport::new(port))
}

/// Connect to the device, load the stub and raise the baud rate as requested
pub async fn connect(
    args: &ConnectArgs,
    config: FlasherConfig,
) -> Result<Flasher<SerialTransport>> {
    let profile = chip_profile(args)?;
    let transport = open_port(args, &config)?;

    info!("Serial port: '{}'", args.port);
    info!("Connecting...");

    let mut flasher = Flasher::connect(transport, profile, config).await?;

    if args.no_stub {
        info!("Using the ROM bootloader");
    } else if flasher.profile().stub.is_some() {
        flasher.load_profile_stub().await?;
    } else {
        warn!(
            "No flasher stub known for {}, using the ROM bootloader",
            flasher.profile().name
        );
    }

    if let Some(baud) = args.baud {
        if baud > 115_200 {
            warn!("Setting baud rate higher than 115,200 can cause issues");
        }
        flasher.change_baud(baud).await?;
    }

    Ok(flasher)
}

/// Parse a number which may be given in hexadecimal with a `0x` prefix
pub fn parse_u32(input: &str) -> Result<u32, std::num::ParseIntError> {
    let input = input.replace('_', "");

    match input.strip_prefix("0x").or_else(|| input.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => input.parse(),
    }
}

/// Human readable size for log messages
pub fn human_size(len: usize) -> String {
    HumanBytes(len as u64).to_string()
}
