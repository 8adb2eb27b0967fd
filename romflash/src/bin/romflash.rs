use std::{fs, future::Future, path::PathBuf};

use clap::{Args, Parser, Subcommand};
use log::{debug, info, LevelFilter};
use miette::{bail, IntoDiagnostic, Result, WrapErr};
use romflash::{
    cli::{self, human_size, parse_u32, ConnectArgs, FlashProgress},
    logging::initialize_logger,
    targets::{FlashRegion, ProgressCallbacks},
    FlasherConfig,
    ResetMode,
};

#[derive(Debug, Parser)]
#[command(about, max_term_width = 100, propagate_version = true, version)]
struct Cli {
    #[command(subcommand)]
    subcommand: Commands,
    /// Log every frame exchanged with the device
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Write a binary file to a specific address in the chip's flash
    WriteBin(WriteBinArgs),
    /// Erase a region of the chip's flash
    EraseRegion(EraseRegionArgs),
    /// Reset the chip into the bootloader or the application
    Reset(ResetArgs),
}

#[derive(Debug, Args)]
struct WriteBinArgs {
    /// Address at which to write the binary file
    #[arg(value_parser = parse_u32)]
    address: u32,
    /// File containing the binary data to write
    file: PathBuf,
    /// Send the image uncompressed
    #[arg(long)]
    no_compress: bool,
    /// Verify the flash contents after writing
    #[arg(long)]
    verify: bool,
    #[command(flatten)]
    connect_args: ConnectArgs,
}

#[derive(Debug, Args)]
struct EraseRegionArgs {
    /// Offset to start erasing from
    #[arg(value_parser = parse_u32)]
    address: u32,
    /// Size of the region to erase
    #[arg(value_parser = parse_u32)]
    size: u32,
    #[command(flatten)]
    connect_args: ConnectArgs,
}

#[derive(Debug, Args)]
struct ResetArgs {
    /// What the chip should boot into
    #[arg(long, value_enum, default_value = "application")]
    mode: Mode,
    #[command(flatten)]
    connect_args: ConnectArgs,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum Mode {
    Bootloader,
    Application,
}

impl From<Mode> for ResetMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Bootloader => ResetMode::Bootloader,
            Mode::Application => ResetMode::Application,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    miette::set_panic_hook();

    // Attempt to parse any provided comand-line arguments, or print the help
    // message and terminate if the invocation is not correct.
    let cli = Cli::parse();
    initialize_logger(if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
    debug!("{:#?}", cli.subcommand);

    // Execute the correct action based on the provided subcommand and its
    // associated arguments.
    match cli.subcommand {
        Commands::WriteBin(args) => interruptible(write_bin(args)).await,
        Commands::EraseRegion(args) => interruptible(erase_region(args)).await,
        Commands::Reset(args) => interruptible(reset(args)).await,
    }
}

/// Run `operation`, abandoning it on Ctrl-C
async fn interruptible(operation: impl Future<Output = Result<()>>) -> Result<()> {
    tokio::select! {
        result = operation => result,
        _ = tokio::signal::ctrl_c() => bail!("Interrupted, the device may be left half written"),
    }
}

async fn write_bin(args: WriteBinArgs) -> Result<()> {
    let data = fs::read(&args.file)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to open image {}", args.file.display()))?;

    let config = FlasherConfig {
        verify: args.verify,
        ..FlasherConfig::default()
    };
    let mut flasher = cli::connect(&args.connect_args, config).await?;

    info!("Writing {} to {:#x}", human_size(data.len()), args.address);

    let mut progress = FlashProgress::default();
    let mut callbacks: Option<&mut dyn ProgressCallbacks> = Some(&mut progress);
    let region = FlashRegion::new(args.address, &data, !args.no_compress);
    flasher.write_region(&region, &mut callbacks).await?;

    flasher.reset(ResetMode::Application).await?;

    Ok(())
}

async fn erase_region(args: EraseRegionArgs) -> Result<()> {
    let mut flasher = cli::connect(&args.connect_args, FlasherConfig::default()).await?;

    info!(
        "Erasing {} at {:#x}",
        human_size(args.size as usize),
        args.address
    );
    flasher.erase(args.address, args.size).await?;
    info!("Erase successful");

    flasher.reset(ResetMode::Application).await?;

    Ok(())
}

async fn reset(args: ResetArgs) -> Result<()> {
    let profile = cli::chip_profile(&args.connect_args)?;
    let config = FlasherConfig::default();
    let transport = cli::open_port(&args.connect_args, &config)?;

    let mut flasher = romflash::Flasher::new(transport, profile, config);
    flasher.reset(args.mode.into()).await?;

    Ok(())
}
