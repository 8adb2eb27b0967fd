//! A library and application for flashing microcontrollers through the serial
//! protocol of their ROM bootloader.
//!
//! ## As an application
//!
//! [romflash] can be installed using `cargo install`:
//!
//! ```bash
//! $ cargo install romflash
//! ```
//!
//! ## As a library
//!
//! [romflash] can be used as a library in other applications:
//!
//! ```toml
//! romflash = { version = "0.1", default-features = false }
//! ```
//!
//! We add `default-features` here to disable the `cli` feature, which is
//! enabled by default. Its important to note that the cli module does not
//! provide SemVer guarantees. You might also want to enable the `serialport`
//! feature to get a [transport::Transport] over a real serial port.
//!
//! The entry point is [Flasher]: it owns a [transport::Transport], and drives
//! the device from reset through synchronisation, optional stub loading and
//! flash writes:
//!
//! ```ignore
//! let config = FlasherConfig::default();
//! let mut flasher = Flasher::connect(transport, ChipProfile::esp32(), config).await?;
//! flasher.write(0x1000, &image, true, &mut None).await?;
//! flasher.reset(ResetMode::Application).await?;
//! ```
//!
//! [romflash]: https://crates.io/crates/romflash

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_debug_implementations, rust_2018_idioms)]

pub use self::{
    connection::reset::ResetMode,
    error::Error,
    flasher::{Flasher, FlasherConfig, SessionState},
    targets::ChipProfile,
};

#[cfg(feature = "cli")]
#[cfg_attr(docsrs, doc(cfg(feature = "cli")))]
pub mod cli;
pub mod connection;
pub mod error;
pub mod flasher;
pub mod slip;
pub mod targets;
pub mod transport;

/// Logging utilities
#[cfg(feature = "cli")]
#[cfg_attr(docsrs, doc(cfg(feature = "cli")))]
pub mod logging {
    use env_logger::{Builder, Env};
    use log::LevelFilter;

    /// Initialize the logger with the given [LevelFilter]
    ///
    /// The `RUST_LOG` environment variable takes precedence.
    pub fn initialize_logger(filter: LevelFilter) {
        Builder::from_env(Env::default().default_filter_or(filter.as_str()))
            .format_target(false)
            .init();
    }
}
