//! Reset sequences driven over the DTR and RTS control lines
//!
//! On most development boards DTR is wired (through a transistor) to the
//! chip's boot strapping pin (IO0) and RTS to its enable pin (EN). Toggling
//! them in the right order, with the right hold times, makes the boot ROM
//! sample the strapping pin in the desired state as the chip comes out of
//! reset.
//!
//! The sequences themselves are plain data, so supporting a new board or chip
//! only means describing another [ResetSequence].

use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::{error::Error, transport::Transport};

/// Default time to wait before releasing the boot pin after a reset
const DEFAULT_RESET_DELAY: u64 = 50; // ms
/// Amount of time to wait if the default reset delay does not work
const EXTRA_RESET_DELAY: u64 = 550; // ms
/// How long the chip is held in reset
const RESET_HOLD: u64 = 100; // ms

/// What the device should boot into after a reset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ResetMode {
    /// The ROM download mode
    Bootloader,
    /// The user application stored in flash
    Application,
}

/// One step of a reset sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetStep {
    /// Level of the DTR line
    pub dtr: bool,
    /// Level of the RTS line
    pub rts: bool,
    /// Time to hold the lines in this state before the next step
    #[serde(default)]
    pub hold_ms: u64,
}

impl ResetStep {
    pub const fn new(dtr: bool, rts: bool, hold_ms: u64) -> Self {
        Self { dtr, rts, hold_ms }
    }

    pub fn hold(&self) -> Duration {
        Duration::from_millis(self.hold_ms)
    }
}

/// Ordered control line states making up a reset
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResetSequence {
    /// Name used in log messages
    #[serde(default)]
    pub name: String,
    pub steps: Vec<ResetStep>,
}

impl ResetSequence {
    pub fn new(name: impl Into<String>, steps: Vec<ResetStep>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    /// Classic reset into the ROM download mode
    ///
    /// Holds the chip in reset with IO0 released, then takes it out of reset
    /// with IO0 pulled low for `delay` milliseconds so the ROM samples it.
    pub fn classic(extra_delay: bool) -> Self {
        let delay = if extra_delay {
            EXTRA_RESET_DELAY
        } else {
            DEFAULT_RESET_DELAY
        };

        Self::new(
            format!("classic ({delay}ms)"),
            vec![
                ResetStep::new(false, true, RESET_HOLD), // IO0 = HIGH, EN = LOW, chip in reset
                ResetStep::new(true, false, delay),      // IO0 = LOW, EN = HIGH, chip out of reset
                ResetStep::new(false, false, 0),         // IO0 = HIGH, done
            ],
        )
    }

    /// Plain reset pulse on EN, booting whatever is in flash
    pub fn hard_reset() -> Self {
        Self::new(
            "hard reset",
            vec![
                ResetStep::new(false, true, RESET_HOLD), // EN = LOW, chip in reset
                ResetStep::new(false, false, 0),         // EN = HIGH, chip boots
            ],
        )
    }

    /// Total time the sequence takes to play
    pub fn duration(&self) -> Duration {
        self.steps.iter().map(ResetStep::hold).sum()
    }
}

/// The reset sequences known for a chip family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetSequences {
    /// Sequences entering the ROM download mode, tried in order when
    /// connecting
    pub bootloader: Vec<ResetSequence>,
    /// Sequence restarting into the user application
    pub application: ResetSequence,
}

impl ResetSequences {
    /// The first sequence to use for the given mode
    pub fn for_mode(&self, mode: ResetMode) -> Option<&ResetSequence> {
        match mode {
            ResetMode::Bootloader => self.bootloader.first(),
            ResetMode::Application => Some(&self.application),
        }
    }
}

impl Default for ResetSequences {
    fn default() -> Self {
        Self {
            bootloader: vec![ResetSequence::classic(false), ResetSequence::classic(true)],
            application: ResetSequence::hard_reset(),
        }
    }
}

/// Plays reset sequences on a transport's control lines
///
/// The controller has no knowledge of the protocol; it never reads from the
/// transport, it only sets lines and waits.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResetController;

impl ResetController {
    /// Drive the control lines through every step of `sequence`
    pub async fn run<T: Transport>(
        transport: &mut T,
        sequence: &ResetSequence,
    ) -> Result<(), Error> {
        debug!("Using {} reset sequence", sequence.name);

        for step in &sequence.steps {
            transport.set_control_lines(step.dtr, step.rts).await?;

            if step.hold_ms > 0 {
                tokio::time::sleep(step.hold()).await;
            }
        }

        Ok(())
    }
}
