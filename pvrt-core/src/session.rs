//! Receiver-side transfer session state machine.
//!
//! ```text
//!  Init ──► AwaitChannels ──► Assembling ──► Verify ──► Done
//!                 │                │            │
//!                 └────────────────┴────────────┴──────► Failed
//! ```
//!
//! Transitions are validated and return `Result` instead of panicking.

use std::time::Instant;

use crate::error::{PvrtError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionPhase {
    /// Session created, no channel accepted yet.
    #[default]
    Init,

    /// At least one channel accepted; waiting for the rest.
    AwaitChannels {
        /// When the first channel arrived.
        since: Instant,
    },

    /// Every channel reported; frames are being replayed.
    Assembling,

    /// Object bytes rebuilt; digest check in progress.
    Verify,

    /// Object verified and stored.
    Done,

    /// Assembly or verification failed.
    Failed { reason: String },
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "Init"),
            Self::AwaitChannels { .. } => write!(f, "AwaitChannels"),
            Self::Assembling => write!(f, "Assembling"),
            Self::Verify => write!(f, "Verify"),
            Self::Done => write!(f, "Done"),
            Self::Failed { .. } => write!(f, "Failed"),
        }
    }
}

impl SessionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed { .. })
    }

    /// How long the session has waited for its channels.
    pub fn waiting_for(&self) -> Option<std::time::Duration> {
        match self {
            Self::AwaitChannels { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Init`. Idempotent in `AwaitChannels`.
    pub fn accept_channel(&mut self) -> Result<()> {
        match self {
            Self::Init => {
                *self = Self::AwaitChannels {
                    since: Instant::now(),
                };
                Ok(())
            }
            Self::AwaitChannels { .. } => Ok(()),
            _ => Err(PvrtError::InvalidTransition(
                "cannot accept channel: session already assembling or finished",
            )),
        }
    }

    /// Valid from: `AwaitChannels`.
    pub fn begin_assembly(&mut self) -> Result<()> {
        match self {
            Self::AwaitChannels { .. } => {
                *self = Self::Assembling;
                Ok(())
            }
            _ => Err(PvrtError::InvalidTransition(
                "cannot assemble: not in AwaitChannels state",
            )),
        }
    }

    /// Valid from: `Assembling`.
    pub fn begin_verify(&mut self) -> Result<()> {
        match self {
            Self::Assembling => {
                *self = Self::Verify;
                Ok(())
            }
            _ => Err(PvrtError::InvalidTransition(
                "cannot verify: not in Assembling state",
            )),
        }
    }

    /// Valid from: `Verify`.
    pub fn complete(&mut self) -> Result<()> {
        match self {
            Self::Verify => {
                *self = Self::Done;
                Ok(())
            }
            _ => Err(PvrtError::InvalidTransition(
                "cannot complete: not in Verify state",
            )),
        }
    }

    /// Valid from any non-terminal phase.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        if self.is_terminal() {
            return Err(PvrtError::InvalidTransition(
                "cannot fail: session already finished",
            ));
        }
        *self = Self::Failed {
            reason: reason.into(),
        };
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
