use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ChannelState;

pub const CHANNEL_COUNT: u8 = 16;

/// Positions the remote cycles through on "Channel Down". Measured on the
/// hardware, not derived from the channel count; needs re-validation if the
/// remote model changes.
pub const CHANNEL_RING_POSITIONS: u8 = 19;

/// Highest channel reached with "Channel Up" from the power-up baseline.
pub const CHANNEL_UP_LIMIT: u8 = 8;

pub const STEP_PRESS_MS: u64 = 800;
pub const ALL_CHANNELS_PRESS_MS: u64 = 1_000;
pub const PRESS_DWELL_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteButton {
    Up,
    Stop,
    Down,
    #[serde(rename = "Channel Up")]
    ChannelUp,
    #[serde(rename = "Channel Down")]
    ChannelDown,
}

impl RemoteButton {
    pub const ALL: [RemoteButton; 5] = [
        RemoteButton::Up,
        RemoteButton::Stop,
        RemoteButton::Down,
        RemoteButton::ChannelUp,
        RemoteButton::ChannelDown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "Up",
            Self::Stop => "Stop",
            Self::Down => "Down",
            Self::ChannelUp => "Channel Up",
            Self::ChannelDown => "Channel Down",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|button| button.as_str() == name)
    }
}

impl fmt::Display for RemoteButton {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelTarget {
    All,
    Channel(u8),
}

impl ChannelTarget {
    pub fn channel(channel: u8) -> Result<Self, ChannelError> {
        if (1..=CHANNEL_COUNT).contains(&channel) {
            Ok(Self::Channel(channel))
        } else {
            Err(ChannelError::OutOfRange(i64::from(channel)))
        }
    }
}

impl From<ChannelTarget> for ChannelState {
    fn from(target: ChannelTarget) -> Self {
        match target {
            ChannelTarget::All => ChannelState::AllChannels,
            ChannelTarget::Channel(channel) => ChannelState::Channel(channel),
        }
    }
}

impl FromStr for ChannelTarget {
    type Err = ChannelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }
        let channel = trimmed
            .parse::<i64>()
            .map_err(|_| ChannelError::Unparsable(trimmed.to_string()))?;
        u8::try_from(channel)
            .map_err(|_| ChannelError::OutOfRange(channel))
            .and_then(Self::channel)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel {0} is outside 1-16")]
    OutOfRange(i64),
    #[error("'{0}' is not a channel number")]
    Unparsable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationStep {
    Press(RemoteButton, u64),
    Dwell(u64),
}

/// Button sequence that moves a freshly powered remote to `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavigationPlan {
    pub target: ChannelTarget,
    pub button: Option<RemoteButton>,
    pub presses: u8,
    pub press_ms: u64,
}

impl NavigationPlan {
    pub fn for_target(target: ChannelTarget) -> Result<Self, ChannelError> {
        let (button, presses, press_ms) = match target {
            ChannelTarget::All => (Some(RemoteButton::ChannelDown), 1, ALL_CHANNELS_PRESS_MS),
            ChannelTarget::Channel(channel) => match channel {
                1 => (None, 0, STEP_PRESS_MS),
                2..=CHANNEL_UP_LIMIT => (Some(RemoteButton::ChannelUp), channel, STEP_PRESS_MS),
                9..=CHANNEL_COUNT => (
                    Some(RemoteButton::ChannelDown),
                    CHANNEL_RING_POSITIONS - channel,
                    STEP_PRESS_MS,
                ),
                other => return Err(ChannelError::OutOfRange(i64::from(other))),
            },
        };

        Ok(Self {
            target,
            button,
            presses,
            press_ms,
        })
    }

    /// Each press is followed by the dwell the remote needs to register it.
    pub fn steps(&self) -> Vec<NavigationStep> {
        let Some(button) = self.button else {
            return Vec::new();
        };

        let mut steps = Vec::with_capacity(usize::from(self.presses) * 2);
        for _ in 0..self.presses {
            steps.push(NavigationStep::Press(button, self.press_ms));
            steps.push(NavigationStep::Dwell(PRESS_DWELL_MS));
        }
        steps
    }

    pub fn duration_ms(&self) -> u64 {
        u64::from(self.presses) * (self.press_ms + PRESS_DWELL_MS)
    }
}
