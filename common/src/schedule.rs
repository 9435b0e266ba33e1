use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Offset, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sunrise::{Coordinates, SolarDay, SolarEvent};
use thiserror::Error;

use crate::{
    types::BlindAction,
    weather::{GeoLocation, Sky},
};

/// Minutes relative to sunset. Both offsets count *before* sunset:
/// `lower_time = sunset - lower_offset_min`, `raise_time = sunset - raise_offset_min`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleOffsets {
    pub lower_offset_min: i64,
    pub raise_offset_min: i64,
}

impl Default for ScheduleOffsets {
    fn default() -> Self {
        Self {
            lower_offset_min: 192,
            raise_offset_min: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScheduleError {
    #[error("invalid coordinates ({latitude}, {longitude})")]
    InvalidCoordinates { latitude: f64, longitude: f64 },
    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),
}

pub fn sunset_utc(location: &GeoLocation, date: NaiveDate) -> Result<DateTime<Utc>, ScheduleError> {
    let coord = Coordinates::new(location.latitude, location.longitude).ok_or(
        ScheduleError::InvalidCoordinates {
            latitude: location.latitude,
            longitude: location.longitude,
        },
    )?;
    Ok(SolarDay::new(coord, date).event_time(SolarEvent::Sunset))
}

pub fn to_local(tz: Tz, instant: DateTime<Utc>) -> DateTime<FixedOffset> {
    let local = instant.with_timezone(&tz);
    local.with_timezone(&local.offset().fix())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleWindow {
    pub date: NaiveDate,
    pub sunset: DateTime<FixedOffset>,
    pub lower_offset_min: i64,
    pub raise_offset_min: i64,
    pub lower_time: DateTime<FixedOffset>,
    pub raise_time: DateTime<FixedOffset>,
}

impl ScheduleWindow {
    pub fn from_sunset(
        date: NaiveDate,
        sunset: DateTime<FixedOffset>,
        offsets: ScheduleOffsets,
    ) -> Self {
        Self {
            date,
            sunset,
            lower_offset_min: offsets.lower_offset_min,
            raise_offset_min: offsets.raise_offset_min,
            lower_time: sunset - Duration::minutes(offsets.lower_offset_min),
            raise_time: sunset - Duration::minutes(offsets.raise_offset_min),
        }
    }

    pub fn for_location(
        location: &GeoLocation,
        date: NaiveDate,
        offsets: ScheduleOffsets,
    ) -> Result<Self, ScheduleError> {
        let tz = location
            .tz()
            .ok_or_else(|| ScheduleError::UnknownTimezone(location.timezone.clone()))?;
        let sunset = sunset_utc(location, date)?;
        Ok(Self::from_sunset(date, to_local(tz, sunset), offsets))
    }

    /// Adaptive weather control runs between the lower trigger and sunset, inclusive.
    pub fn in_monitoring_window(&self, now: DateTime<FixedOffset>) -> bool {
        now >= self.lower_time && now <= self.sunset
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulePhase {
    Idle,
    Scheduled,
    Firing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleEvent {
    Fire(BlindAction),
    LowerSkippedOvercast,
}

#[derive(Debug, Clone)]
pub struct ScheduleEngine {
    offsets: ScheduleOffsets,
    window: Option<ScheduleWindow>,
    phase: SchedulePhase,
    lower_done: bool,
    raise_done: bool,
}

impl ScheduleEngine {
    pub fn new(offsets: ScheduleOffsets) -> Self {
        Self {
            offsets,
            window: None,
            phase: SchedulePhase::Idle,
            lower_done: false,
            raise_done: false,
        }
    }

    pub fn offsets(&self) -> ScheduleOffsets {
        self.offsets
    }

    pub fn window(&self) -> Option<&ScheduleWindow> {
        self.window.as_ref()
    }

    pub fn phase(&self) -> SchedulePhase {
        self.phase
    }

    pub fn needs_reschedule(&self, today: NaiveDate) -> bool {
        self.window
            .as_ref()
            .map(|window| window.date != today)
            .unwrap_or(true)
    }

    /// Installs a freshly computed window. Triggers that already fired today stay
    /// fired, and triggers whose time has passed are consumed without firing.
    pub fn reschedule(&mut self, window: ScheduleWindow, now: DateTime<FixedOffset>) {
        let same_day = self
            .window
            .as_ref()
            .is_some_and(|current| current.date == window.date);
        let (lower_done, raise_done) = if same_day {
            (self.lower_done, self.raise_done)
        } else {
            (false, false)
        };

        self.lower_done = lower_done || window.lower_time <= now;
        self.raise_done = raise_done || window.raise_time <= now;
        self.window = Some(window);
        self.phase = self.settled_phase();
    }

    pub fn tick(&mut self, now: DateTime<FixedOffset>, sky: Option<Sky>) -> Vec<ScheduleEvent> {
        let Some(window) = self.window.as_ref() else {
            return Vec::new();
        };

        let mut due = Vec::new();
        if !self.lower_done && now >= window.lower_time {
            self.lower_done = true;
            // Unknown sky does not block the scheduled lower; only a confirmed overcast does.
            let event = if sky == Some(Sky::Overcast) {
                ScheduleEvent::LowerSkippedOvercast
            } else {
                ScheduleEvent::Fire(BlindAction::Lower)
            };
            due.push((window.lower_time, event));
        }
        if !self.raise_done && now >= window.raise_time {
            self.raise_done = true;
            due.push((window.raise_time, ScheduleEvent::Fire(BlindAction::Raise)));
        }
        due.sort_by_key(|(at, _)| *at);

        let events: Vec<ScheduleEvent> = due.into_iter().map(|(_, event)| event).collect();
        self.phase = if events
            .iter()
            .any(|event| matches!(event, ScheduleEvent::Fire(_)))
        {
            SchedulePhase::Firing
        } else {
            self.settled_phase()
        };
        events
    }

    /// Puts a fired trigger back so the next tick fires it again, for when the
    /// remote could not take the action. A lower is not retried once the raise
    /// has fired.
    pub fn retry(&mut self, action: BlindAction) {
        match action {
            BlindAction::Lower if !self.raise_done => self.lower_done = false,
            BlindAction::Raise => self.raise_done = false,
            BlindAction::Lower | BlindAction::Stop => {}
        }
        self.phase = self.settled_phase();
    }

    pub fn finish_firing(&mut self) {
        self.phase = self.settled_phase();
    }

    fn settled_phase(&self) -> SchedulePhase {
        if self.window.is_some() && !(self.lower_done && self.raise_done) {
            SchedulePhase::Scheduled
        } else {
            SchedulePhase::Idle
        }
    }
}
