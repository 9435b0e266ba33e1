use chrono::{DateTime, FixedOffset, NaiveDate};

use crate::{
    schedule::ScheduleWindow,
    types::BlindAction,
    weather::Sky,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptiveStep {
    /// Outside the monitoring window; nothing to do.
    Outside,
    /// The window just closed (or a new day started): forget the blind position.
    ResetForDay,
    /// Inside the window without a usable weather reading.
    NoReading,
    /// Inside the window and the blinds already match the sky.
    Hold,
    Act(BlindAction),
}

/// Edge-triggered weather follower between the lower trigger and sunset.
///
/// Lowers once when the sky clears and raises once when it clouds over, using
/// the remote's `blinds_lowered` flag as the memory of what was last done.
#[derive(Debug, Clone, Default)]
pub struct AdaptiveLoop {
    active: bool,
    day: Option<NaiveDate>,
}

impl AdaptiveLoop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn step(
        &mut self,
        now: DateTime<FixedOffset>,
        window: Option<&ScheduleWindow>,
        blinds_lowered: bool,
        sky: Option<Sky>,
    ) -> AdaptiveStep {
        let today = now.date_naive();
        let new_day = self.day.is_some_and(|day| day != today);
        self.day = Some(today);

        let inside = window.is_some_and(|window| window.in_monitoring_window(now));
        if !inside {
            let closing = self.active || new_day;
            self.active = false;
            return if closing {
                AdaptiveStep::ResetForDay
            } else {
                AdaptiveStep::Outside
            };
        }

        self.active = true;
        match (sky, blinds_lowered) {
            (None, _) => AdaptiveStep::NoReading,
            (Some(Sky::Sunny), false) => AdaptiveStep::Act(BlindAction::Lower),
            (Some(Sky::Overcast), true) => AdaptiveStep::Act(BlindAction::Raise),
            _ => AdaptiveStep::Hold,
        }
    }
}
