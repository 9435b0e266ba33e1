use serde::{Deserialize, Serialize};

use crate::{
    channel::{ChannelTarget, RemoteButton, CHANNEL_COUNT},
    schedule::ScheduleOffsets,
    weather::GeoLocation,
};

/// BCM pin numbers wired to the remote's buttons and its supply switch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PinLayout {
    pub power: u8,
    pub up: u8,
    pub stop: u8,
    pub down: u8,
    pub channel_up: u8,
    pub channel_down: u8,
}

impl Default for PinLayout {
    fn default() -> Self {
        Self {
            power: 4,
            up: 21,
            stop: 24,
            down: 16,
            channel_up: 12,
            channel_down: 25,
        }
    }
}

impl PinLayout {
    pub fn pin(&self, button: RemoteButton) -> u8 {
        match button {
            RemoteButton::Up => self.up,
            RemoteButton::Stop => self.stop,
            RemoteButton::Down => self.down,
            RemoteButton::ChannelUp => self.channel_up,
            RemoteButton::ChannelDown => self.channel_down,
        }
    }

    pub fn button_pins(&self) -> [u8; 5] {
        RemoteButton::ALL.map(|button| self.pin(button))
    }

    pub fn all_pins(&self) -> [u8; 6] {
        let [up, stop, down, channel_up, channel_down] = self.button_pins();
        [self.power, up, stop, down, channel_up, channel_down]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherConfig {
    pub api_key: String,
    pub location: String,
    pub base_url: String,
    pub cloud_threshold_pct: u8,
    pub monitoring_interval_min: u64,
    pub request_timeout_ms: u64,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            location: "29607".to_string(),
            base_url: "http://api.weatherapi.com/v1".to_string(),
            cloud_threshold_pct: 15,
            monitoring_interval_min: 10,
            request_timeout_ms: 5_000,
        }
    }
}

impl WeatherConfig {
    pub fn sanitize(&mut self) {
        self.cloud_threshold_pct = self.cloud_threshold_pct.min(100);
        self.monitoring_interval_min = self.monitoring_interval_min.max(1);
        self.request_timeout_ms = self.request_timeout_ms.max(500);

        let trimmed = self.base_url.trim_end_matches('/');
        if trimmed.is_empty() {
            self.base_url = WeatherConfig::default().base_url;
        } else if trimmed.len() != self.base_url.len() {
            self.base_url = trimmed.to_string();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub location_name: String,
    pub hub_url: String,
    pub http_port: u16,
    pub weather: WeatherConfig,
    pub offsets: ScheduleOffsets,
    pub pins: PinLayout,
    pub default_channel: ChannelTarget,
    pub fallback_location: GeoLocation,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            location_name: "Blind Control".to_string(),
            hub_url: "http://192.168.4.202:5001/".to_string(),
            http_port: 5000,
            weather: WeatherConfig::default(),
            offsets: ScheduleOffsets::default(),
            pins: PinLayout::default(),
            default_channel: ChannelTarget::All,
            fallback_location: GeoLocation::fallback(),
        }
    }
}

impl ControllerConfig {
    pub fn sanitize(&mut self) {
        self.weather.sanitize();
        self.offsets.lower_offset_min = self.offsets.lower_offset_min.clamp(0, 720);
        self.offsets.raise_offset_min = self.offsets.raise_offset_min.clamp(0, 720);

        if let ChannelTarget::Channel(channel) = self.default_channel {
            if !(1..=CHANNEL_COUNT).contains(&channel) {
                self.default_channel = ChannelTarget::All;
            }
        }

        if self.http_port == 0 {
            self.http_port = 5000;
        }
        if self.location_name.trim().is_empty() {
            self.location_name = ControllerConfig::default().location_name;
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_match_the_installed_wiring() {
        let pins = PinLayout::default();
        assert_eq!(pins.all_pins(), [4, 21, 24, 16, 12, 25]);
        assert_eq!(pins.pin(RemoteButton::ChannelDown), 25);
    }

    #[test]
    fn sanitize_clamps_out_of_range_values() {
        let mut config = ControllerConfig {
            http_port: 0,
            default_channel: ChannelTarget::Channel(40),
            ..ControllerConfig::default()
        };
        config.weather.cloud_threshold_pct = 150;
        config.weather.monitoring_interval_min = 0;
        config.weather.request_timeout_ms = 10;
        config.weather.base_url = "http://localhost:9000/v1/".to_string();
        config.offsets.lower_offset_min = -30;
        config.offsets.raise_offset_min = 2_000;

        config.sanitize();

        assert_eq!(config.http_port, 5000);
        assert_eq!(config.default_channel, ChannelTarget::All);
        assert_eq!(config.weather.cloud_threshold_pct, 100);
        assert_eq!(config.weather.monitoring_interval_min, 1);
        assert_eq!(config.weather.request_timeout_ms, 500);
        assert_eq!(config.weather.base_url, "http://localhost:9000/v1");
        assert_eq!(config.offsets.lower_offset_min, 0);
        assert_eq!(config.offsets.raise_offset_min, 720);
    }

    #[test]
    fn sanitize_keeps_valid_default_channel() {
        let mut config = ControllerConfig {
            default_channel: ChannelTarget::Channel(12),
            ..ControllerConfig::default()
        };
        config.sanitize();
        assert_eq!(config.default_channel, ChannelTarget::Channel(12));
    }
}
