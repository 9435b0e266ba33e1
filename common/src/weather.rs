use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Sky {
    Sunny,
    Overcast,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeatherSample {
    pub cloud_cover_pct: u8,
    pub condition: String,
    pub fetched_at: DateTime<Utc>,
}

impl WeatherSample {
    pub fn is_overcast(&self, threshold_pct: u8) -> bool {
        self.cloud_cover_pct >= threshold_pct
    }

    pub fn sky(&self, threshold_pct: u8) -> Sky {
        if self.is_overcast(threshold_pct) {
            Sky::Overcast
        } else {
            Sky::Sunny
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub timezone: String,
}

impl GeoLocation {
    /// Used whenever the provider cannot resolve the configured location.
    pub fn fallback() -> Self {
        Self {
            name: "New York".to_string(),
            latitude: 40.7128,
            longitude: -74.0060,
            timezone: "America/New_York".to_string(),
        }
    }

    pub fn tz(&self) -> Option<Tz> {
        self.timezone.parse().ok()
    }
}

/// Subset of the provider's `current.json` payload the controller relies on.
#[derive(Debug, Clone, Deserialize)]
pub struct CurrentConditions {
    pub location: ProviderLocation,
    pub current: ProviderCurrent,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderLocation {
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    pub tz_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderCurrent {
    pub cloud: f64,
    pub condition: ProviderCondition,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderCondition {
    pub text: String,
}

impl CurrentConditions {
    pub fn sample(&self, fetched_at: DateTime<Utc>) -> WeatherSample {
        WeatherSample {
            cloud_cover_pct: self.current.cloud.round().clamp(0.0, 100.0) as u8,
            condition: self.current.condition.text.clone(),
            fetched_at,
        }
    }

    /// `None` when the provider hands back something we cannot schedule against.
    pub fn location(&self) -> Option<GeoLocation> {
        let loc = &self.location;
        let valid = loc.lat.is_finite()
            && loc.lon.is_finite()
            && (-90.0..=90.0).contains(&loc.lat)
            && (-180.0..=180.0).contains(&loc.lon)
            && loc.tz_id.parse::<Tz>().is_ok();

        valid.then(|| GeoLocation {
            name: loc.name.clone(),
            latitude: loc.lat,
            longitude: loc.lon,
            timezone: loc.tz_id.clone(),
        })
    }
}
