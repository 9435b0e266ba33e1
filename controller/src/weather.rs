use std::time::Duration;

use blinds_common::{CurrentConditions, GeoLocation, Sky, WeatherConfig, WeatherSample};
use chrono::Utc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum WeatherError {
    #[error("no weather API key configured")]
    MissingApiKey,
    #[error("weather request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("weather provider returned HTTP {0}")]
    Status(reqwest::StatusCode),
    #[error("weather payload could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Cloud-cover source. Keeps the last good sample; a failed poll never
/// replaces it with a guess.
pub struct WeatherGate {
    client: reqwest::Client,
    config: WeatherConfig,
    latest: RwLock<Option<WeatherSample>>,
}

impl WeatherGate {
    pub fn new(config: WeatherConfig) -> Self {
        Self {
            client: build_client(config.request_timeout_ms),
            config,
            latest: RwLock::new(None),
        }
    }

    async fn fetch(&self) -> Result<CurrentConditions, WeatherError> {
        if self.config.api_key.is_empty() {
            return Err(WeatherError::MissingApiKey);
        }

        let url = format!("{}/current.json", self.config.base_url);
        let response = self
            .client
            .get(url)
            .query(&[
                ("key", self.config.api_key.as_str()),
                ("q", self.config.location.as_str()),
                ("aqi", "no"),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(WeatherError::Status(status));
        }

        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    pub async fn poll(&self) -> Result<WeatherSample, WeatherError> {
        let result = self
            .fetch()
            .await
            .map(|conditions| conditions.sample(Utc::now()));
        self.apply(result).await
    }

    /// Records a successful poll; failures leave the previous sample in place.
    pub async fn apply(
        &self,
        result: Result<WeatherSample, WeatherError>,
    ) -> Result<WeatherSample, WeatherError> {
        let sample = result?;
        debug!(
            "cloud cover {}% ({})",
            sample.cloud_cover_pct, sample.condition
        );
        *self.latest.write().await = Some(sample.clone());
        Ok(sample)
    }

    #[cfg(test)]
    pub async fn latest(&self) -> Option<WeatherSample> {
        self.latest.read().await.clone()
    }

    /// `None` until a poll has succeeded.
    pub async fn is_overcast(&self) -> Option<bool> {
        self.latest
            .read()
            .await
            .as_ref()
            .map(|sample| sample.is_overcast(self.config.cloud_threshold_pct))
    }

    pub async fn sky(&self) -> Option<Sky> {
        self.is_overcast()
            .await
            .map(|overcast| if overcast { Sky::Overcast } else { Sky::Sunny })
    }

    /// Geolocation from the provider's metadata for the configured location code.
    pub async fn resolve_location(&self, fallback: &GeoLocation) -> GeoLocation {
        match self.fetch().await {
            Ok(conditions) => match conditions.location() {
                Some(location) => location,
                None => {
                    warn!(
                        "provider location for '{}' is unusable, using {}",
                        self.config.location, fallback.name
                    );
                    fallback.clone()
                }
            },
            Err(err) => {
                warn!(
                    "location lookup failed, using {}: {err}",
                    fallback.name
                );
                fallback.clone()
            }
        }
    }
}

fn build_client(timeout_ms: u64) -> reqwest::Client {
    match reqwest::Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            warn!("weather client setup failed, requests will have no timeout: {err}");
            reqwest::Client::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::{extract::Query, http::StatusCode, routing::get, Json, Router};
    use serde_json::{json, Value};
    use tokio::net::TcpListener;

    use super::*;

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/v1")
    }

    fn payload(cloud: u8) -> Value {
        json!({
            "location": {
                "name": "Greenville",
                "lat": 34.85,
                "lon": -82.39,
                "tz_id": "America/New_York"
            },
            "current": {
                "cloud": cloud,
                "condition": { "text": "Partly cloudy" }
            }
        })
    }

    fn gate(base_url: String) -> WeatherGate {
        WeatherGate::new(WeatherConfig {
            api_key: "test-key".to_string(),
            base_url,
            ..WeatherConfig::default()
        })
    }

    #[tokio::test]
    async fn poll_reads_cloud_cover() {
        let router = Router::new().route(
            "/v1/current.json",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                assert_eq!(params.get("key").map(String::as_str), Some("test-key"));
                assert_eq!(params.get("q").map(String::as_str), Some("29607"));
                assert_eq!(params.get("aqi").map(String::as_str), Some("no"));
                Json(payload(40))
            }),
        );
        let gate = gate(serve(router).await);

        let sample = gate.poll().await.unwrap();
        assert_eq!(sample.cloud_cover_pct, 40);
        assert_eq!(sample.condition, "Partly cloudy");
        assert_eq!(gate.is_overcast().await, Some(true));
        assert_eq!(gate.sky().await, Some(Sky::Overcast));
    }

    #[tokio::test]
    async fn failed_poll_keeps_previous_sample() {
        let router = Router::new().route(
            "/v1/current.json",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "down") }),
        );
        let gate = gate(serve(router).await);
        assert_eq!(gate.sky().await, None);

        let previous = WeatherSample {
            cloud_cover_pct: 5,
            condition: "Sunny".to_string(),
            fetched_at: Utc::now(),
        };
        gate.apply(Ok(previous.clone())).await.unwrap();

        match gate.poll().await {
            Err(WeatherError::Status(status)) => {
                assert_eq!(status, reqwest::StatusCode::SERVICE_UNAVAILABLE)
            }
            other => panic!("unexpected poll result: {other:?}"),
        }
        assert_eq!(gate.latest().await, Some(previous));
        assert_eq!(gate.sky().await, Some(Sky::Sunny));
    }

    #[tokio::test]
    async fn undecodable_body_is_an_error() {
        let router = Router::new().route("/v1/current.json", get(|| async { "not json" }));
        let gate = gate(serve(router).await);

        assert!(matches!(gate.poll().await, Err(WeatherError::Decode(_))));
        assert_eq!(gate.latest().await, None);
    }

    #[tokio::test]
    async fn slow_provider_hits_the_request_timeout() {
        let router = Router::new().route(
            "/v1/current.json",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(payload(0))
            }),
        );
        let gate = WeatherGate::new(WeatherConfig {
            api_key: "test-key".to_string(),
            base_url: serve(router).await,
            request_timeout_ms: 100,
            ..WeatherConfig::default()
        });

        match gate.poll().await {
            Err(WeatherError::Transport(err)) => assert!(err.is_timeout(), "{err}"),
            other => panic!("unexpected poll result: {other:?}"),
        }
        assert_eq!(gate.sky().await, None);
    }

    #[tokio::test]
    async fn missing_key_skips_the_request() {
        let gate = WeatherGate::new(WeatherConfig::default());
        assert!(matches!(gate.poll().await, Err(WeatherError::MissingApiKey)));
    }

    #[tokio::test]
    async fn resolves_location_from_provider_metadata() {
        let router = Router::new().route("/v1/current.json", get(|| async { Json(payload(0)) }));
        let gate = gate(serve(router).await);

        let location = gate.resolve_location(&GeoLocation::fallback()).await;
        assert_eq!(location.name, "Greenville");
        assert_eq!(location.timezone, "America/New_York");
    }

    #[tokio::test]
    async fn location_falls_back_when_provider_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let gate = gate(format!("http://{addr}/v1"));
        let location = gate.resolve_location(&GeoLocation::fallback()).await;
        assert_eq!(location, GeoLocation::fallback());
    }
}
