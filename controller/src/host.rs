use std::{
    net::SocketAddr,
    str::FromStr,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use blinds_common::{
    channel::STEP_PRESS_MS,
    hub::EVALUATE_INTERVAL_MS,
    schedule::to_local,
    AdaptiveLoop, AdaptiveStep, BlindAction, ChannelTarget, CommandRequest, CommandResponse,
    ControllerConfig, ControllerStatus, GeoLocation, HubContact, ModeChange, RemoteButton,
    ScheduleEngine, ScheduleEvent, SchedulePhase, ScheduleWindow,
};
use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::{net::TcpListener, sync::Mutex};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::{
    pins::{self, PinBus},
    remote::{Completion, OperationOutcome, RemoteController, RemoteError},
    weather::WeatherGate,
};

const RECONCILE_INTERVAL: Duration = Duration::from_secs(1);
const DISPATCH_INTERVAL: Duration = Duration::from_secs(60);
const MIN_PRESS_MS: u64 = 100;
const MAX_PRESS_MS: u64 = 5_000;

#[derive(Clone)]
struct AppState {
    config: Arc<ControllerConfig>,
    remote: RemoteController,
    schedule: Arc<Mutex<ScheduleEngine>>,
    adaptive: Arc<Mutex<AdaptiveLoop>>,
    location: Arc<Mutex<GeoLocation>>,
    weather: Arc<WeatherGate>,
    hub: Arc<Mutex<HubContact>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct ChannelSelectionStatus {
    in_progress: bool,
}

#[derive(Debug, Serialize)]
struct ScheduleView {
    sunset: Option<DateTime<FixedOffset>>,
    lower_time: Option<DateTime<FixedOffset>>,
    raise_time: Option<DateTime<FixedOffset>>,
    lower_offset: i64,
    raise_offset: i64,
    phase: SchedulePhase,
    location: String,
}

#[derive(Debug, Serialize)]
struct InfoView {
    location_name: String,
    hub_url: String,
    pin_driver: &'static str,
}

#[derive(Debug, Error)]
enum CommandError {
    #[error("Invalid request format")]
    InvalidRequest,
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
    #[error("Invalid channel")]
    InvalidChannel,
    #[error("Invalid button")]
    InvalidButton,
    #[error("Remote is off")]
    RemoteOff,
    #[error("Remote operation failed")]
    OperationFailed,
    #[error("Remote unavailable: {0}")]
    Unavailable(RemoteError),
}

impl CommandError {
    fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest
            | Self::UnknownCommand(_)
            | Self::InvalidChannel
            | Self::InvalidButton => StatusCode::BAD_REQUEST,
            Self::RemoteOff => StatusCode::CONFLICT,
            Self::OperationFailed => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for CommandError {
    fn into_response(self) -> Response {
        (self.status(), Json(CommandResponse::failed(self.to_string()))).into_response()
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Arc::new(load_config());
    info!(
        "starting '{}' (hub {}, weather location {})",
        config.location_name, config.hub_url, config.weather.location
    );

    let driver = pins::select_driver(&config.pins);
    let remote = RemoteController::spawn(
        PinBus::new(driver),
        config.pins,
        config.default_channel,
    );

    let app_state = build_state(config.clone(), remote);

    if let Err(err) = reschedule(&app_state).await {
        warn!("initial schedule computation failed: {err:#}");
    }

    spawn_reconcile_loop(app_state.clone());
    spawn_hub_loop(app_state.clone());
    spawn_schedule_loop(app_state.clone());
    spawn_weather_loop(app_state.clone());

    let app = router(app_state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("controller server failed")?;

    app_state.remote.shutdown().await;
    info!("remote powered down, pins released");
    Ok(())
}

fn build_state(config: Arc<ControllerConfig>, remote: RemoteController) -> AppState {
    AppState {
        schedule: Arc::new(Mutex::new(ScheduleEngine::new(config.offsets))),
        adaptive: Arc::new(Mutex::new(AdaptiveLoop::new())),
        location: Arc::new(Mutex::new(config.fallback_location.clone())),
        weather: Arc::new(WeatherGate::new(config.weather.clone())),
        hub: Arc::new(Mutex::new(HubContact::new(monotonic_ms()))),
        remote,
        config,
    }
}

fn router(app_state: AppState) -> Router {
    // Only the hub polls these two; dashboard traffic is not hub contact.
    let hub_routes: Router<AppState> = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/command", post(handle_command))
        .route_layer(middleware::from_fn_with_state(
            app_state.clone(),
            record_hub_contact,
        ));

    Router::new()
        .merge(hub_routes)
        .route(
            "/api/channel_selection_status",
            get(handle_get_channel_selection_status),
        )
        .route("/api/schedule", get(handle_get_schedule))
        .route("/api/schedule/reschedule", post(handle_reschedule))
        .route("/api/info", get(handle_get_info))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

fn load_config() -> ControllerConfig {
    let mut config = ControllerConfig::default();

    if let Ok(value) = std::env::var("BLINDS_LOCATION_NAME") {
        config.location_name = value;
    }
    if let Ok(value) = std::env::var("BLINDS_HUB_URL") {
        config.hub_url = value;
    }
    if let Ok(value) = std::env::var("WEATHER_API_KEY") {
        config.weather.api_key = value;
    }
    if let Ok(value) = std::env::var("WEATHER_LOCATION") {
        config.weather.location = value;
    }
    if let Ok(value) = std::env::var("WEATHER_BASE_URL") {
        config.weather.base_url = value;
    }
    if let Some(value) = env_parse("CLOUD_THRESHOLD") {
        config.weather.cloud_threshold_pct = value;
    }
    if let Some(value) = env_parse("MONITORING_INTERVAL_MIN") {
        config.weather.monitoring_interval_min = value;
    }
    if let Some(value) = env_parse("LOWER_OFFSET_MIN") {
        config.offsets.lower_offset_min = value;
    }
    if let Some(value) = env_parse("RAISE_OFFSET_MIN") {
        config.offsets.raise_offset_min = value;
    }
    if let Some(value) = env_parse::<ChannelTarget>("DEFAULT_CHANNEL") {
        config.default_channel = value;
    }
    if let Some(value) = env_parse("CONTROLLER_HTTP_PORT") {
        config.http_port = value;
    }

    config.sanitize();
    config
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let value = std::env::var(key).ok()?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("ignoring unparsable {key}={value}");
            None
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("ctrl-c handler failed: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

fn spawn_reconcile_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(RECONCILE_INTERVAL);
        loop {
            interval.tick().await;
            match app_state.remote.reconcile().await {
                Ok(Some(power)) => info!("remote power drifted, now {}", power.as_str()),
                Ok(None) => {}
                Err(err) => warn!("power reconcile failed: {err}"),
            }
        }
    });
}

fn spawn_hub_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(EVALUATE_INTERVAL_MS));
        loop {
            interval.tick().await;
            let change = app_state.hub.lock().await.evaluate(monotonic_ms());
            log_mode_change(change);
        }
    });
}

fn spawn_schedule_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(DISPATCH_INTERVAL);
        loop {
            interval.tick().await;
            let now = local_now(&app_state).await;
            if let Err(err) = schedule_tick(&app_state, now).await {
                warn!("schedule tick failed: {err:#}");
            }
        }
    });
}

fn spawn_weather_loop(app_state: AppState) {
    tokio::spawn(async move {
        let minutes = app_state.config.weather.monitoring_interval_min;
        let mut interval = tokio::time::interval(Duration::from_secs(minutes * 60));
        loop {
            interval.tick().await;
            if let Err(err) = app_state.weather.poll().await {
                warn!("weather poll failed, keeping last sample: {err}");
            }
            let now = local_now(&app_state).await;
            adaptive_tick(&app_state, now).await;
        }
    });
}

fn log_mode_change(change: Option<ModeChange>) {
    match change {
        Some(ModeChange::EnteredStandalone) => {
            info!("no hub contact for 5 minutes, operating in standalone mode")
        }
        Some(ModeChange::Reconnected) => info!("hub contact restored"),
        None => {}
    }
}

async fn local_now(app_state: &AppState) -> DateTime<FixedOffset> {
    let location = app_state.location.lock().await;
    let tz = location
        .tz()
        .or_else(|| app_state.config.fallback_location.tz())
        .unwrap_or(chrono_tz::America::New_York);
    to_local(tz, Utc::now())
}

async fn reschedule(app_state: &AppState) -> anyhow::Result<ScheduleWindow> {
    let fallback = &app_state.config.fallback_location;
    let location = app_state.weather.resolve_location(fallback).await;
    let tz = location
        .tz()
        .with_context(|| format!("unknown timezone {}", location.timezone))?;
    let now = to_local(tz, Utc::now());
    let offsets = app_state.config.offsets;

    let (location, window) =
        match ScheduleWindow::for_location(&location, now.date_naive(), offsets) {
            Ok(window) => (location, window),
            Err(err) => {
                warn!("cannot schedule for {}: {err}, using {}", location.name, fallback.name);
                let tz = fallback
                    .tz()
                    .with_context(|| format!("unknown timezone {}", fallback.timezone))?;
                let window = ScheduleWindow::for_location(
                    fallback,
                    to_local(tz, Utc::now()).date_naive(),
                    offsets,
                )
                .context("fallback location is not schedulable")?;
                (fallback.clone(), window)
            }
        };

    info!(
        "schedule for {} on {}: sunset {}, lower {}, raise {}",
        location.name,
        window.date,
        window.sunset.format("%H:%M"),
        window.lower_time.format("%H:%M"),
        window.raise_time.format("%H:%M"),
    );

    *app_state.location.lock().await = location;
    app_state
        .schedule
        .lock()
        .await
        .reschedule(window.clone(), now);
    Ok(window)
}

async fn schedule_tick(app_state: &AppState, now: DateTime<FixedOffset>) -> anyhow::Result<()> {
    let stale = app_state
        .schedule
        .lock()
        .await
        .needs_reschedule(now.date_naive());
    if stale {
        reschedule(app_state).await?;
    }

    let sky = app_state.weather.sky().await;
    let events = app_state.schedule.lock().await.tick(now, sky);
    if events.is_empty() {
        return Ok(());
    }

    for event in events {
        match event {
            ScheduleEvent::Fire(action) => {
                if !dispatch_action(app_state, action, "schedule").await {
                    app_state.schedule.lock().await.retry(action);
                }
            }
            ScheduleEvent::LowerSkippedOvercast => {
                info!("scheduled lower skipped: sky is overcast")
            }
        }
    }
    app_state.schedule.lock().await.finish_firing();
    Ok(())
}

async fn adaptive_tick(app_state: &AppState, now: DateTime<FixedOffset>) {
    let window = app_state.schedule.lock().await.window().cloned();
    let blinds_lowered = app_state.remote.session().await.blinds_lowered;
    let sky = app_state.weather.sky().await;

    let step = app_state
        .adaptive
        .lock()
        .await
        .step(now, window.as_ref(), blinds_lowered, sky);

    match step {
        AdaptiveStep::Act(action) => {
            dispatch_action(app_state, action, "weather").await;
        }
        AdaptiveStep::ResetForDay => {
            app_state.remote.forget_blind_position().await;
            debug!("monitoring window closed, blind position reset");
        }
        AdaptiveStep::NoReading => debug!("no weather reading yet, holding blinds"),
        AdaptiveStep::Hold | AdaptiveStep::Outside => {}
    }
}

/// Returns false when the remote refused the action outright.
async fn dispatch_action(app_state: &AppState, action: BlindAction, reason: &str) -> bool {
    info!("{reason}: {} blinds", action.as_str());
    match app_state.remote.dispatch(action).await {
        Ok(completion) => {
            let outcome = completion.wait().await;
            if outcome != OperationOutcome::Completed {
                warn!("{reason} {} finished as {outcome:?}", action.as_str());
            }
            true
        }
        Err(err) => {
            warn!("{reason} {} not dispatched: {err}", action.as_str());
            false
        }
    }
}

/// Recorded after the handler, so `/api/status` still reports the mode the
/// hub is coming back to.
async fn record_hub_contact(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let response = next.run(request).await;
    let change = state.hub.lock().await.record_contact(monotonic_ms());
    log_mode_change(change);
    response
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let session = state.remote.session().await;
    let standalone_mode = state.hub.lock().await.standalone();

    Json(ControllerStatus {
        location_name: state.config.location_name.clone(),
        remote_on: session.power.is_on(),
        channel_status: session.channel.to_string(),
        blinds_lowered: session.blinds_lowered,
        standalone_mode,
        channel_selection_in_progress: session.operation_in_progress,
    })
}

async fn handle_get_channel_selection_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(ChannelSelectionStatus {
        in_progress: state.remote.session().await.operation_in_progress,
    })
}

async fn handle_command(
    State(state): State<AppState>,
    payload: Result<Json<CommandRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            debug!("command body rejected: {rejection}");
            return CommandError::InvalidRequest.into_response();
        }
    };

    match execute_command(&state, &request).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => {
            debug!("command {} rejected: {err}", request.command);
            err.into_response()
        }
    }
}

async fn execute_command(
    state: &AppState,
    request: &CommandRequest,
) -> Result<CommandResponse, CommandError> {
    let remote = &state.remote;
    match request.command.as_str() {
        "raise_blinds" => finish(remote.raise_blinds().await).await,
        "lower_blinds" => finish(remote.lower_blinds().await).await,
        "stop_blinds" => finish(remote.stop_blinds().await).await,
        "toggle_remote" => {
            let response = finish(remote.toggle().await).await?;
            let remote_on = remote.session().await.power.is_on();
            Ok(response.with_remote_on(remote_on))
        }
        "select_channel" => {
            let target = channel_param(request)?;
            accept(remote.go_to_channel(target).await)
        }
        "select_all_channels" => accept(remote.select_all_channels().await),
        "pair" => accept(remote.pair().await),
        "press_button" => {
            let button = request
                .params
                .get("button")
                .and_then(|value| value.as_str())
                .and_then(RemoteButton::from_name)
                .ok_or(CommandError::InvalidButton)?;
            let duration_ms = request
                .params
                .get("duration_ms")
                .and_then(|value| value.as_u64())
                .unwrap_or(STEP_PRESS_MS)
                .clamp(MIN_PRESS_MS, MAX_PRESS_MS);
            finish(remote.press_button(button, duration_ms).await).await
        }
        other => Err(CommandError::UnknownCommand(other.to_string())),
    }
}

fn channel_param(request: &CommandRequest) -> Result<ChannelTarget, CommandError> {
    request
        .params
        .get("channel")
        .and_then(|value| value.as_i64())
        .and_then(|channel| u8::try_from(channel).ok())
        .and_then(|channel| ChannelTarget::channel(channel).ok())
        .ok_or(CommandError::InvalidChannel)
}

/// Waits for the hardware to finish. A request that lost the single-flight race
/// is reported as not accepted rather than as an error.
async fn finish(
    submitted: Result<Completion, RemoteError>,
) -> Result<CommandResponse, CommandError> {
    let completion = match submitted {
        Ok(completion) => completion,
        Err(RemoteError::Busy) => return Ok(CommandResponse::ok().with_accepted(false)),
        Err(RemoteError::PoweredOff) => return Err(CommandError::RemoteOff),
        Err(err) => return Err(CommandError::Unavailable(err)),
    };

    match completion.wait().await {
        OperationOutcome::Completed => Ok(CommandResponse::ok()),
        OperationOutcome::Skipped => Err(CommandError::RemoteOff),
        OperationOutcome::Cancelled | OperationOutcome::Failed => {
            Err(CommandError::OperationFailed)
        }
    }
}

/// Long-running operations answer as soon as the worker has them queued.
fn accept(
    submitted: Result<Completion, RemoteError>,
) -> Result<CommandResponse, CommandError> {
    match submitted {
        Ok(_) => Ok(CommandResponse::ok().with_accepted(true)),
        Err(RemoteError::Busy) => Ok(CommandResponse::ok().with_accepted(false)),
        Err(RemoteError::PoweredOff) => Err(CommandError::RemoteOff),
        Err(err) => Err(CommandError::Unavailable(err)),
    }
}

async fn handle_get_schedule(State(state): State<AppState>) -> impl IntoResponse {
    let location = state.location.lock().await.name.clone();
    let schedule = state.schedule.lock().await;
    let offsets = schedule.offsets();
    let window = schedule.window();

    Json(ScheduleView {
        sunset: window.map(|window| window.sunset),
        lower_time: window.map(|window| window.lower_time),
        raise_time: window.map(|window| window.raise_time),
        lower_offset: offsets.lower_offset_min,
        raise_offset: offsets.raise_offset_min,
        phase: schedule.phase(),
        location,
    })
}

async fn handle_reschedule(State(state): State<AppState>) -> Response {
    if let Err(err) = reschedule(&state).await {
        warn!("reschedule failed: {err:#}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to compute schedule");
    }
    handle_get_schedule(State(state)).await.into_response()
}

async fn handle_get_info(State(state): State<AppState>) -> impl IntoResponse {
    Json(InfoView {
        location_name: state.config.location_name.clone(),
        hub_url: state.config.hub_url.clone(),
        pin_driver: state.remote.pin_backend(),
    })
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use blinds_common::{hub::STANDALONE_AFTER_MS, PinLayout, WeatherConfig, WeatherSample};
    use chrono::{NaiveDate, TimeZone};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::pins::{PinMode, SimulatedDriver};

    fn test_state() -> AppState {
        test_state_with(SimulatedDriver::new())
    }

    fn test_state_with(driver: SimulatedDriver) -> AppState {
        let config = ControllerConfig {
            location_name: "Den".to_string(),
            weather: WeatherConfig {
                base_url: "http://127.0.0.1:9/v1".to_string(),
                ..WeatherConfig::default()
            },
            ..ControllerConfig::default()
        };
        let remote = RemoteController::spawn(
            PinBus::new(Arc::new(driver)),
            config.pins,
            config.default_channel,
        );
        build_state(Arc::new(config), remote)
    }

    async fn send(state: &AppState, request: axum::http::Request<Body>) -> (StatusCode, Value) {
        let response = router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn get_json(state: &AppState, uri: &str) -> (StatusCode, Value) {
        let request = axum::http::Request::get(uri).body(Body::empty()).unwrap();
        send(state, request).await
    }

    async fn command(state: &AppState, body: Value) -> (StatusCode, Value) {
        let request = axum::http::Request::post("/api/command")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        send(state, request).await
    }

    fn evening(hour: u32, minute: u32) -> DateTime<FixedOffset> {
        FixedOffset::west_opt(4 * 3600)
            .unwrap()
            .with_ymd_and_hms(2026, 10, 18, hour, minute, 0)
            .unwrap()
    }

    /// Sunset 18:45, so lower at 15:33 and raise at 18:45.
    async fn install_window(state: &AppState) {
        let date = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        let window = ScheduleWindow::from_sunset(date, evening(18, 45), state.config.offsets);
        state
            .schedule
            .lock()
            .await
            .reschedule(window, evening(9, 0));
    }

    async fn set_cloud_cover(state: &AppState, cloud_cover_pct: u8) {
        let sample = WeatherSample {
            cloud_cover_pct,
            condition: "test".to_string(),
            fetched_at: Utc::now(),
        };
        state.weather.apply(Ok(sample)).await.unwrap();
    }

    fn presses(driver: &SimulatedDriver, pin: u8) -> usize {
        driver
            .journal()
            .iter()
            .filter(|event| event.pin == pin && event.mode == PinMode::OutputLow)
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn status_reports_initial_state() {
        let state = test_state();
        let (status, body) = get_json(&state, "/api/status").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({
                "location_name": "Den",
                "remote_on": false,
                "channel_status": "All Channels",
                "blinds_lowered": false,
                "standalone_mode": false,
                "channel_selection_in_progress": false
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn status_reports_standalone_until_the_hub_returns() {
        let state = test_state();
        {
            let mut hub = state.hub.lock().await;
            *hub = HubContact::new(0);
            assert_eq!(
                hub.evaluate(STANDALONE_AFTER_MS + 100_000),
                Some(ModeChange::EnteredStandalone)
            );
        }

        // Dashboard polling is not hub contact.
        get_json(&state, "/api/channel_selection_status").await;
        get_json(&state, "/api/schedule").await;
        assert!(state.hub.lock().await.standalone());

        let (_, body) = get_json(&state, "/api/status").await;
        assert_eq!(body["standalone_mode"], true);

        let (_, body) = get_json(&state, "/api/status").await;
        assert_eq!(body["standalone_mode"], false);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_command_body_is_rejected() {
        let state = test_state();
        let (status, body) = command(&state, json!({"params": {"channel": 3}})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body,
            json!({"success": false, "error": "Invalid request format"})
        );

        let request = axum::http::Request::post("/api/command")
            .header("content-type", "text/plain")
            .body(Body::from("lower_blinds"))
            .unwrap();
        let (status, body) = send(&state, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body,
            json!({"success": false, "error": "Invalid request format"})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_command_is_rejected() {
        let state = test_state();
        let (status, body) = command(&state, json!({"command": "dance"})).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body,
            json!({"success": false, "error": "Unknown command: dance"})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_range_channel_changes_nothing() {
        let state = test_state();
        command(&state, json!({"command": "toggle_remote"})).await;
        let before = state.remote.session().await;

        let (status, body) = command(
            &state,
            json!({"command": "select_channel", "params": {"channel": 20}}),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"success": false, "error": "Invalid channel"}));
        assert_eq!(state.remote.session().await, before);
    }

    #[tokio::test(start_paused = true)]
    async fn select_channel_needs_the_remote_on() {
        let state = test_state();
        let (status, body) = command(
            &state,
            json!({"command": "select_channel", "params": {"channel": 3}}),
        )
        .await;

        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body, json!({"success": false, "error": "Remote is off"}));

        let (status, body) = command(&state, json!({"command": "pair"})).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body, json!({"success": false, "error": "Remote is off"}));
    }

    #[tokio::test(start_paused = true)]
    async fn buttons_are_refused_during_channel_selection() {
        let driver = SimulatedDriver::new();
        let state = test_state_with(driver.clone());
        let layout = PinLayout::default();
        command(&state, json!({"command": "toggle_remote"})).await;
        command(
            &state,
            json!({"command": "select_channel", "params": {"channel": 5}}),
        )
        .await;

        let (status, body) = command(
            &state,
            json!({"command": "press_button", "params": {"button": "Channel Up"}}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"success": true, "accepted": false}));

        let (_, body) = command(&state, json!({"command": "pair"})).await;
        assert_eq!(body, json!({"success": true, "accepted": false}));

        while state.remote.session().await.operation_in_progress {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert_eq!(presses(&driver, layout.channel_up), 5);
        assert_eq!(presses(&driver, layout.up), 0);
        let (_, body) = get_json(&state, "/api/status").await;
        assert_eq!(body["channel_status"], "Channel 5");
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_lower_presses_down() {
        let driver = SimulatedDriver::new();
        let state = test_state_with(driver.clone());
        let layout = PinLayout::default();
        install_window(&state).await;

        schedule_tick(&state, evening(15, 32)).await.unwrap();
        assert_eq!(presses(&driver, layout.down), 0);

        schedule_tick(&state, evening(15, 33)).await.unwrap();
        assert_eq!(presses(&driver, layout.down), 1);
        assert!(state.remote.session().await.blinds_lowered);
        assert_eq!(state.schedule.lock().await.phase(), SchedulePhase::Scheduled);

        schedule_tick(&state, evening(18, 45)).await.unwrap();
        assert_eq!(presses(&driver, layout.up), 1);
        assert!(!state.remote.session().await.blinds_lowered);
        assert_eq!(state.schedule.lock().await.phase(), SchedulePhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn overcast_sky_skips_the_scheduled_lower() {
        let driver = SimulatedDriver::new();
        let state = test_state_with(driver.clone());
        install_window(&state).await;
        set_cloud_cover(&state, 80).await;

        schedule_tick(&state, evening(15, 33)).await.unwrap();
        assert_eq!(presses(&driver, PinLayout::default().down), 0);
        assert!(!state.remote.session().await.blinds_lowered);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_remote_delays_the_scheduled_lower() {
        let driver = SimulatedDriver::new();
        let state = test_state_with(driver.clone());
        let layout = PinLayout::default();
        install_window(&state).await;

        state.remote.toggle().await.unwrap().wait().await;
        let selection = state
            .remote
            .go_to_channel(ChannelTarget::Channel(4))
            .await
            .unwrap();

        schedule_tick(&state, evening(15, 33)).await.unwrap();
        assert_eq!(presses(&driver, layout.down), 0);
        assert_eq!(state.schedule.lock().await.phase(), SchedulePhase::Scheduled);

        assert_eq!(selection.wait().await, OperationOutcome::Completed);
        schedule_tick(&state, evening(15, 34)).await.unwrap();
        assert_eq!(presses(&driver, layout.down), 1);
        assert!(state.remote.session().await.blinds_lowered);
    }

    #[tokio::test(start_paused = true)]
    async fn weather_follower_presses_once_per_edge() {
        let driver = SimulatedDriver::new();
        let state = test_state_with(driver.clone());
        let layout = PinLayout::default();
        install_window(&state).await;

        for (minute, cloud) in [(0, 0), (10, 0), (20, 80), (30, 80), (40, 0), (50, 0)] {
            set_cloud_cover(&state, cloud).await;
            adaptive_tick(&state, evening(16, minute)).await;
        }
        assert_eq!(presses(&driver, layout.down), 2);
        assert_eq!(presses(&driver, layout.up), 1);
        assert!(state.remote.session().await.blinds_lowered);

        adaptive_tick(&state, evening(19, 0)).await;
        assert!(!state.remote.session().await.blinds_lowered);
        assert_eq!(presses(&driver, layout.up), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn weather_follower_waits_for_a_reading() {
        let driver = SimulatedDriver::new();
        let state = test_state_with(driver.clone());
        install_window(&state).await;

        adaptive_tick(&state, evening(16, 0)).await;
        let layout = PinLayout::default();
        assert_eq!(presses(&driver, layout.down), 0);
        assert_eq!(presses(&driver, layout.up), 0);
        assert!(!state.remote.session().await.blinds_lowered);
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_then_select_channel() {
        let state = test_state();
        let (status, body) = command(&state, json!({"command": "toggle_remote"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"success": true, "remote_on": true}));

        let (_, body) = command(
            &state,
            json!({"command": "select_channel", "params": {"channel": 5}}),
        )
        .await;
        assert_eq!(body, json!({"success": true, "accepted": true}));

        let (_, body) = command(
            &state,
            json!({"command": "select_channel", "params": {"channel": 12}}),
        )
        .await;
        assert_eq!(body, json!({"success": true, "accepted": false}));

        let (_, body) = get_json(&state, "/api/status").await;
        assert_eq!(body["channel_status"], "Channel 5");
        assert_eq!(body["channel_selection_in_progress"], true);

        let (_, body) = get_json(&state, "/api/channel_selection_status").await;
        assert_eq!(body, json!({"in_progress": true}));
    }

    #[tokio::test(start_paused = true)]
    async fn lower_blinds_reports_position() {
        let state = test_state();
        let (status, body) = command(&state, json!({"command": "lower_blinds"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"success": true}));

        let (_, body) = get_json(&state, "/api/status").await;
        assert_eq!(body["blinds_lowered"], true);
        assert_eq!(body["remote_on"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn press_button_validates_the_name() {
        let state = test_state();
        let (status, body) = command(
            &state,
            json!({"command": "press_button", "params": {"button": "Channel Sideways"}}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"success": false, "error": "Invalid button"}));
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_is_empty_before_first_computation() {
        let state = test_state();
        let (status, body) = get_json(&state, "/api/schedule").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({
                "sunset": null,
                "lower_time": null,
                "raise_time": null,
                "lower_offset": 192,
                "raise_offset": 0,
                "phase": "idle",
                "location": "New York"
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn info_names_the_pin_driver() {
        let state = test_state();
        let (_, body) = get_json(&state, "/api/info").await;
        assert_eq!(
            body,
            json!({
                "location_name": "Den",
                "hub_url": "http://192.168.4.202:5001/",
                "pin_driver": "simulated"
            })
        );
    }

    #[tokio::test]
    async fn reschedule_falls_back_to_default_location() {
        let state = test_state();
        let window = reschedule(&state).await.unwrap();

        assert_eq!(state.location.lock().await.name, "New York");
        assert_eq!(
            window.sunset - window.lower_time,
            chrono::Duration::minutes(192)
        );
        assert_eq!(state.schedule.lock().await.window(), Some(&window));
    }
}
