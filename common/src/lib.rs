pub mod adaptive;
pub mod channel;
pub mod config;
pub mod hub;
pub mod schedule;
pub mod types;
pub mod weather;

pub use adaptive::{AdaptiveLoop, AdaptiveStep};
pub use channel::{ChannelError, ChannelTarget, NavigationPlan, NavigationStep, RemoteButton};
pub use config::{ControllerConfig, PinLayout, WeatherConfig};
pub use hub::{HubContact, ModeChange};
pub use schedule::{
    ScheduleEngine, ScheduleError, ScheduleEvent, ScheduleOffsets, SchedulePhase, ScheduleWindow,
};
pub use types::{
    BlindAction, ChannelState, CommandRequest, CommandResponse, ControllerStatus, PowerState,
};
pub use weather::{CurrentConditions, GeoLocation, Sky, WeatherSample};
