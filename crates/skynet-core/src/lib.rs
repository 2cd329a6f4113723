pub mod config;
pub mod time;

pub use config::{
    ConfigError, ControlPlaneConfig, GatewayConfig, HealthSettings, ReaperSettings, SchedulerSettings,
    ScoringSettings, StoreSettings,
};
pub use time::{epoch_millis, parse_duration};
