use crate::config::ConfigError;
use chrono::Timelike;
use std::str::FromStr;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::{format::Writer, time::FormatTime};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct SystemTime;

impl FormatTime for SystemTime {
    fn format_time(&self, w: &mut Writer<'_>) -> core::fmt::Result {
        let time = chrono::prelude::Local::now();
        write!(
            w,
            "{:02}:{:02}:{:02}.{:03}",
            time.hour() % 24,
            time.minute(),
            time.second(),
            time.timestamp_subsec_millis()
        )
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the default level;
/// `json` switches stdout to one JSON object per event.
pub fn init_tracing(json: bool) -> Result<(), ConfigError> {
    let filter = EnvFilter::builder()
        .with_default_directive(
            Directive::from_str("switchyard=info")
                .map_err(|_| ConfigError::Internal("Tracing filter"))?,
        )
        .from_env_lossy();
    if json {
        let stdout_layer = fmt::layer()
            .json()
            .with_writer(std::io::stdout)
            .with_timer(SystemTime);
        tracing_subscriber::registry()
            .with(stdout_layer)
            .with(filter)
            .try_init()
            .map_err(|_| ConfigError::Internal("Tracing subscriber already set"))
    } else {
        let stdout_layer = fmt::layer()
            .compact()
            .with_writer(std::io::stdout)
            .with_timer(SystemTime);
        tracing_subscriber::registry()
            .with(stdout_layer)
            .with(filter)
            .try_init()
            .map_err(|_| ConfigError::Internal("Tracing subscriber already set"))
    }
}
