//! Engine configuration.

use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracewire::tw_warn;

/// Environment variable overriding the pending-span timeout, in
/// milliseconds.
pub(crate) const TRACEWIRE_PENDING_SPAN_TIMEOUT: &str = "TRACEWIRE_PENDING_SPAN_TIMEOUT";
/// Default timeout after which a span whose completion never arrived is
/// force-finalized.
pub(crate) const PENDING_SPAN_TIMEOUT_DEFAULT: u64 = 30_000;

/// Default number of stack frames retained on a span.
pub(crate) const MAX_STACK_FRAMES_DEFAULT: usize = 10;

/// Tracer configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// How long a span may stay pending before the reaper force-finalizes
    /// it with a timeout-class error.
    pub pending_span_timeout: Duration,
    /// Whether spans capture a call-stack snapshot at creation.
    pub collect_stack_traces: bool,
    /// Maximum number of stack frames retained per span.
    pub max_stack_frames: usize,
}

impl Default for Config {
    /// Default configuration, with the pending-span timeout overridable via
    /// `TRACEWIRE_PENDING_SPAN_TIMEOUT`.
    fn default() -> Self {
        let mut timeout_ms = PENDING_SPAN_TIMEOUT_DEFAULT;
        if let Some(value) = env_var(TRACEWIRE_PENDING_SPAN_TIMEOUT) {
            timeout_ms = value;
        }
        Config {
            pending_span_timeout: Duration::from_millis(timeout_ms),
            collect_stack_traces: true,
            max_stack_frames: MAX_STACK_FRAMES_DEFAULT,
        }
    }
}

fn env_var<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match T::from_str(raw.trim()) {
        Ok(value) => Some(value),
        Err(_) => {
            tw_warn!(
                name: "Config.InvalidEnvValue",
                variable = name.to_string(),
                value = raw
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        temp_env::with_var_unset(TRACEWIRE_PENDING_SPAN_TIMEOUT, || {
            let config = Config::default();
            assert_eq!(config.pending_span_timeout, Duration::from_millis(30_000));
            assert!(config.collect_stack_traces);
            assert_eq!(config.max_stack_frames, 10);
        });
    }

    #[test]
    fn pending_timeout_from_env() {
        temp_env::with_var(TRACEWIRE_PENDING_SPAN_TIMEOUT, Some("2500"), || {
            let config = Config::default();
            assert_eq!(config.pending_span_timeout, Duration::from_millis(2_500));
        });
    }

    #[test]
    fn invalid_env_value_falls_back_to_default() {
        temp_env::with_var(TRACEWIRE_PENDING_SPAN_TIMEOUT, Some("soon"), || {
            let config = Config::default();
            assert_eq!(config.pending_span_timeout, Duration::from_millis(30_000));
        });
    }
}
