use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::aquarium::constants::timing;

/// Configuration problems caught before the server starts
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} cannot be 0")]
    Zero(&'static str),
    #[error("PORT and STATUS_PORT must differ (both {0})")]
    PortClash(u16),
    #[error("TICK_RATE must be 1-240, got {0}")]
    TickRate(u32),
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address both listeners bind to
    pub bind_address: IpAddr,
    /// Telnet port for aquarium sessions
    pub port: u16,
    /// HTTP port for health and metrics
    pub status_port: u16,
    /// Directory holding the sprite and floor tile PNGs
    pub asset_dir: PathBuf,
    /// Slow 1 FPS cadence for watching frames one at a time
    pub debug: bool,
    /// Scheduler cadence in Hz when not in debug mode
    pub tick_rate: u32,
    /// Fish spawned for every session
    pub fish_per_session: usize,
    /// How long to wait for the pixel-size report before using defaults
    pub negotiation_timeout: Duration,
    /// Longest a single write to a session may take
    pub write_timeout: Duration,
    /// Frames queued per session before new ones are dropped
    pub outbound_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: 1234,
            status_port: 8080,
            asset_dir: PathBuf::from("."),
            debug: false,
            tick_rate: timing::TICK_RATE,
            fish_per_session: 1,
            negotiation_timeout: Duration::from_millis(2000),
            write_timeout: Duration::from_millis(1000),
            outbound_queue: 64,
        }
    }
}

/// Read and parse one variable; a bad value is logged and ignored
fn env_value<T: FromStr>(name: &str, accept: impl Fn(&T) -> bool) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) if accept(&value) => Some(value),
        Ok(_) => {
            tracing::warn!("{} '{}' out of range, using default", name, raw);
            None
        }
        Err(_) => {
            tracing::warn!("Invalid {} '{}', using default", name, raw);
            None
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => {
            tracing::warn!("Invalid {} '{}', using default", name, raw);
            None
        }
    }
}

impl ServerConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        if let Some(addr) = env_value("BIND_ADDRESS", |_: &IpAddr| true) {
            config.bind_address = addr;
        }
        if let Some(port) = env_value("PORT", |p: &u16| *p > 0) {
            config.port = port;
        }
        if let Some(port) = env_value("STATUS_PORT", |p: &u16| *p > 0) {
            config.status_port = port;
        }
        if let Ok(dir) = std::env::var("ASSET_DIR") {
            config.asset_dir = PathBuf::from(dir);
        }
        if let Some(debug) = env_flag("DEBUG") {
            config.debug = debug;
        }
        if let Some(rate) = env_value("TICK_RATE", |r: &u32| (1..=240).contains(r)) {
            config.tick_rate = rate;
        }
        if let Some(count) = env_value("FISH_PER_SESSION", |n: &usize| (1..=100).contains(n)) {
            config.fish_per_session = count;
        }
        if let Some(ms) = env_value("NEGOTIATION_TIMEOUT_MS", |ms: &u64| *ms > 0) {
            config.negotiation_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_value("WRITE_TIMEOUT_MS", |ms: &u64| *ms > 0) {
            config.write_timeout = Duration::from_millis(ms);
        }
        if let Some(len) = env_value("OUTBOUND_QUEUE", |n: &usize| *n > 0) {
            config.outbound_queue = len;
        }

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Zero("PORT"));
        }
        if self.status_port == 0 {
            return Err(ConfigError::Zero("STATUS_PORT"));
        }
        if self.port == self.status_port {
            return Err(ConfigError::PortClash(self.port));
        }
        if !(1..=240).contains(&self.tick_rate) {
            return Err(ConfigError::TickRate(self.tick_rate));
        }
        if self.fish_per_session == 0 {
            return Err(ConfigError::Zero("FISH_PER_SESSION"));
        }
        if self.outbound_queue == 0 {
            return Err(ConfigError::Zero("OUTBOUND_QUEUE"));
        }
        Ok(())
    }

    /// Effective scheduler cadence
    pub fn tick_interval(&self) -> Duration {
        let rate = if self.debug {
            timing::DEBUG_TICK_RATE
        } else {
            self.tick_rate.max(1)
        };
        Duration::from_secs_f64(1.0 / rate as f64)
    }

    /// The part of the configuration the aquarium engine needs
    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            tick_interval: self.tick_interval(),
            fish_per_session: self.fish_per_session,
            negotiation_timeout: self.negotiation_timeout,
            write_timeout: self.write_timeout,
            outbound_queue: self.outbound_queue,
        }
    }
}

/// Engine-facing settings, fixed for the lifetime of a manager
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tick_interval: Duration,
    pub fish_per_session: usize,
    pub negotiation_timeout: Duration,
    pub write_timeout: Duration,
    pub outbound_queue: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        ServerConfig::default().engine()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 1234);
        assert_eq!(config.status_port, 8080);
        assert_eq!(config.fish_per_session, 1);
        assert_eq!(config.negotiation_timeout, Duration::from_secs(2));
        assert!(!config.debug);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_or_default() {
        let config = ServerConfig::load_or_default();
        assert!(config.port > 0);
    }

    #[test]
    fn test_tick_interval() {
        let mut config = ServerConfig::default();
        assert_eq!(config.tick_interval(), Duration::from_secs_f64(1.0 / 30.0));
        config.debug = true;
        assert_eq!(config.tick_interval(), Duration::from_secs(1));
        assert_eq!(config.engine().tick_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_validate_rejects_port_clash() {
        let config = ServerConfig {
            status_port: 1234,
            ..ServerConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::PortClash(1234)));
    }

    #[test]
    fn test_validate_rejects_zero_fish() {
        let config = ServerConfig {
            fish_per_session: 0,
            ..ServerConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Zero("FISH_PER_SESSION")));
    }
}
