//! Tracing setup and transport log-level mapping.
//!
//! The crate logs through `tracing`. Applications that do not install their
//! own subscriber can call [`init_tracing`], which mirrors the usual
//! `fmt` + `EnvFilter` setup with an `info` default.
//!
//! Transport-level messages arrive with a five-step severity scale
//! (debug, info, warn, error, fatal). [`LogLevelMap`] decides which
//! `tracing` level each one is emitted at. The default map demotes transport
//! chatter one step, so transport `info` only shows up at `debug`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

/// Severity reported by the SSH transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl fmt::Display for TransportLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportLevel::Debug => "debug",
            TransportLevel::Info => "info",
            TransportLevel::Warn => "warn",
            TransportLevel::Error => "error",
            TransportLevel::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

impl FromStr for TransportLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(TransportLevel::Debug),
            "info" => Ok(TransportLevel::Info),
            "warn" | "warning" => Ok(TransportLevel::Warn),
            "error" => Ok(TransportLevel::Error),
            "fatal" => Ok(TransportLevel::Fatal),
            other => Err(format!("unknown transport log level: {other}")),
        }
    }
}

/// Mapping from transport severities to `tracing` levels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLevelMap {
    levels: HashMap<TransportLevel, Level>,
}

impl Default for LogLevelMap {
    fn default() -> Self {
        let levels = HashMap::from([
            (TransportLevel::Debug, Level::TRACE),
            (TransportLevel::Info, Level::DEBUG),
            (TransportLevel::Warn, Level::WARN),
            (TransportLevel::Error, Level::ERROR),
            (TransportLevel::Fatal, Level::ERROR),
        ]);
        Self { levels }
    }
}

impl LogLevelMap {
    /// Override the level a transport severity is emitted at.
    pub fn with_level(mut self, transport: TransportLevel, level: Level) -> Self {
        self.levels.insert(transport, level);
        self
    }

    pub fn level_for(&self, transport: TransportLevel) -> Level {
        self.levels
            .get(&transport)
            .copied()
            .unwrap_or(Level::DEBUG)
    }

    /// Emit a transport message at its mapped level.
    pub fn log(&self, transport: TransportLevel, message: &str) {
        match self.level_for(transport) {
            Level::TRACE => tracing::trace!(target: "ssh_conduit::transport", "{message}"),
            Level::DEBUG => tracing::debug!(target: "ssh_conduit::transport", "{message}"),
            Level::INFO => tracing::info!(target: "ssh_conduit::transport", "{message}"),
            Level::WARN => tracing::warn!(target: "ssh_conduit::transport", "{message}"),
            Level::ERROR => tracing::error!(target: "ssh_conduit::transport", "{message}"),
        }
    }
}

/// Install a global `fmt` subscriber filtered by `RUST_LOG` with an `info` default.
///
/// Returns `false` when a global subscriber was already installed.
pub fn init_tracing() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(LevelFilter::INFO.into()),
        )
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mapping_demotes_chatter() {
        let map = LogLevelMap::default();
        assert_eq!(map.level_for(TransportLevel::Debug), Level::TRACE);
        assert_eq!(map.level_for(TransportLevel::Info), Level::DEBUG);
        assert_eq!(map.level_for(TransportLevel::Warn), Level::WARN);
        assert_eq!(map.level_for(TransportLevel::Error), Level::ERROR);
        assert_eq!(map.level_for(TransportLevel::Fatal), Level::ERROR);
    }

    #[test]
    fn test_override_single_level() {
        let map = LogLevelMap::default().with_level(TransportLevel::Info, Level::INFO);
        assert_eq!(map.level_for(TransportLevel::Info), Level::INFO);
        assert_eq!(map.level_for(TransportLevel::Debug), Level::TRACE);
    }

    #[test]
    fn test_parse_transport_level() {
        assert_eq!("WARNING".parse::<TransportLevel>(), Ok(TransportLevel::Warn));
        assert_eq!("fatal".parse::<TransportLevel>(), Ok(TransportLevel::Fatal));
        assert!("verbose".parse::<TransportLevel>().is_err());
    }

    #[test]
    fn test_init_tracing_twice() {
        let _ = init_tracing();
        assert!(!init_tracing());
    }
}
