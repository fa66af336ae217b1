//! Session option map and russh client configuration.
//!
//! Options are ordered string key/value pairs using OpenSSH option names.
//! Keys can be given in two forms:
//!
//! - [`OptionKey::Ident`]: dashed identifiers such as
//!   `strict-host-key-checking`, converted to `StrictHostKeyChecking`
//! - [`OptionKey::Literal`]: passed through unmodified
//!
//! A handful of options are understood by the session (see
//! [`SessionSettings`]); the rest are kept and logged.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use russh::client;
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::{Error, Result};

const STRICT_HOST_KEY_CHECKING: &str = "StrictHostKeyChecking";
const HOST_KEY_ALIAS: &str = "HostKeyAlias";
const USER_KNOWN_HOSTS_FILE: &str = "UserKnownHostsFile";
const COMPRESSION: &str = "Compression";
const CONNECT_TIMEOUT: &str = "ConnectTimeout";
const SERVER_ALIVE_INTERVAL: &str = "ServerAliveInterval";
const SERVER_ALIVE_COUNT_MAX: &str = "ServerAliveCountMax";

/// Keepalive interval used when `ServerAliveInterval` is not set
const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Unanswered keepalives tolerated when `ServerAliveCountMax` is not set
const DEFAULT_KEEPALIVE_MAX: usize = 3;

/// Name of a session option.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OptionKey {
    /// Dashed identifier, camel-cased on the wire.
    Ident(String),
    /// Used exactly as given.
    Literal(String),
}

impl OptionKey {
    pub fn ident(name: impl Into<String>) -> Self {
        OptionKey::Ident(name.into())
    }

    pub fn literal(name: impl Into<String>) -> Self {
        OptionKey::Literal(name.into())
    }

    /// The option name as the transport expects it.
    pub fn wire_name(&self) -> String {
        match self {
            OptionKey::Ident(name) => camelize(name),
            OptionKey::Literal(name) => name.clone(),
        }
    }
}

impl From<&str> for OptionKey {
    fn from(name: &str) -> Self {
        OptionKey::Literal(name.to_string())
    }
}

impl From<String> for OptionKey {
    fn from(name: String) -> Self {
        OptionKey::Literal(name)
    }
}

impl fmt::Display for OptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.wire_name())
    }
}

/// `strict-host-key-checking` -> `StrictHostKeyChecking`
pub(crate) fn camelize(name: &str) -> String {
    name.split('-')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

/// Ordered option map. Setting an existing option replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOptions {
    entries: Vec<(String, String)>,
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<OptionKey>, value: impl Into<String>) {
        let name = key.into().wire_name();
        let value = value.into();

        match self
            .entries
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(&name))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn with(mut self, key: impl Into<OptionKey>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Value of an option by wire name, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Interpret the options this crate acts on.
    ///
    /// Fails with [`Error::InvalidOption`] when a recognized option has a
    /// value it cannot use.
    pub fn settings(&self) -> Result<SessionSettings> {
        let mut settings = SessionSettings::default();

        for (name, value) in self.iter() {
            match canonical(name) {
                Some(STRICT_HOST_KEY_CHECKING) => {
                    settings.host_key_policy = HostKeyPolicy::parse(name, value)?;
                }
                Some(HOST_KEY_ALIAS) => {
                    settings.host_key_alias = Some(value.to_string());
                }
                Some(USER_KNOWN_HOSTS_FILE) => {
                    settings.known_hosts = Some(expand_home(value));
                }
                Some(COMPRESSION) => {
                    settings.compression = Some(parse_yes_no(name, value)?);
                }
                Some(CONNECT_TIMEOUT) => {
                    let secs = parse_number(name, value)?;
                    settings.connect_timeout = Some(Duration::from_secs(secs));
                }
                Some(SERVER_ALIVE_INTERVAL) => {
                    let secs = parse_number(name, value)?;
                    settings.keepalive_interval = Some(Duration::from_secs(secs));
                }
                Some(SERVER_ALIVE_COUNT_MAX) => {
                    settings.keepalive_max = Some(parse_number(name, value)? as usize);
                }
                _ => debug!("Session option {}={} is not interpreted", name, value),
            }
        }

        Ok(settings)
    }
}

impl<K: Into<OptionKey>, V: Into<String>> FromIterator<(K, V)> for SessionOptions {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut options = SessionOptions::new();
        for (key, value) in iter {
            options.set(key, value);
        }
        options
    }
}

fn canonical(name: &str) -> Option<&'static str> {
    [
        STRICT_HOST_KEY_CHECKING,
        HOST_KEY_ALIAS,
        USER_KNOWN_HOSTS_FILE,
        COMPRESSION,
        CONNECT_TIMEOUT,
        SERVER_ALIVE_INTERVAL,
        SERVER_ALIVE_COUNT_MAX,
    ]
    .into_iter()
    .find(|known| known.eq_ignore_ascii_case(name))
}

fn invalid(name: &str, value: &str, reason: &str) -> Error {
    Error::InvalidOption {
        key: name.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_yes_no(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "true" => Ok(true),
        "no" | "false" => Ok(false),
        _ => Err(invalid(name, value, "expected yes or no")),
    }
}

fn parse_number(name: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| invalid(name, value, "expected a non-negative integer"))
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Ok(home) = std::env::var("HOME")
    {
        return PathBuf::from(home).join(rest);
    }
    PathBuf::from(path)
}

/// What to do with server host keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// `yes`: only keys already in known_hosts are accepted.
    Strict,
    /// `accept-new` / `ask`: unknown keys are learned, changed keys rejected.
    #[default]
    AcceptNew,
    /// `no`: every key is accepted and learned.
    AcceptAll,
}

impl HostKeyPolicy {
    fn parse(name: &str, value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "yes" | "true" => Ok(HostKeyPolicy::Strict),
            "accept-new" | "ask" => Ok(HostKeyPolicy::AcceptNew),
            "no" | "off" | "false" => Ok(HostKeyPolicy::AcceptAll),
            _ => Err(invalid(name, value, "expected yes, no, ask or accept-new")),
        }
    }
}

/// Options the session acts on, extracted from [`SessionOptions`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSettings {
    pub host_key_policy: HostKeyPolicy,
    pub host_key_alias: Option<String>,
    pub known_hosts: Option<PathBuf>,
    pub compression: Option<bool>,
    pub connect_timeout: Option<Duration>,
    pub keepalive_interval: Option<Duration>,
    pub keepalive_max: Option<usize>,
}

/// Build the russh client configuration for a session.
///
/// Sessions stay open until disconnected, so there is no inactivity
/// timeout. Keepalives detect dead peers instead; a `ServerAliveInterval`
/// of zero disables them.
pub(crate) fn build_client_config(
    config: &ClientConfig,
    settings: &SessionSettings,
) -> Arc<client::Config> {
    let compress = settings.compression.unwrap_or(config.compression);
    let compression = if compress {
        (&[russh::compression::ZLIB, russh::compression::NONE][..]).into()
    } else {
        (&[russh::compression::NONE][..]).into()
    };

    let preferred = russh::Preferred {
        compression,
        ..Default::default()
    };

    let keepalive_interval = match settings.keepalive_interval {
        Some(interval) if interval.is_zero() => None,
        Some(interval) => Some(interval),
        None => Some(DEFAULT_KEEPALIVE_INTERVAL),
    };

    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval,
        keepalive_max: settings.keepalive_max.unwrap_or(DEFAULT_KEEPALIVE_MAX),
        preferred,
        ..Default::default()
    })
}

/// Parse `host[:port]` into host and port, defaulting to port 22.
///
/// Bracketed IPv6 literals (`[::1]:2222`) lose their brackets; a bare IPv6
/// literal without brackets is taken as a host with the default port.
pub(crate) fn parse_address(address: &str) -> Result<(String, u16)> {
    let invalid_port = |e: std::num::ParseIntError| Error::InvalidArguments {
        command: "address".to_string(),
        reason: format!("Invalid port number in {address:?}: {e}"),
    };

    if let Some(rest) = address.strip_prefix('[')
        && let Some((host, tail)) = rest.split_once(']')
    {
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse::<u16>().map_err(invalid_port)?,
            None => 22,
        };
        return Ok((host.to_string(), port));
    }

    match address.rsplit_once(':') {
        Some((host, _)) if host.contains(':') => Ok((address.to_string(), 22)),
        Some((host, port)) => Ok((host.to_string(), port.parse::<u16>().map_err(invalid_port)?)),
        None => Ok((address.to_string(), 22)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod keys {
        use super::*;

        #[test]
        fn test_camelize() {
            assert_eq!(camelize("strict-host-key-checking"), "StrictHostKeyChecking");
            assert_eq!(camelize("compression"), "Compression");
            assert_eq!(camelize("host-key-alias"), "HostKeyAlias");
        }

        #[test]
        fn test_literal_passes_through() {
            assert_eq!(OptionKey::from("kex").wire_name(), "kex");
            assert_eq!(OptionKey::literal("PreferredAuthentications").wire_name(), "PreferredAuthentications");
        }

        #[test]
        fn test_ident_key_is_camelized() {
            assert_eq!(
                OptionKey::ident("server-alive-interval").to_string(),
                "ServerAliveInterval"
            );
        }
    }

    mod option_map {
        use super::*;

        #[test]
        fn test_replace_keeps_position() {
            let options = SessionOptions::new()
                .with(OptionKey::ident("strict-host-key-checking"), "yes")
                .with("Compression", "no")
                .with("StrictHostKeyChecking", "no");

            let entries: Vec<_> = options.iter().collect();
            assert_eq!(
                entries,
                vec![("StrictHostKeyChecking", "no"), ("Compression", "no")]
            );
        }

        #[test]
        fn test_lookup_is_case_insensitive() {
            let options: SessionOptions = [("compression", "yes")].into_iter().collect();
            assert_eq!(options.get("Compression"), Some("yes"));
            assert_eq!(options.len(), 1);
        }
    }

    mod settings {
        use super::*;

        #[test]
        fn test_defaults() {
            let settings = SessionOptions::new().settings().unwrap();
            assert_eq!(settings.host_key_policy, HostKeyPolicy::AcceptNew);
            assert_eq!(settings.host_key_alias, None);
            assert_eq!(settings.connect_timeout, None);
        }

        #[test]
        fn test_recognized_options() {
            let settings = SessionOptions::new()
                .with(OptionKey::ident("strict-host-key-checking"), "no")
                .with(OptionKey::ident("host-key-alias"), "bastion.internal")
                .with(OptionKey::ident("connect-timeout"), "5")
                .with(OptionKey::ident("server-alive-count-max"), "7")
                .with("UserKnownHostsFile", "/tmp/kh")
                .with("Compression", "no")
                .settings()
                .unwrap();

            assert_eq!(settings.host_key_policy, HostKeyPolicy::AcceptAll);
            assert_eq!(settings.host_key_alias.as_deref(), Some("bastion.internal"));
            assert_eq!(settings.connect_timeout, Some(Duration::from_secs(5)));
            assert_eq!(settings.keepalive_max, Some(7));
            assert_eq!(settings.known_hosts, Some(PathBuf::from("/tmp/kh")));
            assert_eq!(settings.compression, Some(false));
        }

        #[test]
        fn test_strict_values() {
            for (value, expected) in [
                ("yes", HostKeyPolicy::Strict),
                ("ask", HostKeyPolicy::AcceptNew),
                ("accept-new", HostKeyPolicy::AcceptNew),
                ("no", HostKeyPolicy::AcceptAll),
            ] {
                let settings = SessionOptions::new()
                    .with("StrictHostKeyChecking", value)
                    .settings()
                    .unwrap();
                assert_eq!(settings.host_key_policy, expected, "value {value}");
            }
        }

        #[test]
        fn test_invalid_value_rejected() {
            let result = SessionOptions::new()
                .with("ConnectTimeout", "soon")
                .settings();
            assert!(matches!(
                result,
                Err(Error::InvalidOption { ref key, .. }) if key == "ConnectTimeout"
            ));

            let result = SessionOptions::new()
                .with("StrictHostKeyChecking", "maybe")
                .settings();
            assert!(matches!(result, Err(Error::InvalidOption { .. })));
        }

        #[test]
        fn test_unknown_options_are_kept() {
            let options = SessionOptions::new().with("Ciphers", "aes256-ctr");
            assert!(options.settings().is_ok());
            assert_eq!(options.get("Ciphers"), Some("aes256-ctr"));
        }
    }

    mod client_config {
        use super::*;

        #[test]
        fn test_no_inactivity_timeout() {
            let config = build_client_config(&ClientConfig::default(), &SessionSettings::default());
            assert_eq!(config.inactivity_timeout, None);
        }

        #[test]
        fn test_default_keepalive() {
            let config = build_client_config(&ClientConfig::default(), &SessionSettings::default());
            assert_eq!(config.keepalive_interval, Some(Duration::from_secs(30)));
            assert_eq!(config.keepalive_max, 3);
        }

        #[test]
        fn test_zero_interval_disables_keepalive() {
            let settings = SessionSettings {
                keepalive_interval: Some(Duration::ZERO),
                ..Default::default()
            };
            let config = build_client_config(&ClientConfig::default(), &settings);
            assert_eq!(config.keepalive_interval, None);
        }

        #[test]
        fn test_compression_option_overrides_config() {
            let settings = SessionSettings {
                compression: Some(false),
                ..Default::default()
            };
            let config = build_client_config(&ClientConfig::default(), &settings);
            assert_eq!(config.preferred.compression.len(), 1);

            let config = build_client_config(&ClientConfig::default(), &SessionSettings::default());
            assert_eq!(config.preferred.compression.len(), 2);
        }
    }

    mod address_parsing {
        use super::*;

        #[test]
        fn test_hostname_with_port() {
            let (host, port) = parse_address("example.com:2222").unwrap();
            assert_eq!(host, "example.com");
            assert_eq!(port, 2222);
        }

        #[test]
        fn test_host_without_port_defaults_to_22() {
            let (host, port) = parse_address("192.168.1.1").unwrap();
            assert_eq!(host, "192.168.1.1");
            assert_eq!(port, 22);
        }

        #[test]
        fn test_invalid_port_returns_error() {
            assert!(matches!(
                parse_address("example.com:invalid"),
                Err(Error::InvalidArguments { .. })
            ));
            assert!(parse_address("example.com:99999").is_err());
            assert!(parse_address("example.com:-22").is_err());
        }

        #[test]
        fn test_bracketed_ipv6() {
            let (host, port) = parse_address("[::1]:2200").unwrap();
            assert_eq!(host, "::1");
            assert_eq!(port, 2200);

            let (host, port) = parse_address("[fe80::1]").unwrap();
            assert_eq!(host, "fe80::1");
            assert_eq!(port, 22);
        }

        #[test]
        fn test_bare_ipv6_uses_default_port() {
            let (host, port) = parse_address("fe80::1").unwrap();
            assert_eq!(host, "fe80::1");
            assert_eq!(port, 22);
        }

        #[test]
        fn test_max_port() {
            let (_, port) = parse_address("example.com:65535").unwrap();
            assert_eq!(port, 65535);
        }
    }
}
