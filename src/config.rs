//! Configuration management

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    path::Path,
    time::Duration,
};

use figment::{
    Figment,
    providers::{Env, Format, Json, Yaml},
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Environment files to load before building rules.
    /// Loaded in order, later files override earlier. Variables are set into
    /// the process environment so that `[[ env "NAME" ]]` can see them.
    pub env_files: Vec<String>,
    /// Listener and upstream settings
    pub server: ServerConfig,
    /// Access-control settings
    pub guard: GuardConfig,
}

/// Listener, TLS and upstream settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    /// Socket address to listen on
    pub listen: String,
    /// TLS settings; plain HTTP when absent
    pub tls: Option<TlsConfig>,
    /// Base URL allowed requests are forwarded to
    pub upstream: String,
    /// Timeout for one upstream round trip
    #[serde(with = "go_duration")]
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8443".to_string(),
            tls: None,
            upstream: "http://127.0.0.1:8080".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Server TLS settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TlsConfig {
    /// PEM server certificate chain
    pub cert: String,
    /// PEM server private key
    pub key: String,
    /// PEM CA bundle used to verify client certificates.
    /// Client certificates are not requested when empty.
    pub client_ca: String,
    /// Reject handshakes without a client certificate
    pub require_client_cert: bool,
}

/// Access-control settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GuardConfig {
    /// Certificate identifier (CN, DNS SAN or email SAN) to username.
    /// An empty username stands for the identifier itself.
    pub users: HashMap<String, String>,
    /// Header receiving the resolved username; unset when empty
    pub username_header: String,
    /// Root rules; a request passes when any root matches
    pub rules: Vec<RawRule>,
    /// Source of the `data` template variable
    pub external_data: ExternalDataConfig,
    /// Lifetime of a rule snapshot; snapshots never expire when unset
    #[serde(with = "go_duration::option")]
    pub refresh_interval: Option<Duration>,
    /// Upper bound for a synchronous refresh on the request path
    #[serde(with = "go_duration")]
    pub refresh_timeout: Duration,
    /// Header name to template, rendered per request
    pub request_headers: BTreeMap<String, String>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            users: HashMap::new(),
            username_header: String::new(),
            rules: Vec::new(),
            external_data: ExternalDataConfig::default(),
            refresh_interval: None,
            refresh_timeout: Duration::from_secs(10),
            request_headers: BTreeMap::new(),
        }
    }
}

/// External JSON document exposed to rule templates as `data`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExternalDataConfig {
    /// Document URL; nothing is fetched when empty
    pub url: String,
    /// Request headers; values are templates (`env`/`file` only)
    pub headers: BTreeMap<String, String>,
    /// Top-level key to project; the whole document when empty
    pub data_key: String,
    /// Disable server certificate verification
    pub skip_tls_verify: bool,
}

impl ExternalDataConfig {
    /// Whether a document should be fetched at all.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.url.trim().is_empty()
    }
}

/// One node of the configured rule tree, before templates are rendered.
///
/// `type` is required: a descriptor without it is rejected at load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRule {
    /// Rule kind
    #[serde(rename = "type")]
    pub kind: RuleKind,
    /// Header rules: header name to regex template
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// IP-range rules: CIDR templates
    #[serde(default)]
    pub ranges: Vec<String>,
    /// IP-range rules: also admit the default interface's networks
    #[serde(default)]
    pub add_interface: bool,
    /// Composite rules: children
    #[serde(default)]
    pub rules: Vec<RawRule>,
}

/// Rule kinds. Names are matched case-insensitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    /// Every child matches
    AllOf,
    /// At least one child matches
    AnyOf,
    /// No child matches
    NoneOf,
    /// Client address inside a CIDR
    IpRange,
    /// Header values match patterns
    Header,
}

impl RuleKind {
    /// Canonical camelCase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AllOf => "allOf",
            Self::AnyOf => "anyOf",
            Self::NoneOf => "noneOf",
            Self::IpRange => "ipRange",
            Self::Header => "header",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RuleKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "allof" => Ok(Self::AllOf),
            "anyof" => Ok(Self::AnyOf),
            "noneof" => Ok(Self::NoneOf),
            "iprange" => Ok(Self::IpRange),
            "header" => Ok(Self::Header),
            _ => Err(Error::Config(format!("unknown rule type: {s:?}"))),
        }
    }
}

impl Serialize for RuleKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RuleKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Config {
    /// Load configuration from an optional file plus `TLS_GUARD_` environment
    /// variables (`__` separates nesting levels).
    ///
    /// Files ending in `.json` are read as JSON, everything else as YAML.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            let is_json = p
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
            figment = if is_json {
                figment.merge(Json::file(p))
            } else {
                figment.merge(Yaml::file(p))
            };
        }

        figment = figment.merge(Env::prefixed("TLS_GUARD_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Before anything renders templates that read the environment.
        config.load_env_files();

        Ok(config)
    }

    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let path = Path::new(path_str);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {path_str}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {path_str}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {path_str}");
            }
        }
    }
}

/// Parse a Go-style duration: a sequence of decimal numbers, each with an
/// optional fraction and a unit suffix, such as `300ms`, `1.5h` or `2h45m`.
///
/// Valid units are `ns`, `us` (or `µs`), `ms`, `s`, `m`, `h`. A bare `0` is
/// accepted.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let err = || Error::Config(format!("invalid duration: {input:?}"));
    let s = input.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() || s.starts_with('-') {
        return Err(err());
    }

    let mut total_nanos: f64 = 0.0;
    let mut rest = s.strip_prefix('+').unwrap_or(s);
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(err)?;
        if num_len == 0 {
            return Err(err());
        }
        let value: f64 = rest[..num_len].parse().map_err(|_| err())?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return Err(err()),
        };
        rest = &rest[unit_len..];
        total_nanos += value * scale;
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Ok(Duration::from_nanos(total_nanos.round() as u64))
}

/// Render a duration the way [`parse_duration`] reads it back.
#[must_use]
pub fn format_duration(d: Duration) -> String {
    if d.is_zero() {
        return "0s".to_string();
    }
    if d.subsec_nanos() == 0 {
        let secs = d.as_secs();
        let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
        let mut out = String::new();
        if h > 0 {
            out.push_str(&format!("{h}h"));
        }
        if m > 0 {
            out.push_str(&format!("{m}m"));
        }
        if s > 0 {
            out.push_str(&format!("{s}s"));
        }
        return out;
    }
    if d.subsec_nanos() % 1_000_000 == 0 {
        return format!("{}ms", d.as_millis());
    }
    format!("{}ns", d.as_nanos())
}

/// Serde adapter for Go-style duration strings.
pub mod go_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize a Duration as a duration string (e.g. `1h30m`).
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_duration(*duration))
    }

    /// Deserialize a duration string.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        super::parse_duration(&s).map_err(serde::de::Error::custom)
    }

    /// Optional variant: an empty or missing string is `None`.
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        /// Serialize `None` as an empty string.
        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_str(&super::super::format_duration(*d)),
                None => serializer.serialize_str(""),
            }
        }

        /// Deserialize an optional duration string.
        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let s = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
            if s.trim().is_empty() {
                return Ok(None);
            }
            super::super::parse_duration(&s)
                .map(Some)
                .map_err(serde::de::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use figment::Jail;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_simple_durations() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("250us").unwrap(), Duration::from_micros(250));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn parses_compound_and_fractional_durations() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("2h45m10s").unwrap(), Duration::from_secs(9910));
        assert_eq!(parse_duration("1.5h").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1m0.5s").unwrap(), Duration::from_millis(60_500));
    }

    #[test]
    fn rejects_malformed_durations() {
        for bad in ["", "10", "h", "5x", "-1s", "1h-5m", "1..5s"] {
            let err = parse_duration(bad).unwrap_err();
            assert!(err.is_config(), "{bad:?} should be a config error");
        }
    }

    #[test]
    fn format_round_trips_through_parse() {
        for d in [
            Duration::from_secs(5400),
            Duration::from_millis(1500),
            Duration::from_secs(10),
        ] {
            assert_eq!(parse_duration(&format_duration(d)).unwrap(), d);
        }
    }

    #[test]
    fn rule_kind_is_case_insensitive() {
        assert_eq!("allOf".parse::<RuleKind>().unwrap(), RuleKind::AllOf);
        assert_eq!("AllOf".parse::<RuleKind>().unwrap(), RuleKind::AllOf);
        assert_eq!("IPRange".parse::<RuleKind>().unwrap(), RuleKind::IpRange);
        assert_eq!("NONEOF".parse::<RuleKind>().unwrap(), RuleKind::NoneOf);
        assert!("someOf".parse::<RuleKind>().is_err());
    }

    #[test]
    fn defaults_are_sensible() {
        let config = Config::default();
        assert_eq!(config.server.listen, "0.0.0.0:8443");
        assert!(config.server.tls.is_none());
        assert_eq!(config.guard.refresh_timeout, Duration::from_secs(10));
        assert!(config.guard.refresh_interval.is_none());
        assert!(!config.guard.external_data.is_enabled());
    }

    #[test]
    fn deserializes_full_yaml() {
        // GIVEN: a config with every guard section populated
        let yaml = r#"
server:
  listen: "127.0.0.1:9443"
  upstream: "http://backend:8080"
  requestTimeout: 15s
  tls:
    cert: /etc/tls/server.crt
    key: /etc/tls/server.key
    clientCa: /etc/tls/ca.crt
    requireClientCert: false
guard:
  usernameHeader: X-Remote-User
  users:
    alice.example.com: alice
    ops@example.com: ""
  refreshInterval: 1h30m
  externalData:
    url: https://config.example.com/ranges.json
    dataKey: office
    skipTlsVerify: true
    headers:
      Authorization: 'Bearer [[ env "TOKEN" ]]'
  requestHeaders:
    X-Client: '[[ .Req.Header.User-Agent ]]'
  rules:
    - type: AnyOf
      rules:
        - type: ipRange
          ranges: ['[[ .data.cidrs ]]']
          addInterface: true
        - type: header
          headers:
            X-Api-Key: '^k-[0-9]+$'
"#;
        // WHEN: deserializing
        let config: Config = serde_yaml::from_str(yaml).unwrap();

        // THEN: every field is mapped
        assert_eq!(config.server.listen, "127.0.0.1:9443");
        assert_eq!(config.server.request_timeout, Duration::from_secs(15));
        let tls = config.server.tls.as_ref().unwrap();
        assert_eq!(tls.client_ca, "/etc/tls/ca.crt");
        assert!(!tls.require_client_cert);

        let guard = &config.guard;
        assert_eq!(guard.username_header, "X-Remote-User");
        assert_eq!(guard.users["alice.example.com"], "alice");
        assert_eq!(guard.users["ops@example.com"], "");
        assert_eq!(guard.refresh_interval, Some(Duration::from_secs(5400)));
        assert_eq!(guard.refresh_timeout, Duration::from_secs(10));
        assert!(guard.external_data.is_enabled());
        assert_eq!(guard.external_data.data_key, "office");
        assert!(guard.external_data.skip_tls_verify);
        assert_eq!(guard.request_headers.len(), 1);

        let root = &guard.rules[0];
        assert_eq!(root.kind, RuleKind::AnyOf);
        assert_eq!(root.rules[0].kind, RuleKind::IpRange);
        assert!(root.rules[0].add_interface);
        assert_eq!(root.rules[1].headers["X-Api-Key"], "^k-[0-9]+$");
    }

    #[test]
    fn empty_refresh_interval_means_never() {
        let config: GuardConfig = serde_yaml::from_str("refreshInterval: ''").unwrap();
        assert!(config.refresh_interval.is_none());
    }

    #[test]
    fn invalid_refresh_interval_is_rejected_at_load() {
        let result: std::result::Result<GuardConfig, _> =
            serde_yaml::from_str("refreshInterval: soon");
        assert!(result.is_err());
    }

    #[test]
    fn unknown_rule_type_is_rejected_at_load() {
        let result: std::result::Result<GuardConfig, _> =
            serde_yaml::from_str("rules: [{type: someOf}]");
        assert!(result.is_err());
    }

    #[test]
    fn rule_without_type_is_rejected_at_load() {
        // GIVEN: a misspelled key and a nested descriptor with no type at all
        for yaml in [
            "rules: [{typ: ipRange, ranges: ['10.0.0.0/8']}]",
            "rules: [{type: noneOf, rules: [{ranges: ['0.0.0.0/0']}]}]",
        ] {
            // THEN: loading fails instead of defaulting to an empty anyOf
            let result: std::result::Result<GuardConfig, _> = serde_yaml::from_str(yaml);
            let err = result.expect_err(yaml).to_string();
            assert!(err.contains("type"), "{err}");
        }
    }

    #[test]
    fn rule_without_type_fails_config_load() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "guard.yaml",
                "guard:\n  rules:\n    - type: noneOf\n      rules:\n        - ranges: ['0.0.0.0/0']\n",
            )?;
            let err = Config::load(Some(Path::new("guard.yaml"))).unwrap_err();
            assert!(err.is_config(), "{err}");
            Ok(())
        });
    }

    #[test]
    fn load_reads_json_by_extension() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "guard.json",
                r#"{"guard": {"usernameHeader": "X-User", "refreshInterval": "5m"}}"#,
            )?;
            let config = Config::load(Some(Path::new("guard.json"))).map_err(|e| e.to_string())?;
            assert_eq!(config.guard.username_header, "X-User");
            assert_eq!(config.guard.refresh_interval, Some(Duration::from_secs(300)));
            Ok(())
        });
    }

    #[test]
    fn env_overrides_file_values() {
        Jail::expect_with(|jail| {
            jail.create_file("guard.yaml", "server:\n  upstream: http://a:1\n")?;
            jail.set_env("TLS_GUARD_SERVER__UPSTREAM", "http://b:2");
            let config = Config::load(Some(Path::new("guard.yaml"))).map_err(|e| e.to_string())?;
            assert_eq!(config.server.upstream, "http://b:2");
            Ok(())
        });
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = Config::load(Some(Path::new("/nonexistent/guard.yaml"))).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn load_env_files_sets_env_vars() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "TLS_GUARD_TEST_ENVFILE_VAR=from-env-file").unwrap();

        let config = Config {
            env_files: vec![file.path().to_string_lossy().into_owned()],
            ..Config::default()
        };
        config.load_env_files();

        assert_eq!(
            std::env::var("TLS_GUARD_TEST_ENVFILE_VAR").unwrap(),
            "from-env-file"
        );
    }

    #[test]
    fn load_env_files_skips_missing() {
        let config = Config {
            env_files: vec!["/nonexistent/.env".to_string()],
            ..Config::default()
        };
        config.load_env_files();
    }
}
