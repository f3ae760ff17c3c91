//! Server settings with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`Settings::default()`]
//! 2. If a settings file is given and exists, deep-merge its values over defaults
//! 3. Apply `TOOLSTREAM_*` environment overrides
//!
//! CLI flags are applied by the binary after this. Overrides that were
//! rejected are handed back so they can be logged once tracing is up.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use toolstream_engine::{RunnerConfig, TypingConfig};
use toolstream_llm::ProviderConfig;
use toolstream_telemetry::{parse_level, TelemetryConfig, TelemetryError};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub server: ServerSettings,
    pub upstream: UpstreamSettings,
    pub run: RunSettings,
    pub stream: StreamSettings,
    pub logging: LoggingSettings,
}

/// Downstream listener.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    /// 0 picks a free port.
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
        }
    }
}

/// OpenAI-compatible chat-completions endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpstreamSettings {
    pub base_url: String,
    pub model: String,
    /// Never written back out.
    #[serde(skip_serializing, deserialize_with = "deserialize_secret")]
    pub api_key: Option<SecretString>,
    /// Seconds without a byte from upstream before the round fails. 0 disables.
    pub idle_timeout_secs: u64,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            idle_timeout_secs: 90,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunSettings {
    pub max_rounds: u32,
    /// 0 disables.
    pub tool_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_rounds: 8,
            tool_timeout_secs: 120,
            system_prompt: None,
        }
    }
}

/// Synthetic typing for long content deltas.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub typing_chunk_chars: Option<usize>,
    pub typing_delay_ms: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            typing_chunk_chars: None,
            typing_delay_ms: 15,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    /// Per-target levels layered over `level`, e.g. `{"toolstream_llm": "debug"}`.
    pub module_levels: BTreeMap<String, String>,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            module_levels: BTreeMap::new(),
            json: false,
        }
    }
}

impl Settings {
    pub fn provider_config(&self) -> ProviderConfig {
        let upstream = &self.upstream;
        let mut config = ProviderConfig::new(&upstream.base_url, &upstream.model)
            .with_idle_timeout(secs_or_none(upstream.idle_timeout_secs));
        if let Some(key) = &upstream.api_key {
            config = config.with_api_key(key.clone());
        }
        config
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            max_rounds: self.run.max_rounds,
            tool_timeout: secs_or_none(self.run.tool_timeout_secs),
            system_prompt: self.run.system_prompt.clone(),
        }
    }

    pub fn typing_config(&self) -> Option<TypingConfig> {
        self.stream
            .typing_chunk_chars
            .filter(|&n| n > 0)
            .map(|chunk_chars| TypingConfig {
                chunk_chars,
                delay: Duration::from_millis(self.stream.typing_delay_ms),
            })
    }

    pub fn telemetry_config(&self) -> Result<TelemetryConfig, TelemetryError> {
        Ok(TelemetryConfig {
            log_level: parse_level(&self.logging.level)?,
            module_levels: self
                .logging
                .module_levels
                .iter()
                .map(|(module, level)| parse_level(level).map(|level| (module.clone(), level)))
                .collect::<Result<_, _>>()?,
            json: self.logging.json,
        })
    }

    /// Reject combinations the run loop cannot work with.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.run.max_rounds == 0 {
            return Err(SettingsError::InvalidValue("run.maxRounds must be at least 1".into()));
        }
        if self.upstream.base_url.trim().is_empty() {
            return Err(SettingsError::InvalidValue("upstream.baseUrl is empty".into()));
        }
        if self.upstream.model.trim().is_empty() {
            return Err(SettingsError::InvalidValue("upstream.model is empty".into()));
        }
        Ok(())
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.filter(|k| !k.is_empty()).map(SecretString::from))
}

fn secs_or_none(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// An environment override that was present but unusable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IgnoredOverride {
    pub key: &'static str,
    pub value: String,
}

impl fmt::Display for IgnoredOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ignoring invalid {}={:?}", self.key, self.value)
    }
}

/// Load settings from an optional file, then apply env overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings(path: Option<&Path>) -> Result<(Settings, Vec<IgnoredOverride>), SettingsError> {
    let defaults = serde_json::to_value(Settings::default())?;

    let merged = match path {
        Some(path) if path.exists() => {
            debug!(?path, "loading settings from file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        }
        Some(path) => {
            debug!(?path, "settings file not found, using defaults");
            defaults
        }
        None => defaults,
    };

    let mut settings: Settings = serde_json::from_value(merged)?;
    let ignored = apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok((settings, ignored))
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key, arrays and primitives are replaced by `source`,
/// and nulls in `source` keep the `target` value.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

pub fn apply_env_overrides(settings: &mut Settings) -> Vec<IgnoredOverride> {
    apply_overrides(settings, |name| std::env::var(name).ok())
}

/// Apply `TOOLSTREAM_*` overrides read through `lookup`. Empty values are
/// skipped; out-of-range values are skipped and returned.
pub fn apply_overrides(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) -> Vec<IgnoredOverride> {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());
    let mut ignored = Vec::new();

    if let Some(v) = read("TOOLSTREAM_UPSTREAM_URL") {
        settings.upstream.base_url = v;
    }
    if let Some(v) = read("TOOLSTREAM_MODEL") {
        settings.upstream.model = v;
    }
    if let Some(v) = read("TOOLSTREAM_API_KEY") {
        settings.upstream.api_key = Some(SecretString::from(v));
    }
    if let Some(v) = read("TOOLSTREAM_PORT") {
        match parse_u16_range(&v, 0, u16::MAX) {
            Some(port) => settings.server.port = port,
            None => ignored.push(IgnoredOverride {
                key: "TOOLSTREAM_PORT",
                value: v,
            }),
        }
    }
    if let Some(v) = read("TOOLSTREAM_MAX_ROUNDS") {
        match parse_u32_range(&v, 1, 1000) {
            Some(rounds) => settings.run.max_rounds = rounds,
            None => ignored.push(IgnoredOverride {
                key: "TOOLSTREAM_MAX_ROUNDS",
                value: v,
            }),
        }
    }
    ignored
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serde_json::json;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn temp_file(name: &str, content: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("toolstream-settings-{}-{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn defaults() {
        let s = Settings::default();
        assert_eq!(s.server.port, 8787);
        assert_eq!(s.upstream.idle_timeout_secs, 90);
        assert_eq!(s.run.max_rounds, 8);
        assert_eq!(s.run.tool_timeout_secs, 120);
        assert_eq!(s.stream.typing_chunk_chars, None);
        assert_eq!(s.stream.typing_delay_ms, 15);
        assert!(s.upstream.api_key.is_none());
        assert!(s.validate().is_ok());
    }

    #[test]
    fn merge_nested_override() {
        let target = json!({"server": {"port": 8080, "host": "localhost"}});
        let source = json!({"server": {"port": 9090}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "localhost");
    }

    #[test]
    fn merge_null_preserves_target() {
        let merged = deep_merge(json!({"a": 1, "b": 2}), json!({"a": null}));
        assert_eq!(merged, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn merge_array_and_primitive_replace() {
        let merged = deep_merge(json!({"items": [1, 2, 3], "a": {"x": 1}}), json!({"items": [4], "a": 42}));
        assert_eq!(merged, json!({"items": [4], "a": 42}));
    }

    #[test]
    fn missing_file_gives_defaults() {
        let path = std::env::temp_dir().join("toolstream-does-not-exist/settings.json");
        let (s, _) = load_settings(Some(&path)).unwrap();
        assert_eq!(s.run.max_rounds, 8);
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let path = temp_file(
            "merge",
            r#"{"upstream": {"model": "local-model", "apiKey": "sk-file"}, "run": {"maxRounds": 3}, "stream": {"typingChunkChars": 12}}"#,
        );
        let (s, _) = load_settings(Some(&path)).unwrap();
        assert_eq!(s.upstream.model, "local-model");
        assert_eq!(s.upstream.base_url, "https://api.openai.com/v1");
        assert_eq!(s.upstream.api_key.as_ref().unwrap().expose_secret(), "sk-file");
        assert_eq!(s.run.max_rounds, 3);
        assert_eq!(s.run.tool_timeout_secs, 120);
        assert_eq!(s.stream.typing_chunk_chars, Some(12));
    }

    #[test]
    fn invalid_json_is_error() {
        let path = temp_file("invalid", "{not json");
        assert!(matches!(load_settings(Some(&path)), Err(SettingsError::Json(_))));
    }

    #[test]
    fn zero_rounds_rejected() {
        let path = temp_file("zero", r#"{"run": {"maxRounds": 0}}"#);
        assert!(matches!(load_settings(Some(&path)), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn api_key_is_never_serialized() {
        let mut s = Settings::default();
        s.upstream.api_key = Some(SecretString::from("sk-secret".to_string()));
        let text = serde_json::to_string(&s).unwrap();
        assert!(!text.contains("sk-secret"));
        assert!(!text.contains("apiKey"));
    }

    #[test]
    fn env_overrides_apply() {
        let mut s = Settings::default();
        apply_overrides(
            &mut s,
            env(&[
                ("TOOLSTREAM_UPSTREAM_URL", "http://127.0.0.1:9000/v1"),
                ("TOOLSTREAM_MODEL", "m"),
                ("TOOLSTREAM_API_KEY", "sk-env"),
                ("TOOLSTREAM_PORT", "0"),
                ("TOOLSTREAM_MAX_ROUNDS", "4"),
            ]),
        );
        assert_eq!(s.upstream.base_url, "http://127.0.0.1:9000/v1");
        assert_eq!(s.upstream.model, "m");
        assert_eq!(s.upstream.api_key.as_ref().unwrap().expose_secret(), "sk-env");
        assert_eq!(s.server.port, 0);
        assert_eq!(s.run.max_rounds, 4);
    }

    #[test]
    fn invalid_env_values_ignored() {
        let mut s = Settings::default();
        let ignored = apply_overrides(
            &mut s,
            env(&[
                ("TOOLSTREAM_PORT", "99999"),
                ("TOOLSTREAM_MAX_ROUNDS", "0"),
                ("TOOLSTREAM_MODEL", ""),
            ]),
        );
        assert_eq!(s.server.port, 8787);
        assert_eq!(s.run.max_rounds, 8);
        assert_eq!(s.upstream.model, "gpt-4o-mini");
        let keys: Vec<&str> = ignored.iter().map(|i| i.key).collect();
        assert_eq!(keys, vec!["TOOLSTREAM_PORT", "TOOLSTREAM_MAX_ROUNDS"]);
        assert_eq!(ignored[0].to_string(), r#"ignoring invalid TOOLSTREAM_PORT="99999""#);
    }

    #[test]
    fn zero_timeouts_disable() {
        let mut s = Settings::default();
        s.upstream.idle_timeout_secs = 0;
        s.run.tool_timeout_secs = 0;
        assert_eq!(s.runner_config().tool_timeout, None);
        assert_eq!(s.provider_config().idle_timeout, None);

        let d = Settings::default();
        assert_eq!(d.runner_config().tool_timeout, Some(Duration::from_secs(120)));
        assert_eq!(d.provider_config().idle_timeout, Some(Duration::from_secs(90)));
    }

    #[test]
    fn typing_only_when_chunk_size_set() {
        let mut s = Settings::default();
        assert!(s.typing_config().is_none());
        s.stream.typing_chunk_chars = Some(0);
        assert!(s.typing_config().is_none());
        s.stream.typing_chunk_chars = Some(8);
        let typing = s.typing_config().unwrap();
        assert_eq!(typing.chunk_chars, 8);
        assert_eq!(typing.delay, Duration::from_millis(15));
    }

    #[test]
    fn telemetry_level_parsed() {
        let mut s = Settings::default();
        s.logging.level = "debug".into();
        s.logging.json = true;
        let t = s.telemetry_config().unwrap();
        assert_eq!(t.log_level, tracing::Level::DEBUG);
        assert!(t.json);

        s.logging.level = "loud".into();
        assert!(s.telemetry_config().is_err());
    }

    #[test]
    fn module_levels_from_file() {
        let path = temp_file(
            "modules",
            r#"{"logging": {"level": "warn", "moduleLevels": {"toolstream_llm": "debug", "tower_http": "TRACE"}}}"#,
        );
        let (s, _) = load_settings(Some(&path)).unwrap();
        let t = s.telemetry_config().unwrap();
        assert_eq!(t.log_level, tracing::Level::WARN);
        assert_eq!(
            t.module_levels,
            vec![
                ("toolstream_llm".to_string(), tracing::Level::DEBUG),
                ("tower_http".to_string(), tracing::Level::TRACE),
            ]
        );
        assert_eq!(
            toolstream_telemetry::filter_directives(&t),
            "warn,toolstream_llm=debug,tower_http=trace"
        );
    }

    #[test]
    fn invalid_module_level_is_error() {
        let mut s = Settings::default();
        s.logging.module_levels.insert("toolstream_engine".into(), "chatty".into());
        assert!(s.telemetry_config().is_err());
    }
}
