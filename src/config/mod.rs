//! YAML configuration with hot reload.
//!
//! [`Settings`] mirrors the configuration file. [`ConfigManager`] owns the
//! current snapshot, reloads it on demand or when the file changes, and
//! notifies subscribers. Sandboxes never cache settings: every call resolves
//! a fresh [`SandboxConfig`] from the snapshot taken at call start.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Deserializer};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, SandboxError};
use crate::execution::resources::ResourceLimits;
use crate::sandbox::{template, RetryPolicy, SandboxConfig};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "CODE_SANDBOX_CONFIG";

/// Locations searched, in order, when no path is given.
pub const DEFAULT_CONFIG_PATHS: [&str; 2] = ["./config.yaml", "./config/config.yaml"];

/// Root of the configuration file.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub runtimes: RuntimeSettings,
    pub languages: Languages,
}

/// Language table, sorted by name.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Languages(pub BTreeMap<String, LanguageSettings>);

impl Default for Languages {
    fn default() -> Self {
        Self(builtin_languages())
    }
}

/// Identity reported to tool clients.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    pub name: String,
    pub version: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            name: "code-sandbox".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Settings shared by every language.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Registered backend name used to create sandboxes.
    pub engine: String,
    /// Remove leftover managed containers on shutdown.
    pub cleanup_on_exit: bool,
    /// Base directory for per-execution workspaces.
    pub work_dir: PathBuf,
    /// Total wall-clock budget per call. Zero disables it.
    #[serde(deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
    pub resources: ResourceSettings,
    pub network: NetworkSettings,
    pub retry: RetrySettings,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            engine: "docker".to_string(),
            cleanup_on_exit: true,
            work_dir: std::env::temp_dir().join("code-sandbox"),
            timeout: Duration::from_secs(60),
            resources: ResourceSettings::default(),
            network: NetworkSettings::default(),
            retry: RetrySettings::default(),
        }
    }
}

/// Smallest CPU share the daemon accepts (a 1ms quota per 100ms period).
const MIN_CPUS: f64 = 0.01;

/// Resource ceilings. Unset fields fall back to the next level up.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResourceSettings {
    #[serde(deserialize_with = "deserialize_opt_duration")]
    pub cpu_timeout: Option<Duration>,
    pub cpus: Option<f64>,
    pub memory_mb: Option<u64>,
    pub disk_mb: Option<u64>,
}

impl ResourceSettings {
    /// Overlays `other` on top of `self`, field by field.
    pub fn merged(&self, other: &ResourceSettings) -> ResourceSettings {
        ResourceSettings {
            cpu_timeout: other.cpu_timeout.or(self.cpu_timeout),
            cpus: other.cpus.or(self.cpus),
            memory_mb: other.memory_mb.or(self.memory_mb),
            disk_mb: other.disk_mb.or(self.disk_mb),
        }
    }

    fn check(&self, scope: &str) -> Result<(), ConfigError> {
        match self.cpus {
            Some(cpus) if cpus.is_nan() || cpus < MIN_CPUS => Err(ConfigError::Invalid(format!(
                "{scope}.cpus must be at least {MIN_CPUS}, got {cpus}"
            ))),
            _ => Ok(()),
        }
    }

    /// Fills the remaining gaps with [`ResourceLimits::default`].
    pub fn to_limits(&self) -> ResourceLimits {
        let defaults = ResourceLimits::default();
        ResourceLimits::new(
            self.cpu_timeout.unwrap_or(defaults.cpu_timeout),
            self.cpus.unwrap_or(defaults.cpu_cores),
            self.memory_mb.unwrap_or(defaults.memory_mb),
            self.disk_mb.unwrap_or(defaults.disk_mb),
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkSettings {
    pub enabled: bool,
}

/// Teardown retry settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            delay_ms: policy.delay.as_millis() as u64,
        }
    }
}

impl RetrySettings {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.delay_ms))
    }
}

/// How one language is run.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct LanguageSettings {
    /// Source file extension without the dot.
    pub suffix: String,
    /// Version used when the caller gives none.
    #[serde(alias = "base_image")]
    pub default_version: Option<String>,
    /// Image template with `{language}` and `{version}` placeholders.
    #[serde(alias = "default_image")]
    pub image: String,
    /// Three-token command template with `{exec_file}` and `{path}`.
    pub entrypoint: Vec<String>,
    pub resources: ResourceSettings,
}

impl Settings {
    /// Reads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let settings: Settings =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::Yaml {
                path: path.display().to_string(),
                source,
            })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks the parts of the file that can be verified without a request.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.runtimes.engine.trim().is_empty() {
            return Err(ConfigError::Invalid("runtimes.engine is empty".to_string()));
        }
        if self.languages.0.is_empty() {
            return Err(ConfigError::Invalid("no languages configured".to_string()));
        }
        self.runtimes.resources.check("runtimes.resources")?;
        for (name, lang) in &self.languages.0 {
            if lang.suffix.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language '{name}' has no suffix"
                )));
            }
            if lang.image.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language '{name}' has no image"
                )));
            }
            template::check_entrypoint_len(&lang.entrypoint)
                .map_err(|e| ConfigError::Invalid(format!("language '{name}': {e}")))?;
            lang.resources.check(&format!("languages.{name}.resources"))?;
        }
        Ok(())
    }

    /// Names of the configured languages, sorted.
    pub fn language_names(&self) -> Vec<&str> {
        self.languages.0.keys().map(String::as_str).collect()
    }

    /// Resolves one request into a [`SandboxConfig`].
    ///
    /// An absent or blank `version` falls back to the language's
    /// `default_version`.
    pub fn resolve(
        &self,
        language: &str,
        version: Option<&str>,
    ) -> Result<SandboxConfig, SandboxError> {
        let lang = self.languages.0.get(language).ok_or_else(|| {
            SandboxError::Configuration(format!("unsupported language '{language}'"))
        })?;

        let version = version
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .or_else(|| {
                lang.default_version
                    .as_deref()
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
            })
            .ok_or_else(|| {
                SandboxError::Configuration(format!(
                    "no version given and language '{language}' has no default_version"
                ))
            })?
            .to_string();

        template::check_entrypoint_len(&lang.entrypoint)?;
        let image = template::resolve_image(&lang.image, language, &version)?;
        let limits = self.runtimes.resources.merged(&lang.resources).to_limits();

        let config = SandboxConfig {
            language: language.to_string(),
            version,
            image,
            entrypoint: lang.entrypoint.clone(),
            suffix: lang.suffix.clone(),
            limits,
            network_enabled: self.runtimes.network.enabled,
            timeout: self.runtimes.timeout,
            work_dir: self.runtimes.work_dir.clone(),
            retry: self.runtimes.retry.to_policy(),
        };
        config.validate()?;
        Ok(config)
    }
}

fn lang(suffix: &str, version: &str, image: &str, run: &str) -> LanguageSettings {
    LanguageSettings {
        suffix: suffix.to_string(),
        default_version: Some(version.to_string()),
        image: image.to_string(),
        entrypoint: vec!["sh".to_string(), "-c".to_string(), run.to_string()],
        resources: ResourceSettings::default(),
    }
}

/// Languages available when no configuration file exists.
pub fn builtin_languages() -> BTreeMap<String, LanguageSettings> {
    BTreeMap::from([
        (
            "python".to_string(),
            lang("py", "3.12", "python:{version}-slim", "python {exec_file}"),
        ),
        (
            "bash".to_string(),
            lang("sh", "5.2", "bash:{version}", "bash {exec_file}"),
        ),
        (
            "go".to_string(),
            lang(
                "go",
                "1.22",
                "golang:{version}-alpine",
                "cd {path} && GOCACHE=/tmp/gocache go run {exec_file}",
            ),
        ),
        (
            "node".to_string(),
            lang("js", "20", "node:{version}-alpine", "node {exec_file}"),
        ),
    ])
}

/// Picks the configuration file: `explicit` if given, else the first
/// existing entry of [`DEFAULT_CONFIG_PATHS`]. `None` means built-in defaults.
pub fn find_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    DEFAULT_CONFIG_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|p| p.is_file())
}

/// Parses `500ms`, `10s`, `2m`, `1h` or a bare number of seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    let (number, scale) = if let Some(n) = s.strip_suffix("ms") {
        (n, 0.001)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1.0)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60.0)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3600.0)
    } else {
        (s, 1.0)
    };

    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration '{input}'"))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("invalid duration '{input}'"));
    }
    Duration::try_from_secs_f64(value * scale).map_err(|_| format!("invalid duration '{input}'"))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Fractional(f64),
    Text(String),
}

impl RawDuration {
    fn into_duration(self) -> Result<Duration, String> {
        match self {
            RawDuration::Seconds(s) => Ok(Duration::from_secs(s)),
            RawDuration::Fractional(s) => {
                Duration::try_from_secs_f64(s).map_err(|_| format!("invalid duration '{s}'"))
            }
            RawDuration::Text(s) => parse_duration(&s),
        }
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    RawDuration::deserialize(deserializer)?
        .into_duration()
        .map_err(serde::de::Error::custom)
}

fn deserialize_opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<RawDuration>::deserialize(deserializer)?
        .map(RawDuration::into_duration)
        .transpose()
        .map_err(serde::de::Error::custom)
}

type Subscriber = Box<dyn Fn(&Settings) + Send + Sync>;

/// Owns the current settings snapshot.
pub struct ConfigManager {
    path: Option<PathBuf>,
    current: RwLock<Arc<Settings>>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl ConfigManager {
    /// Loads `path`, or uses built-in defaults when `path` is `None`.
    pub fn load(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let settings = match &path {
            Some(p) => {
                let settings = Settings::load(p)?;
                info!(path = %p.display(), languages = settings.languages.0.len(), "Loaded configuration");
                settings
            }
            None => {
                info!("No configuration file found, using built-in defaults");
                Settings::default()
            }
        };
        Ok(Self {
            path,
            current: RwLock::new(Arc::new(settings)),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Wraps fixed settings with no backing file.
    pub fn from_settings(settings: Settings) -> Self {
        Self {
            path: None,
            current: RwLock::new(Arc::new(settings)),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The settings in effect right now.
    pub fn snapshot(&self) -> Arc<Settings> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Registers a callback run after every successful reload.
    pub fn subscribe(&self, callback: impl Fn(&Settings) + Send + Sync + 'static) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(callback));
    }

    /// Re-reads the file. On failure the previous snapshot stays in effect.
    pub fn reload(&self) -> Result<Arc<Settings>, ConfigError> {
        let Some(path) = &self.path else {
            return Ok(self.snapshot());
        };

        let settings = Arc::new(Settings::load(path)?);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&settings);
        info!(path = %path.display(), "Configuration reloaded");

        for callback in self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            callback(&settings);
        }
        Ok(settings)
    }

    /// Polls the file every `interval` and reloads it when it changes,
    /// until `cancel` fires. Does nothing without a backing file.
    pub fn watch(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let Some(path) = manager.path.clone() else {
                return;
            };
            let mut last = file_stamp(&path);
            debug!(path = %path.display(), "Watching configuration file");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let stamp = file_stamp(&path);
                if stamp == last {
                    continue;
                }
                last = stamp;

                if let Err(e) = manager.reload() {
                    warn!(path = %path.display(), error = %e, "Config reload failed, keeping previous settings");
                }
            }
        })
    }
}

fn file_stamp(path: &Path) -> Option<(SystemTime, u64)> {
    let meta = std::fs::metadata(path).ok()?;
    Some((meta.modified().ok()?, meta.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
server:
  name: sandbox-test
  version: 0.0.1
runtimes:
  engine: docker
  cleanup_on_exit: false
  work_dir: /var/tmp/sb
  timeout: 30
  resources:
    cpu_timeout: 5s
    memory_mb: 256
    disk_mb: 64
  network:
    enabled: false
languages:
  python:
    suffix: py
    base_image: "3.11"
    default_image: "python:{version}-slim"
    entrypoint: ["sh", "-c", "python {exec_file}"]
    resources:
      memory_mb: 512
  bash:
    suffix: sh
    image: "bash:{version}"
    entrypoint: ["sh", "-c", "bash {exec_file}"]
"#;

    fn sample() -> Settings {
        serde_yaml::from_str(SAMPLE).unwrap()
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("7").unwrap(), Duration::from_secs(7));
        assert_eq!(parse_duration(" 1.5s ").unwrap(), Duration::from_millis(1500));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("-1s").is_err());
        assert!(parse_duration("1e300").is_err());
        assert!(parse_duration("1e300h").is_err());
    }

    #[test]
    fn test_oversized_cpu_timeout_is_a_yaml_error() {
        let yaml = "runtimes:\n  resources:\n    cpu_timeout: 1.0e300\n";
        assert!(serde_yaml::from_str::<Settings>(yaml).is_err());
    }

    #[test]
    fn test_validate_rejects_tiny_cpu_share() {
        let mut settings = sample();
        settings.runtimes.resources.cpus = Some(0.0);
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));

        let mut settings = sample();
        settings
            .languages
            .0
            .get_mut("python")
            .unwrap()
            .resources
            .cpus = Some(0.005);
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("languages.python.resources.cpus"));

        let mut settings = sample();
        settings.runtimes.resources.cpus = Some(0.5);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_sample_parses_with_aliases() {
        let settings = sample();
        assert_eq!(settings.server.name, "sandbox-test");
        assert!(!settings.runtimes.cleanup_on_exit);
        assert_eq!(settings.runtimes.timeout, Duration::from_secs(30));
        assert_eq!(
            settings.runtimes.resources.cpu_timeout,
            Some(Duration::from_secs(5))
        );

        let python = &settings.languages.0["python"];
        assert_eq!(python.default_version.as_deref(), Some("3.11"));
        assert_eq!(python.image, "python:{version}-slim");
        assert_eq!(settings.language_names(), vec!["bash", "python"]);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_resolve_merges_resources_field_by_field() {
        let config = sample().resolve("python", None).unwrap();
        assert_eq!(config.version, "3.11");
        assert_eq!(config.image, "python:3.11-slim");
        assert_eq!(config.limits.memory_mb, 512);
        assert_eq!(config.limits.disk_mb, 64);
        assert_eq!(config.limits.cpu_timeout, Duration::from_secs(5));
        assert_eq!(config.limits.cpu_cores, 1.0);
        assert_eq!(config.work_dir, PathBuf::from("/var/tmp/sb"));
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn test_resolve_explicit_version() {
        let config = sample().resolve("python", Some("3.13")).unwrap();
        assert_eq!(config.image, "python:3.13-slim");

        let blank = sample().resolve("python", Some("  ")).unwrap();
        assert_eq!(blank.version, "3.11");
    }

    #[test]
    fn test_resolve_unknown_language() {
        let err = sample().resolve("cobol", None).unwrap_err();
        assert!(matches!(err, SandboxError::Configuration(ref m) if m.contains("cobol")));
    }

    #[test]
    fn test_resolve_without_default_version() {
        let err = sample().resolve("bash", None).unwrap_err();
        assert!(matches!(err, SandboxError::Configuration(_)));
        assert!(sample().resolve("bash", Some("5.2")).is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_entrypoint() {
        let mut settings = sample();
        settings
            .languages
            .0
            .get_mut("bash")
            .unwrap()
            .entrypoint
            .pop();
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_builtin_defaults_resolve() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        for name in ["python", "bash", "go", "node"] {
            let config = settings.resolve(name, None).unwrap();
            assert!(!config.image.contains('{'), "{name}: {}", config.image);
        }
    }

    #[test]
    fn test_load_reports_yaml_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "runtimes: [not, a, map]").unwrap();
        assert!(matches!(Settings::load(&path), Err(ConfigError::Yaml { .. })));
        assert!(matches!(
            Settings::load(&dir.path().join("missing.yaml")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_find_config_path_prefers_explicit() {
        let explicit = PathBuf::from("/etc/sandbox.yaml");
        assert_eq!(find_config_path(Some(&explicit)), Some(explicit));
    }

    #[test]
    fn test_reload_notifies_and_keeps_previous_on_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, SAMPLE).unwrap();

        let manager = ConfigManager::load(Some(path.clone())).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        manager.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        std::fs::write(&path, SAMPLE.replace("sandbox-test", "renamed")).unwrap();
        manager.reload().unwrap();
        assert_eq!(manager.snapshot().server.name, "renamed");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        std::fs::write(&path, "languages: 12").unwrap();
        assert!(manager.reload().is_err());
        assert_eq!(manager.snapshot().server.name, "renamed");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_watch_picks_up_changes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, SAMPLE).unwrap();

        let manager = Arc::new(ConfigManager::load(Some(path.clone())).unwrap());
        let cancel = CancellationToken::new();
        let handle = manager.watch(Duration::from_millis(20), cancel.clone());

        std::fs::write(&path, SAMPLE.replace("sandbox-test", "watched")).unwrap();

        let mut updated = false;
        for _ in 0..100 {
            if manager.snapshot().server.name == "watched" {
                updated = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cancel.cancel();
        handle.await.unwrap();
        assert!(updated);
    }

    #[test]
    fn test_manager_without_file_uses_defaults() {
        let manager = ConfigManager::load(None).unwrap();
        assert!(manager.path().is_none());
        assert!(manager.reload().is_ok());
        assert!(manager.snapshot().languages.0.contains_key("python"));
    }
}
