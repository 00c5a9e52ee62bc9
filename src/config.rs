//! Configuration loading, validation and persistence
//!
//! The on-disk format is JSON:
//!
//! ```json
//! {
//!   "hosts": { "example.com": "http://127.0.0.1:8080" },
//!   "access_log": "access.hostproxy.log",
//!   "error_log": "error.hostproxy.log",
//!   "tls_cert": "/etc/ssl/certs/hostproxy.pem",
//!   "tls_key": "/etc/ssl/private/hostproxy.key",
//!   "max_requests": 100,
//!   "window_size": 60
//! }
//! ```
//!
//! Only `hosts` is required. Loading is all-or-nothing: a payload is fully
//! validated before anything is installed into the live [`ProxyConfig`].

use crate::error::ConfigError;
use crate::pipeline::PipelineFactory;
use crate::routes::{HostMappingTable, HostTarget, ParsedConfig, ProxyConfig, Settings};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Requests allowed per window when `max_requests` is unset or non-positive
pub const DEFAULT_MAX_REQUESTS: u32 = 100;
/// Window length in seconds when `window_size` is unset or non-positive
pub const DEFAULT_WINDOW_SECS: u64 = 60;

/// Wire representation of the configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub hosts: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_log: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_log: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_cert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_requests: Option<i64>,
    /// Seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_size: Option<i64>,
}

impl ConfigFile {
    /// Wire form of a live configuration
    pub fn from_parsed(parsed: &ParsedConfig) -> Self {
        let path = |p: &Path| Some(p.to_string_lossy().into_owned());
        let settings = &parsed.settings;

        Self {
            hosts: parsed
                .hosts
                .iter()
                .map(|(host, target)| (host.clone(), target.raw().to_string()))
                .collect(),
            access_log: path(&settings.access_log),
            error_log: path(&settings.error_log),
            tls_cert: path(&settings.tls_cert),
            tls_key: path(&settings.tls_key),
            max_requests: Some(i64::from(settings.max_requests)),
            window_size: Some(settings.window_size.as_secs() as i64),
        }
    }
}

/// Base name of the running executable
pub fn program_name() -> String {
    std::env::args_os()
        .next()
        .as_deref()
        .map(Path::new)
        .and_then(Path::file_stem)
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string())
}

/// Resolve `file` against `base`. Empty input stays unset.
pub fn abs_path(base: &Path, file: &str) -> Option<PathBuf> {
    if file.is_empty() {
        return None;
    }

    let path = Path::new(file);
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };

    Some(joined.components().collect())
}

/// Default settings for `program`, before path resolution
fn default_paths(program: &str) -> [String; 4] {
    [
        format!("access.{}.log", program),
        format!("error.{}.log", program),
        format!("/etc/ssl/certs/{}.pem", program),
        format!("/etc/ssl/private/{}.key", program),
    ]
}

fn positive_or(value: Option<i64>, default: u64) -> u64 {
    match value {
        Some(v) if v > 0 => v as u64,
        _ => default,
    }
}

fn parse_hosts(raw: &BTreeMap<String, String>, factory: &PipelineFactory) -> Result<HostMappingTable, ConfigError> {
    if raw.is_empty() {
        return Err(ConfigError::validation("missing host mappings"));
    }

    let mut hosts = HostMappingTable::with_capacity(raw.len());
    for (name, target) in raw {
        let hostname = name.trim().to_ascii_lowercase();
        if hostname.is_empty() {
            return Err(ConfigError::validation("empty hostname in host mappings"));
        }

        let entry = HostTarget::parse(target.trim())
            .map_err(|e| ConfigError::validation(format!("host '{}': invalid target '{}': {}", name, target, e)))?;

        // Builds the pipeline eagerly; also rejects other schemes and missing hosts.
        let pipeline = factory
            .build(entry.target())
            .map_err(|e| ConfigError::validation(format!("host '{}': {}", name, e)))?;

        if hosts.contains_key(&hostname) {
            return Err(ConfigError::validation(format!("duplicate host mapping for '{}'", hostname)));
        }
        hosts.insert(hostname, entry.with_pipeline(Arc::new(pipeline)));
    }

    Ok(hosts)
}

/// Parse and validate a configuration payload
pub fn load(raw: &[u8], factory: &PipelineFactory) -> Result<ParsedConfig, ConfigError> {
    let file: ConfigFile = serde_json::from_slice(raw)?;
    let hosts = parse_hosts(&file.hosts, factory)?;

    let cwd = std::env::current_dir().map_err(|e| ConfigError::io(".", e))?;
    let [access, error, cert, key] = default_paths(&program_name());
    let resolve = |value: &Option<String>, default: String| {
        let value = value.as_deref().filter(|v| !v.is_empty()).unwrap_or(default.as_str());
        abs_path(&cwd, value).unwrap_or_else(|| PathBuf::from(value))
    };

    let max_requests = positive_or(file.max_requests, u64::from(DEFAULT_MAX_REQUESTS));
    let settings = Settings {
        access_log: resolve(&file.access_log, access),
        error_log: resolve(&file.error_log, error),
        tls_cert: resolve(&file.tls_cert, cert),
        tls_key: resolve(&file.tls_key, key),
        max_requests: u32::try_from(max_requests).unwrap_or(u32::MAX),
        window_size: Duration::from_secs(positive_or(file.window_size, DEFAULT_WINDOW_SECS)),
    };

    Ok(ParsedConfig { hosts, settings })
}

/// Stat and read the configuration file. Looser than 0600 is only a warning.
fn read_config_file(path: &Path) -> Result<Vec<u8>, ConfigError> {
    let metadata = fs::metadata(path).map_err(|source| ConfigError::NotFound {
        path: path.to_path_buf(),
        source,
    })?;

    if metadata.is_dir() {
        return Err(ConfigError::validation(format!("'{}' is a directory", path.display())));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = metadata.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            warn!(
                path = %path.display(),
                mode = %format!("{:o}", mode),
                "Configuration file is accessible by other users, expected 0600"
            );
        }
    }

    fs::read(path).map_err(|e| ConfigError::io(path, e))
}

/// Load the configuration at `path` into a new [`ProxyConfig`]
pub fn load_config(path: &Path, factory: PipelineFactory) -> Result<ProxyConfig, ConfigError> {
    let raw = read_config_file(path)?;
    let parsed = load(&raw, &factory)?;

    info!(path = %path.display(), hosts = parsed.hosts.len(), "Configuration loaded");
    Ok(ProxyConfig::new(parsed, factory))
}

/// Reload `path` into the live configuration. On error the current
/// configuration is left untouched.
pub fn load_from_path(config: &ProxyConfig, path: &Path) -> Result<(), ConfigError> {
    let raw = read_config_file(path)?;
    let parsed = load(&raw, config.factory())?;
    let hosts = parsed.hosts.len();

    config.replace_all(parsed);
    info!(path = %path.display(), hosts, generation = config.generation(), "Configuration reloaded");
    Ok(())
}

/// Write the live configuration to `path` atomically, mode 0600
pub fn save(config: &ProxyConfig, path: &Path) -> Result<(), ConfigError> {
    let file = ConfigFile::from_parsed(&config.snapshot());
    let mut json = serde_json::to_vec_pretty(&file)?;
    json.push(b'\n');

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| ConfigError::io(dir, e))?;
    tmp.write_all(&json).map_err(|e| ConfigError::io(tmp.path(), e))?;
    tmp.as_file().sync_all().map_err(|e| ConfigError::io(tmp.path(), e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600))
            .map_err(|e| ConfigError::io(tmp.path(), e))?;
    }

    tmp.persist(path).map_err(|e| ConfigError::io(path, e.error))?;
    debug!(path = %path.display(), "Configuration saved");
    Ok(())
}

#[cfg(unix)]
fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_root() -> bool {
    false
}

/// Directory holding the configuration and generated TLS material.
/// Created with mode 0770 if missing.
pub fn conf_dir() -> PathBuf {
    let program = program_name();
    let dir = if is_root() {
        PathBuf::from("/etc").join(&program)
    } else {
        match dirs_next::config_dir() {
            Some(base) => base.join(&program),
            None => return PathBuf::from("."),
        }
    };

    if !dir.exists() {
        if let Err(e) = create_private_dir(&dir) {
            warn!(path = %dir.display(), error = %e, "Failed to create configuration directory");
        }
    }
    dir
}

fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new().recursive(true).mode(0o770).create(dir)
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(dir)
    }
}

/// `<conf_dir>/<program>.json`
pub fn default_config_path() -> PathBuf {
    conf_dir().join(format!("{}.json", program_name()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::TransportConfig;
    use tempfile::TempDir;

    const VALID_JSON: &str = r#"{
        "hosts": {
            "example.com": "http://localhost:8080",
            "Test.COM": "https://localhost:8443"
        },
        "access_log": "/var/log/access.log",
        "error_log": "/var/log/error.log",
        "tls_cert": "/etc/ssl/cert.pem",
        "tls_key": "/etc/ssl/key.pem",
        "max_requests": 150,
        "window_size": 120
    }"#;

    fn factory() -> PipelineFactory {
        PipelineFactory::new(TransportConfig::default())
    }

    fn write_config(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();
        }
        path
    }

    #[test]
    fn test_load_valid_config() {
        let parsed = load(VALID_JSON.as_bytes(), &factory()).unwrap();

        assert_eq!(parsed.hosts.len(), 2);
        assert_eq!(parsed.hosts["example.com"].raw(), "http://localhost:8080");
        assert_eq!(parsed.hosts["test.com"].target().scheme(), "https");
        assert!(parsed.hosts.values().all(|h| h.pipeline().is_some()));

        let settings = &parsed.settings;
        assert_eq!(settings.access_log, PathBuf::from("/var/log/access.log"));
        assert_eq!(settings.error_log, PathBuf::from("/var/log/error.log"));
        assert_eq!(settings.tls_cert, PathBuf::from("/etc/ssl/cert.pem"));
        assert_eq!(settings.tls_key, PathBuf::from("/etc/ssl/key.pem"));
        assert_eq!(settings.max_requests, 150);
        assert_eq!(settings.window_size, Duration::from_secs(120));
    }

    #[test]
    fn test_load_fills_defaults() {
        let raw = br#"{"hosts": {"a.com": "http://10.0.0.1:9000"}}"#;
        let first = load(raw, &factory()).unwrap();
        let second = load(raw, &factory()).unwrap();

        assert_eq!(first.settings.max_requests, DEFAULT_MAX_REQUESTS);
        assert_eq!(first.settings.window_size, Duration::from_secs(DEFAULT_WINDOW_SECS));
        assert_eq!(first.settings, second.settings);

        let program = program_name();
        assert!(first.settings.access_log.is_absolute());
        assert!(first
            .settings
            .access_log
            .ends_with(format!("access.{}.log", program)));
        assert_eq!(
            first.settings.tls_key,
            PathBuf::from(format!("/etc/ssl/private/{}.key", program))
        );
    }

    #[test]
    fn test_load_non_positive_limits_use_defaults() {
        let raw = br#"{"hosts":{"a.com":"http://10.0.0.1:9000"},"max_requests":0,"window_size":-5}"#;
        let parsed = load(raw, &factory()).unwrap();

        assert_eq!(parsed.settings.max_requests, 100);
        assert_eq!(parsed.settings.window_size, Duration::from_secs(60));
    }

    #[test]
    fn test_load_rejects_missing_hosts() {
        for raw in ["{}", r#"{"access_log": "a.log"}"#, r#"{"hosts": {}}"#] {
            let err = load(raw.as_bytes(), &factory()).unwrap_err();
            assert!(matches!(err, ConfigError::Validation(_)), "{:?}", err);
            assert!(err.to_string().contains("missing host mappings"));
        }
    }

    #[test]
    fn test_load_rejects_invalid_json() {
        let err = load(b"{invalid json}", &factory()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_rejects_bad_schemes() {
        for target in ["invalid://url", "invalid:url", "ftp://x", "not a url"] {
            let raw = format!(
                r#"{{"hosts": {{"good.com": "http://localhost:8080", "bad.com": "{}"}}}}"#,
                target
            );
            let err = load(raw.as_bytes(), &factory()).unwrap_err();
            assert!(matches!(err, ConfigError::Validation(_)), "{}: {:?}", target, err);
            assert!(err.to_string().contains("bad.com"), "{}", err);
        }
    }

    #[test]
    fn test_load_rejects_duplicate_hosts_after_lowercasing() {
        let raw = br#"{"hosts": {"a.com": "http://10.0.0.1:9000", "A.com": "http://10.0.0.2:9000"}}"#;
        let err = load(raw, &factory()).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_load_ignores_unknown_fields() {
        let raw = br#"{"hosts": {"a.com": "http://10.0.0.1:9000"}, "extra": true}"#;
        assert!(load(raw, &factory()).is_ok());
    }

    #[test]
    fn test_abs_path() {
        let base = Path::new("/srv/proxy");
        assert_eq!(abs_path(base, ""), None);
        assert_eq!(abs_path(base, "/var/log/x.log"), Some(PathBuf::from("/var/log/x.log")));
        assert_eq!(abs_path(base, "//tc8"), Some(PathBuf::from("/tc8")));
        assert_eq!(abs_path(base, "logs/x.log"), Some(PathBuf::from("/srv/proxy/logs/x.log")));
        assert_eq!(abs_path(base, "./x.log"), Some(PathBuf::from("/srv/proxy/x.log")));
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "proxy.json", VALID_JSON);

        let config = load_config(&path, factory()).unwrap();
        assert_eq!(config.len(), 2);
        assert_eq!(config.rate_limit(), (150, Duration::from_secs(120)));
    }

    #[test]
    fn test_load_config_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = load_config(&dir.path().join("missing.json"), factory()).err().unwrap();
        assert!(matches!(err, ConfigError::NotFound { .. }));

        let err = load_config(Path::new(""), factory()).err().unwrap();
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }

    #[test]
    fn test_load_from_path_directory_keeps_table() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "proxy.json", VALID_JSON);
        let config = load_config(&path, factory()).unwrap();

        let err = load_from_path(&config, dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        assert_eq!(config.len(), 2);
        assert_eq!(config.generation(), 0);
    }

    #[test]
    fn test_load_from_path_invalid_keeps_table() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "proxy.json", VALID_JSON);
        let config = load_config(&path, factory()).unwrap();
        let before = config.hostnames();

        write_config(
            &dir,
            "proxy.json",
            r#"{"hosts": {"new.com": "http://localhost:9000", "bad.com": "invalid:url"}}"#,
        );
        assert!(load_from_path(&config, &path).is_err());
        assert_eq!(config.hostnames(), before);
        assert_eq!(config.rate_limit().0, 150);
    }

    #[test]
    fn test_load_from_path_replaces_table() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "proxy.json", VALID_JSON);
        let config = load_config(&path, factory()).unwrap();

        write_config(&dir, "proxy.json", r#"{"hosts": {"new.com": "http://localhost:9000"}}"#);
        load_from_path(&config, &path).unwrap();

        assert_eq!(config.hostnames(), vec!["new.com".to_string()]);
        assert_eq!(config.rate_limit().0, DEFAULT_MAX_REQUESTS);
        assert_eq!(config.generation(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_loose_permissions_only_warn() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "proxy.json", VALID_JSON);
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        assert!(load_config(&path, factory()).is_ok());
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "proxy.json", VALID_JSON);
        let config = load_config(&path, factory()).unwrap();

        let saved = dir.path().join("saved.json");
        save(&config, &saved).unwrap();
        let reloaded = load_config(&saved, factory()).unwrap();

        assert_eq!(reloaded.hostnames(), config.hostnames());
        for host in config.hostnames() {
            assert_eq!(
                reloaded.lookup(&host).unwrap().raw(),
                config.lookup(&host).unwrap().raw()
            );
        }
        assert_eq!(reloaded.settings(), config.settings());
    }

    #[cfg(unix)]
    #[test]
    fn test_save_forces_private_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "proxy.json", VALID_JSON);
        let config = load_config(&path, factory()).unwrap();

        let saved = dir.path().join("saved.json");
        fs::write(&saved, "old").unwrap();
        fs::set_permissions(&saved, fs::Permissions::from_mode(0o644)).unwrap();

        save(&config, &saved).unwrap();
        let mode = fs::metadata(&saved).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn test_save_into_missing_directory_fails() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "proxy.json", VALID_JSON);
        let config = load_config(&path, factory()).unwrap();

        let err = save(&config, &dir.path().join("nope").join("saved.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_config_file_serialization_shape() {
        let parsed = load(VALID_JSON.as_bytes(), &factory()).unwrap();
        let file = ConfigFile::from_parsed(&parsed);
        let value = serde_json::to_value(&file).unwrap();

        assert_eq!(value["hosts"]["test.com"], "https://localhost:8443");
        assert_eq!(value["max_requests"], 150);
        assert_eq!(value["window_size"], 120);
    }
}
