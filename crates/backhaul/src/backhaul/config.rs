use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
#[cfg(not(target_os = "linux"))]
use directories::ProjectDirs;
use serde::Deserialize;

pub const CONFIG_ENV: &str = "BACKHAUL_CONFIG";

const CONFIG_CANDIDATES: [&str; 3] = ["backhaul.toml", "backhaul.yaml", "backhaul.yml"];

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(flag: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = flag {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    // clap maps BACKHAUL_CONFIG into the flag already; this covers callers that bypass clap.
    if let Some(p) = std::env::var_os(CONFIG_ENV) {
        if !p.is_empty() {
            return Ok(ResolvedConfigPath {
                path: normalize_explicit_path(Path::new(&p))?,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Some(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }
    if p.is_dir() {
        return Ok(discover_config_path(p).unwrap_or_else(|| p.join(CONFIG_CANDIDATES[0])));
    }
    Ok(p.to_path_buf())
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    CONFIG_CANDIDATES
        .iter()
        .map(|c| dir.join(c))
        .find(|p| p.is_file())
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/backhaul/backhaul.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("org", "backhaul", "backhaul")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("backhaul.toml"))
    }
}

/// Loads `resolved`; a missing file at the default location yields built-in defaults.
pub fn load_resolved(resolved: &ResolvedConfigPath) -> anyhow::Result<Config> {
    if resolved.source == ConfigPathSource::Default && !resolved.path.exists() {
        return Ok(Config::default());
    }
    load_config(&resolved.path)
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {:?}", ext),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Empty disables the admin listener.
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub timeouts: Timeouts,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub public_host: Option<String>,
    pub advertise_host: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub name: String,
    pub expose: u16,
    pub target: String,
    pub reconnect: bool,
}

#[derive(Debug, Clone)]
pub struct Timeouts {
    pub call: Duration,
    pub rendezvous: Duration,
    pub dial: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            admin_addr: String::new(),
            logging: LoggingConfig {
                level: "info".into(),
                format: "text".into(),
                output: "stderr".into(),
                add_source: false,
            },
            server: ServerConfig {
                bind: "127.0.0.1:9201".into(),
                public_host: None,
                advertise_host: None,
            },
            client: ClientConfig {
                host: "127.0.0.1:9201".into(),
                name: "backhaul-client".into(),
                expose: 4711,
                target: "google.de".into(),
                reconnect: false,
            },
            timeouts: Timeouts {
                call: Duration::from_millis(10_000),
                rendezvous: Duration::from_millis(10_000),
                dial: Duration::from_millis(5_000),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    admin_addr: String,
    logging: Option<FileLogging>,
    server: Option<FileServer>,
    client: Option<FileClient>,
    timeouts: Option<FileTimeouts>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileServer {
    bind: Option<String>,
    public_host: Option<String>,
    advertise_host: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClient {
    host: Option<String>,
    name: Option<String>,
    expose: Option<u16>,
    target: Option<String>,
    #[serde(default)]
    reconnect: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTimeouts {
    call_timeout_ms: Option<i64>,
    rendezvous_timeout_ms: Option<i64>,
    dial_timeout_ms: Option<i64>,
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn millis_or(ms: Option<i64>, default: Duration) -> Duration {
    match ms {
        Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
        _ => default,
    }
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut cfg = Config {
            admin_addr: fc.admin_addr.trim().to_string(),
            ..Config::default()
        };

        if let Some(l) = fc.logging {
            if let Some(v) = non_empty(l.level) {
                cfg.logging.level = v;
            }
            if let Some(v) = non_empty(l.format) {
                cfg.logging.format = v.to_ascii_lowercase();
            }
            if let Some(v) = non_empty(l.output) {
                cfg.logging.output = v;
            }
            cfg.logging.add_source = l.add_source;
        }
        match cfg.logging.format.as_str() {
            "text" | "json" => {}
            other => anyhow::bail!("config: logging.format must be text or json, got {other:?}"),
        }

        if let Some(s) = fc.server {
            if let Some(v) = non_empty(s.bind) {
                cfg.server.bind = v;
            }
            cfg.server.public_host = non_empty(s.public_host);
            cfg.server.advertise_host = non_empty(s.advertise_host);
        }

        if let Some(c) = fc.client {
            if let Some(v) = non_empty(c.host) {
                cfg.client.host = v;
            }
            if let Some(v) = non_empty(c.name) {
                cfg.client.name = v;
            }
            if let Some(v) = c.expose {
                cfg.client.expose = v;
            }
            if let Some(v) = non_empty(c.target) {
                cfg.client.target = v;
            }
            cfg.client.reconnect = c.reconnect;
        }

        if let Some(t) = fc.timeouts {
            cfg.timeouts.call = millis_or(t.call_timeout_ms, cfg.timeouts.call);
            cfg.timeouts.rendezvous = millis_or(t.rendezvous_timeout_ms, cfg.timeouts.rendezvous);
            cfg.timeouts.dial = millis_or(t.dial_timeout_ms, cfg.timeouts.dial);
        }

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!(
            "backhaul_cfg_test_{name}_{}_{}",
            std::process::id(),
            now
        ));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    #[test]
    fn toml_overrides_defaults() {
        let dir = temp_dir("toml");
        let path = dir.join("backhaul.toml");
        std::fs::write(
            &path,
            r#"
admin_addr = "127.0.0.1:9300"

[logging]
level = "debug"
format = "JSON"

[server]
bind = ":9201"
advertise_host = "tunnel.example.org"

[client]
expose = 18080
target = "127.0.0.1:9000"
reconnect = true

[timeouts]
call_timeout_ms = 2500
rendezvous_timeout_ms = -1
"#,
        )
        .expect("write");

        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.admin_addr, "127.0.0.1:9300");
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.logging.format, "json");
        assert_eq!(cfg.server.bind, ":9201");
        assert_eq!(cfg.server.public_host, None);
        assert_eq!(cfg.server.advertise_host.as_deref(), Some("tunnel.example.org"));
        assert_eq!(cfg.client.host, "127.0.0.1:9201");
        assert_eq!(cfg.client.name, "backhaul-client");
        assert_eq!(cfg.client.expose, 18080);
        assert_eq!(cfg.client.target, "127.0.0.1:9000");
        assert!(cfg.client.reconnect);
        assert_eq!(cfg.timeouts.call, Duration::from_millis(2500));
        assert_eq!(cfg.timeouts.rendezvous, Duration::from_secs(10));
        assert_eq!(cfg.timeouts.dial, Duration::from_secs(5));
    }

    #[test]
    fn yaml_is_accepted() {
        let dir = temp_dir("yaml");
        let path = dir.join("backhaul.yml");
        std::fs::write(
            &path,
            "client:\n  name: c1\n  host: broker.example.org:9201\nserver:\n  public_host: 0.0.0.0\n",
        )
        .expect("write");

        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.client.name, "c1");
        assert_eq!(cfg.client.host, "broker.example.org:9201");
        assert_eq!(cfg.server.public_host.as_deref(), Some("0.0.0.0"));
        assert_eq!(cfg.logging.format, "text");
    }

    #[test]
    fn unknown_top_level_key_is_rejected() {
        let dir = temp_dir("unknown");
        let path = dir.join("backhaul.toml");
        std::fs::write(&path, "listeners = []\n").expect("write");
        let err = format!("{:#}", load_config(&path).unwrap_err());
        assert!(err.contains("listeners"), "{err}");
    }

    #[test]
    fn unknown_section_key_is_rejected() {
        let dir = temp_dir("unknown_nested");
        for (name, body) in [
            ("logging", "[logging]\nlevle = \"debug\"\n"),
            ("server", "[server]\nbind_addr = \":9201\"\n"),
            ("client", "[client]\nexposed = 18080\n"),
            ("timeouts", "[timeouts]\ncall_ms = 100\n"),
        ] {
            let path = dir.join(format!("{name}.toml"));
            std::fs::write(&path, body).expect("write");
            assert!(load_config(&path).is_err(), "[{name}] typo must be rejected");
        }
    }

    #[test]
    fn invalid_log_format_is_rejected() {
        let dir = temp_dir("format");
        let path = dir.join("backhaul.toml");
        std::fs::write(&path, "[logging]\nformat = \"xml\"\n").expect("write");
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn explicit_dir_discovers_candidate() {
        let dir = temp_dir("discover");
        let yaml = dir.join("backhaul.yaml");
        std::fs::write(&yaml, "admin_addr: ''\n").expect("write");

        let resolved = resolve_config_path(Some(dir.clone())).unwrap();
        assert_eq!(resolved.source, ConfigPathSource::Flag);
        assert_eq!(resolved.path, yaml);
    }

    #[test]
    fn missing_default_file_yields_defaults() {
        let resolved = ResolvedConfigPath {
            path: temp_dir("missing").join("backhaul.toml"),
            source: ConfigPathSource::Default,
        };
        let cfg = load_resolved(&resolved).unwrap();
        assert_eq!(cfg.server.bind, "127.0.0.1:9201");
        assert_eq!(cfg.client.expose, 4711);

        let flagged = ResolvedConfigPath {
            source: ConfigPathSource::Flag,
            ..resolved
        };
        assert!(load_resolved(&flagged).is_err());
    }
}
