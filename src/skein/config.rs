use std::{
    fs,
    net::IpAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

/// File names probed, in order, when the config location is a directory.
const CONFIG_FILE_NAMES: [&str; 3] = ["skein.toml", "skein.yaml", "skein.yml"];

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl ConfigPathSource {
    fn as_str(self) -> &'static str {
        match self {
            ConfigPathSource::Flag => "flag",
            ConfigPathSource::Env => "env",
            ConfigPathSource::Cwd => "cwd",
            ConfigPathSource::Default => "default",
        }
    }
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolves where the config file lives: `--config` flag, then the
/// `SKEIN_CONFIG` env var, then the working directory, then the OS default.
pub fn resolve_config_path(
    flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    let explicit = flag_path.map(|p| (p, ConfigPathSource::Flag)).or_else(|| {
        std::env::var_os("SKEIN_CONFIG")
            .filter(|v| !v.is_empty())
            .map(|v| (PathBuf::from(v), ConfigPathSource::Env))
    });

    let (path, source) = match explicit {
        Some((p, source)) => (expand_explicit_path(p)?, source),
        None => match find_config_in(Path::new(".")) {
            Some(p) => (p, ConfigPathSource::Cwd),
            None => (default_config_path()?, ConfigPathSource::Default),
        },
    };
    Ok(ResolvedConfigPath { path, source })
}

/// An explicit location may name a directory (probe it for a skein config)
/// or a file that does not exist yet (a bare name gets the `.toml` template).
fn expand_explicit_path(p: PathBuf) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }
    match fs::metadata(&p) {
        Ok(m) if m.is_dir() => {
            Ok(find_config_in(&p).unwrap_or_else(|| p.join(CONFIG_FILE_NAMES[0])))
        }
        Ok(_) => Ok(p),
        Err(_) => {
            let mut p = p;
            if p.extension().is_none() {
                p.set_extension("toml");
            }
            Ok(p)
        }
    }
}

fn find_config_in(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILE_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.is_file())
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    // System-wide on Linux, per-user config dir elsewhere.
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/skein/skein.toml"));
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("dev", "skein", "skein")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("skein.toml"))
    }
}

/// Writes a commented, runnable default config when `path` does not exist
/// yet. Returns true when a file was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.is_file() {
        return Ok(false);
    }
    if path.exists() {
        anyhow::bail!("config: {} exists but is not a regular file", path.display());
    }

    let tmpl = template_for_extension(path)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("config: mkdir {}", parent.display()))?;
    }

    // create_new: lose the race against a concurrent instance instead of
    // clobbering what it wrote.
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .and_then(|mut f| {
            use std::io::Write;
            f.write_all(tmpl.as_bytes())
        })
        .with_context(|| format!("config: create {}", path.display()))?;
    Ok(true)
}

fn template_for_extension(path: &Path) -> anyhow::Result<&'static str> {
    match path.extension().and_then(|s| s.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("toml") => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
            Ok(DEFAULT_CONFIG_TEMPLATE_YAML)
        }
        other => anyhow::bail!(
            "config: unsupported config extension {other:?} (expected .toml or .yaml/.yml)"
        ),
    }
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
        _ => anyhow::bail!("config: unsupported config extension {}", ext),
    };

    Config::from_file_config(&fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub relay: RelayConfig,
    pub timeouts: Timeouts,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// URL path suffix the relay endpoint answers on. Requests whose path
    /// does not end with it get a 404.
    pub path: String,
    pub allow_udp_streams: bool,
    /// Regexes matched against destination hostnames before any dial.
    pub hostname_blacklist: Vec<String>,
    /// Pinned DNS resolvers. Empty list means the system resolver.
    pub dns_servers: Vec<IpAddr>,
    /// Allowed Origin/Referer hosts for the upgrade request. Empty means any.
    pub origin_whitelist: Vec<String>,
    pub max_sessions: usize,
    pub max_streams_per_session: usize,
    /// Per-stream inbound buffer depth, in DATA frames.
    pub stream_credit: u32,
    pub max_payload_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct Timeouts {
    pub dial_timeout: Duration,
    pub idle_timeout: Duration,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    listen_addr: String,

    relay: Option<FileRelay>,

    timeouts: Option<FileTimeouts>,

    logging: Option<FileLogging>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileRelay {
    path: Option<String>,
    #[serde(default)]
    allow_udp_streams: bool,
    #[serde(default)]
    hostname_blacklist: Vec<String>,
    dns_servers: Option<Vec<String>>,
    #[serde(default)]
    origin_whitelist: Vec<String>,
    max_sessions: Option<i64>,
    max_streams_per_session: Option<i64>,
    stream_credit: Option<i64>,
    max_payload_bytes: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileTimeouts {
    dial_timeout_ms: Option<i64>,
    idle_timeout_ms: Option<i64>,
    shutdown_grace_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

impl Config {
    fn from_file_config(fc: &FileConfig) -> anyhow::Result<Config> {
        let mut cfg = Config {
            listen_addr: fc.listen_addr.trim().to_string(),
            relay: RelayConfig {
                path: "/wisp/".into(),
                allow_udp_streams: false,
                hostname_blacklist: vec![],
                dns_servers: vec!["1.1.1.1".parse().unwrap(), "1.0.0.1".parse().unwrap()],
                origin_whitelist: vec![],
                max_sessions: 512,
                max_streams_per_session: 128,
                stream_credit: 32,
                max_payload_bytes: 64 * 1024 - 1,
            },
            timeouts: Timeouts {
                dial_timeout: Duration::from_millis(
                    fc.timeouts
                        .as_ref()
                        .and_then(|t| t.dial_timeout_ms)
                        .unwrap_or(5000)
                        .max(0) as u64,
                ),
                idle_timeout: Duration::from_millis(
                    fc.timeouts
                        .as_ref()
                        .and_then(|t| t.idle_timeout_ms)
                        .unwrap_or(120_000)
                        .max(0) as u64,
                ),
                shutdown_grace: Duration::from_millis(
                    fc.timeouts
                        .as_ref()
                        .and_then(|t| t.shutdown_grace_ms)
                        .unwrap_or(3000)
                        .max(0) as u64,
                ),
            },
            logging: LoggingConfig {
                level: "info".into(),
                format: "json".into(),
                output: "stderr".into(),
                add_source: false,
            },
        };

        if cfg.listen_addr.is_empty() {
            cfg.listen_addr = ":8080".into();
        }
        if cfg.timeouts.dial_timeout.is_zero() {
            cfg.timeouts.dial_timeout = Duration::from_millis(5000);
        }

        // --- Relay ---
        if let Some(r) = &fc.relay {
            if let Some(path) = &r.path {
                if !path.trim().is_empty() {
                    cfg.relay.path = path.trim().to_string();
                }
            }
            cfg.relay.allow_udp_streams = r.allow_udp_streams;
            cfg.relay.hostname_blacklist = r
                .hostname_blacklist
                .iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
            if let Some(servers) = &r.dns_servers {
                let mut out = Vec::with_capacity(servers.len());
                for s in servers {
                    let ip: IpAddr = s
                        .trim()
                        .parse()
                        .with_context(|| format!("config: invalid dns server {s:?}"))?;
                    out.push(ip);
                }
                cfg.relay.dns_servers = out;
            }
            cfg.relay.origin_whitelist = r
                .origin_whitelist
                .iter()
                .map(|o| o.trim().to_ascii_lowercase())
                .filter(|o| !o.is_empty())
                .collect();
            if let Some(n) = r.max_sessions {
                cfg.relay.max_sessions = n.max(0) as usize;
            }
            if let Some(n) = r.max_streams_per_session {
                cfg.relay.max_streams_per_session = n.max(0) as usize;
            }
            if let Some(n) = r.stream_credit {
                cfg.relay.stream_credit = n.max(0) as u32;
            }
            if let Some(n) = r.max_payload_bytes {
                cfg.relay.max_payload_bytes = n.max(0) as usize;
            }
        }

        // --- Logging ---
        if let Some(l) = &fc.logging {
            if let Some(level) = &l.level {
                if !level.trim().is_empty() {
                    cfg.logging.level = level.trim().to_string();
                }
            }
            if let Some(fmt) = &l.format {
                if !fmt.trim().is_empty() {
                    cfg.logging.format = fmt.trim().to_string();
                }
            }
            if let Some(out) = &l.output {
                if !out.trim().is_empty() {
                    cfg.logging.output = out.trim().to_string();
                }
            }
            cfg.logging.add_source = l.add_source;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !self.relay.path.starts_with('/') {
            anyhow::bail!("config: relay.path must start with '/'");
        }
        if self.relay.max_sessions == 0 {
            anyhow::bail!("config: relay.max_sessions must be at least 1");
        }
        if self.relay.max_streams_per_session == 0 {
            anyhow::bail!("config: relay.max_streams_per_session must be at least 1");
        }
        if self.relay.stream_credit == 0 {
            anyhow::bail!("config: relay.stream_credit must be at least 1");
        }
        // payload_len is a u16 on the wire.
        if self.relay.max_payload_bytes == 0 || self.relay.max_payload_bytes > u16::MAX as usize {
            anyhow::bail!(
                "config: relay.max_payload_bytes must be between 1 and {}",
                u16::MAX
            );
        }
        Ok(())
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# Skein configuration (auto-generated)
#
# This file was created because skein could not find a configuration file at
# the resolved config path. It is runnable without edits: the relay listens on
# :8080 and accepts WebSocket sessions on /wisp/.

listen_addr = ":8080"

[relay]
path = "/wisp/"
allow_udp_streams = false
# Regexes matched against destination hostnames, e.g. ["^localhost$", "\\.internal$"]
hostname_blacklist = []
dns_servers = ["1.1.1.1", "1.0.0.1"]
# Allowed Origin/Referer hosts for the upgrade request. Empty means any.
origin_whitelist = []
max_sessions = 512
max_streams_per_session = 128
stream_credit = 32
max_payload_bytes = 65535

[timeouts]
dial_timeout_ms = 5000
idle_timeout_ms = 120000
shutdown_grace_ms = 3000

[logging]
level = "info"
format = "json"
output = "stderr"
add_source = false

"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# Skein configuration (auto-generated)
#
# This file was created because skein could not find a configuration file at
# the resolved config path. It is runnable without edits: the relay listens on
# :8080 and accepts WebSocket sessions on /wisp/.

listen_addr: ":8080"

relay:
  path: "/wisp/"
  allow_udp_streams: false
  hostname_blacklist: []
  dns_servers: ["1.1.1.1", "1.0.0.1"]
  origin_whitelist: []
  max_sessions: 512
  max_streams_per_session: 128
  stream_credit: 32
  max_payload_bytes: 65535

timeouts:
  dial_timeout_ms: 5000
  idle_timeout_ms: 120000
  shutdown_grace_ms: 3000

logging:
  level: "info"
  format: "json"
  output: "stderr"
  add_source: false

"#;

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
            "skein_cfg_test_{name}_{}_{}",
            std::process::id(),
            now
        ));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    #[test]
    fn explicit_directory_resolves_to_contained_config() {
        let dir = temp_dir("dir_flag");
        std::fs::write(dir.join("skein.yaml"), "listen_addr: \":9999\"\n").expect("write");

        let resolved = resolve_config_path(Some(dir.clone())).expect("resolve");
        assert_eq!(resolved.path, dir.join("skein.yaml"));
        assert!(matches!(resolved.source, ConfigPathSource::Flag));

        // A bare file name that does not exist yet gets the toml extension.
        let resolved = resolve_config_path(Some(dir.join("custom"))).expect("resolve");
        assert_eq!(resolved.path, dir.join("custom.toml"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn defaults_are_applied() {
        let dir = temp_dir("defaults");
        let cfg_path = dir.join("skein.toml");
        std::fs::write(&cfg_path, "").expect("write");

        let cfg = load_config(&cfg_path).expect("load_config");
        assert_eq!(cfg.listen_addr, ":8080");
        assert_eq!(cfg.relay.path, "/wisp/");
        assert!(!cfg.relay.allow_udp_streams);
        assert_eq!(
            cfg.relay.dns_servers,
            vec!["1.1.1.1".parse::<IpAddr>().unwrap(), "1.0.0.1".parse().unwrap()]
        );
        assert_eq!(cfg.relay.stream_credit, 32);
        assert_eq!(cfg.timeouts.dial_timeout, Duration::from_secs(5));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn template_config_parses() {
        let dir = temp_dir("template");
        let cfg_path = dir.join("skein.toml");

        assert!(ensure_config_file(&cfg_path).expect("ensure"));
        assert!(!ensure_config_file(&cfg_path).expect("ensure again"));

        let cfg = load_config(&cfg_path).expect("load_config");
        assert_eq!(cfg.relay.max_payload_bytes, 65535);
        assert_eq!(cfg.timeouts.idle_timeout, Duration::from_secs(120));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn yaml_config_parses() {
        let dir = temp_dir("yaml");
        let cfg_path = dir.join("skein.yaml");

        let yaml = r#"
listen_addr: "127.0.0.1:9000"
relay:
  path: "/relay/"
  allow_udp_streams: true
  max_streams_per_session: 16
"#;
        std::fs::write(&cfg_path, yaml).expect("write");

        let cfg = load_config(&cfg_path).expect("load_config");
        assert_eq!(cfg.listen_addr, "127.0.0.1:9000");
        assert_eq!(cfg.relay.path, "/relay/");
        assert!(cfg.relay.allow_udp_streams);
        assert_eq!(cfg.relay.max_streams_per_session, 16);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn invalid_dns_server_is_rejected() {
        let dir = temp_dir("bad_dns");
        let cfg_path = dir.join("skein.toml");

        let toml = r#"
[relay]
dns_servers = ["not-an-ip"]
"#;
        std::fs::write(&cfg_path, toml).expect("write");

        let err = load_config(&cfg_path).unwrap_err();
        assert!(err.to_string().contains("invalid dns server"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn oversized_payload_limit_is_rejected() {
        let dir = temp_dir("payload");
        let cfg_path = dir.join("skein.toml");

        let toml = r#"
[relay]
max_payload_bytes = 100000
"#;
        std::fs::write(&cfg_path, toml).expect("write");

        assert!(load_config(&cfg_path).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn zero_stream_credit_is_rejected() {
        let dir = temp_dir("credit");
        let cfg_path = dir.join("skein.toml");

        let toml = r#"
[relay]
stream_credit = 0
"#;
        std::fs::write(&cfg_path, toml).expect("write");

        assert!(load_config(&cfg_path).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
