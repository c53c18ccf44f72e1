use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

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

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        let p = normalize_explicit_path(&p)?;
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    // clap already maps SKEIN_CONFIG into the flag value when unset, but keep
    // the precedence explicit by treating it as "env" when present.
    if let Some(p) = std::env::var_os("SKEIN_CONFIG") {
        if !p.is_empty() {
            let p = normalize_explicit_path(Path::new(&p))?;
            return Ok(ResolvedConfigPath {
                path: p,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path(),
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    let p = p.to_path_buf();

    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(&p) {
        if m.is_dir() {
            if let Ok(discovered) = discover_config_path(&p) {
                return Ok(discovered);
            }
            return Ok(p.join("skein.toml"));
        }
        return Ok(p);
    }

    // Non-existent path: default to .toml if no extension.
    let mut out = p;
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    let candidates = ["skein.toml", "skein.yaml", "skein.yml"];
    for c in candidates {
        let p = dir.join(c);
        if let Ok(m) = fs::metadata(&p) {
            if m.is_file() {
                return Ok(p);
            }
        }
    }
    anyhow::bail!("config: no skein.* found")
}

fn default_config_path() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/etc/skein/skein.toml")
    }
    #[cfg(not(target_os = "linux"))]
    {
        PathBuf::from("skein.toml")
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
    /// Ordered endpoint URIs (mtls://, http(s)://, dns://, wg://, pipe://,
    /// pivot://).
    pub endpoints: Vec<String>,
    pub strategy: String, // sequential | random | random-within-scheme
    pub reconnect_interval: Duration,
    pub max_errors: usize,
    pub poll_interval: Duration,
    pub dial_timeout: Duration,
    pub logging: LoggingConfig,
    pub tunnel: TunnelConfig,
    pub comm: CommConfig,
    pub mtls: MtlsConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub resend_threshold: usize,
    pub grace_close: Duration,
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Default)]
pub struct CommConfig {
    /// Our static x25519 private key, base64.
    pub private_key: String,
    /// Pinned peer fingerprint for sessions we initiate.
    pub remote_fingerprint: String,
    /// Fingerprints allowed to initiate sessions toward us.
    pub authorized_fingerprints: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MtlsConfig {
    pub cert_file: String,
    pub key_file: String,
    pub ca_file: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    endpoints: Vec<String>,

    strategy: Option<String>,

    reconnect_interval_ms: Option<i64>,

    max_errors: Option<i64>,

    poll_interval_ms: Option<i64>,

    dial_timeout_ms: Option<i64>,

    logging: Option<FileLogging>,

    tunnel: Option<FileTunnel>,

    comm: Option<FileComm>,

    mtls: Option<FileMtls>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
struct FileTunnel {
    resend_threshold: Option<i64>,
    grace_close_ms: Option<i64>,
    chunk_size: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileComm {
    private_key: Option<String>,
    remote_fingerprint: Option<String>,
    authorized_fingerprints: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct FileMtls {
    cert_file: Option<String>,
    key_file: Option<String>,
    ca_file: Option<String>,
}

const KNOWN_SCHEMES: [&str; 7] = ["mtls", "http", "https", "dns", "wg", "pipe", "pivot"];

impl Config {
    fn from_file_config(fc: &FileConfig) -> anyhow::Result<Config> {
        let mut cfg = Config {
            endpoints: vec![],
            strategy: fc
                .strategy
                .clone()
                .unwrap_or_else(|| "sequential".into())
                .trim()
                .to_ascii_lowercase(),
            reconnect_interval: Duration::from_millis(
                fc.reconnect_interval_ms.unwrap_or(60_000).max(0) as u64,
            ),
            max_errors: fc.max_errors.unwrap_or(20).max(1) as usize,
            poll_interval: Duration::from_millis(fc.poll_interval_ms.unwrap_or(1000).max(0) as u64),
            dial_timeout: Duration::from_millis(fc.dial_timeout_ms.unwrap_or(30_000).max(0) as u64),
            logging: LoggingConfig {
                level: "info".into(),
                format: "json".into(),
                output: "stderr".into(),
                add_source: false,
            },
            tunnel: TunnelConfig {
                resend_threshold: fc
                    .tunnel
                    .as_ref()
                    .and_then(|t| t.resend_threshold)
                    .unwrap_or(3)
                    .max(1) as usize,
                grace_close: Duration::from_millis(
                    fc.tunnel
                        .as_ref()
                        .and_then(|t| t.grace_close_ms)
                        .unwrap_or(200)
                        .max(0) as u64,
                ),
                chunk_size: fc
                    .tunnel
                    .as_ref()
                    .and_then(|t| t.chunk_size)
                    .unwrap_or(32 * 1024)
                    .max(1024) as usize,
            },
            comm: CommConfig::default(),
            mtls: MtlsConfig::default(),
        };

        match cfg.strategy.as_str() {
            "sequential" | "random" | "random-within-scheme" => {}
            other => anyhow::bail!("config: unknown strategy {:?}", other),
        }

        for (i, uri) in fc.endpoints.iter().enumerate() {
            let uri = uri.trim();
            if uri.is_empty() {
                continue;
            }
            let scheme = uri
                .split_once("://")
                .map(|(s, _)| s.to_ascii_lowercase())
                .with_context(|| format!("config: endpoints[{}] missing scheme: {}", i, uri))?;
            if !KNOWN_SCHEMES.contains(&scheme.as_str()) {
                anyhow::bail!("config: endpoints[{}] unknown scheme {:?}", i, scheme);
            }
            cfg.endpoints.push(uri.to_string());
        }
        if cfg.endpoints.is_empty() {
            anyhow::bail!("config: no endpoints configured");
        }

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

        if let Some(c) = &fc.comm {
            cfg.comm.private_key = c.private_key.clone().unwrap_or_default().trim().to_string();
            cfg.comm.remote_fingerprint = c
                .remote_fingerprint
                .clone()
                .unwrap_or_default()
                .trim()
                .to_string();
            cfg.comm.authorized_fingerprints = c
                .authorized_fingerprints
                .clone()
                .unwrap_or_default()
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Some(m) = &fc.mtls {
            cfg.mtls.cert_file = m.cert_file.clone().unwrap_or_default().trim().to_string();
            cfg.mtls.key_file = m.key_file.clone().unwrap_or_default().trim().to_string();
            cfg.mtls.ca_file = m.ca_file.clone().unwrap_or_default().trim().to_string();
        }

        let needs_mtls = cfg.endpoints.iter().any(|u| u.starts_with("mtls://"));
        if needs_mtls
            && (cfg.mtls.cert_file.is_empty()
                || cfg.mtls.key_file.is_empty()
                || cfg.mtls.ca_file.is_empty())
        {
            anyhow::bail!("config: mtls endpoints require mtls.cert_file, key_file and ca_file");
        }

        Ok(cfg)
    }
}

#[cfg(test)]
impl Config {
    pub fn test_default() -> Self {
        Config {
            endpoints: vec![],
            strategy: "sequential".into(),
            reconnect_interval: Duration::from_millis(10),
            max_errors: 3,
            poll_interval: Duration::from_millis(20),
            dial_timeout: Duration::from_secs(5),
            logging: LoggingConfig {
                level: "info".into(),
                format: "json".into(),
                output: "discard".into(),
                add_source: false,
            },
            tunnel: TunnelConfig {
                resend_threshold: 3,
                grace_close: Duration::from_millis(200),
                chunk_size: 32 * 1024,
            },
            comm: CommConfig::default(),
            mtls: MtlsConfig::default(),
        }
    }
}
