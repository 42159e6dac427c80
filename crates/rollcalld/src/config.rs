use rollcall_core::{DistanceMetric, StaffId};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP and WebSocket bind address.
    pub listen_addr: SocketAddr,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Use the in-process store instead of SQLite. Development only.
    pub memory_store: bool,
    /// Base URL of the recognition engine.
    pub engine_url: String,
    /// Deadline for each engine load, unload or health call.
    pub engine_timeout: Duration,
    /// Minimum confidence for a face to count as a camper.
    pub match_threshold: f32,
    pub distance_metric: DistanceMetric,
    /// Staff id recorded on attendance logs written by the pipeline.
    pub staff_id: StaffId,
    pub idempotency_retention: Duration,
    pub sweep_interval: Duration,
}

/// Optional TOML file; every key may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    listen_addr: Option<SocketAddr>,
    db_path: Option<PathBuf>,
    memory_store: Option<bool>,
    engine_url: Option<String>,
    engine_timeout_secs: Option<u64>,
    match_threshold: Option<f32>,
    distance_metric: Option<String>,
    staff_id: Option<i64>,
    idempotency_retention_hours: Option<u64>,
    sweep_interval_secs: Option<u64>,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with
    /// defaults, layered over the TOML file named by `ROLLCALL_CONFIG`.
    pub fn from_env() -> anyhow::Result<Self> {
        let file = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => FileConfig::read(Path::new(&path))?,
            Err(_) => FileConfig::default(),
        };
        Self::resolve(file)
    }

    fn resolve(file: FileConfig) -> anyhow::Result<Self> {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let metric = env_string("ROLLCALL_DISTANCE_METRIC")
            .or(file.distance_metric)
            .unwrap_or_else(|| "cosine".to_string());
        let distance_metric = metric
            .parse::<DistanceMetric>()
            .map_err(|e| anyhow::anyhow!("ROLLCALL_DISTANCE_METRIC: {e}"))?;

        let match_threshold = env_parse("ROLLCALL_MATCH_THRESHOLD")
            .or(file.match_threshold)
            .unwrap_or(0.60);
        if !(0.0..=1.0).contains(&match_threshold) {
            anyhow::bail!("match threshold {match_threshold} is outside [0, 1]");
        }

        Ok(Self {
            listen_addr: env_parse("ROLLCALL_LISTEN_ADDR")
                .or(file.listen_addr)
                .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8087))),
            db_path: env_string("ROLLCALL_DB_PATH")
                .map(PathBuf::from)
                .or(file.db_path)
                .unwrap_or_else(|| data_dir.join("attendance.db")),
            memory_store: std::env::var("ROLLCALL_MEMORY_STORE")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .ok()
                .or(file.memory_store)
                .unwrap_or(false),
            engine_url: env_string("ROLLCALL_ENGINE_URL")
                .or(file.engine_url)
                .unwrap_or_else(|| "http://127.0.0.1:8000".to_string()),
            engine_timeout: Duration::from_secs(
                env_parse("ROLLCALL_ENGINE_TIMEOUT_SECS")
                    .or(file.engine_timeout_secs)
                    .unwrap_or(30),
            ),
            match_threshold,
            distance_metric,
            staff_id: StaffId(env_parse("ROLLCALL_STAFF_ID").or(file.staff_id).unwrap_or(0)),
            idempotency_retention: Duration::from_secs(
                env_parse::<u64>("ROLLCALL_IDEMPOTENCY_RETENTION_HOURS")
                    .or(file.idempotency_retention_hours)
                    .unwrap_or(48)
                    * 3600,
            ),
            sweep_interval: Duration::from_secs(
                env_parse("ROLLCALL_SWEEP_INTERVAL_SECS")
                    .or(file.sweep_interval_secs)
                    .unwrap_or(600)
                    .max(1),
            ),
        })
    }
}

impl FileConfig {
    fn read(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
        Self::parse(&text).map_err(|e| anyhow::anyhow!("parsing {}: {e}", path.display()))
    }

    fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env_string(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable setting");
            None
        }
    }
}
