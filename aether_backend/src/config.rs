use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

pub const DEFAULT_SEED: &str = "151.236.11.192:39994";
pub const DEFAULT_UPDATE_URL: &str = "http://192.30.33.227";
pub const USER_PROFILE_FILE: &str = "UserProfile.json";

#[derive(Debug, Clone)]
pub struct AetherConfig {
    pub paths: AetherPaths,
    pub sync: SyncConfig,
    pub commit: CommitConfig,
    pub update: UpdateConfig,
    /// Overrides the persisted listening port when set.
    pub listen_port: Option<u16>,
}

impl AetherConfig {
    pub fn from_env() -> Result<Self> {
        let paths = match env::var("AETHER_HOME") {
            Ok(raw) if !raw.trim().is_empty() => AetherPaths::from_base_dir(raw)?,
            _ => AetherPaths::discover()?,
        };
        let listen_port = env::var("AETHER_LISTEN_PORT")
            .ok()
            .and_then(|raw| raw.parse().ok());
        Ok(Self {
            paths,
            sync: SyncConfig::from_env(),
            commit: CommitConfig::from_env(),
            update: UpdateConfig::from_env(),
            listen_port,
        })
    }

    pub fn new(paths: AetherPaths) -> Self {
        Self {
            paths,
            sync: SyncConfig::default(),
            commit: CommitConfig::default(),
            update: UpdateConfig::default(),
            listen_port: None,
        }
    }
}

/// Timing, batching and bootstrap knobs for the peer protocol.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub header_packet_size: usize,
    pub node_packet_size: usize,
    pub max_frame_bytes: usize,
    pub overseer_tick: Duration,
    /// Any connection idle this long is aborted.
    pub idle_abort: Duration,
    /// Connections idle this long are force-advanced or, before the
    /// handshake completes, aborted.
    pub stall_timeout: Duration,
    pub connect_timeout: Duration,
    pub connect_interval: Duration,
    /// Window used for header requests that carry no sync timestamp.
    pub header_window_secs: i64,
    /// Upper bound on node directory age for timestamped requests.
    pub node_window_secs: i64,
    pub seeds: Vec<SocketAddr>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            header_packet_size: 10,
            node_packet_size: 10,
            max_frame_bytes: 1024 * 1024,
            overseer_tick: Duration::from_secs(5),
            idle_abort: Duration::from_secs(30),
            stall_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            connect_interval: Duration::from_secs(60),
            header_window_secs: 26 * 7 * 24 * 60 * 60,
            node_window_secs: 10 * 24 * 60 * 60,
            seeds: parse_seeds(DEFAULT_SEED),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(size) = env::var("AETHER_PACKET_SIZE")
            .ok()
            .and_then(|raw| raw.parse::<usize>().ok())
            .filter(|size| *size > 0)
        {
            config.header_packet_size = size;
            config.node_packet_size = size;
        }
        config.max_frame_bytes = env::var("AETHER_MAX_FRAME_BYTES")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(config.max_frame_bytes);
        config.connect_interval = env::var("AETHER_CONNECT_INTERVAL_SECS")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(config.connect_interval);
        if let Ok(raw) = env::var("AETHER_SEEDS") {
            config.seeds = parse_seeds(&raw);
        }
        config
    }
}

fn parse_seeds(raw: &str) -> Vec<SocketAddr> {
    raw.split(',')
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .filter_map(|part| match part.parse::<SocketAddr>() {
            Ok(addr) => Some(addr),
            Err(err) => {
                tracing::warn!(seed = part, error = %err, "ignoring malformed seed address");
                None
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct CommitConfig {
    pub interval: Duration,
    pub busy_retries: u32,
    pub busy_backoff: Duration,
    pub neutral_threshold: i64,
    pub max_ancestor_depth: usize,
    pub ranking: RankingConfig,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            busy_retries: 5,
            busy_backoff: Duration::from_millis(200),
            neutral_threshold: 10,
            max_ancestor_depth: 256,
            ranking: RankingConfig::default(),
        }
    }
}

impl CommitConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let interval = env::var("AETHER_COMMIT_INTERVAL_SECS")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.interval);
        Self {
            interval,
            ranking: RankingConfig::from_env(),
            ..defaults
        }
    }
}

/// Constants of the hot-ranking formula. Nodes that want comparable sort
/// orders must agree on both values.
#[derive(Debug, Clone, Copy)]
pub struct RankingConfig {
    pub epoch_anchor: i64,
    pub decay_divisor: f64,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            epoch_anchor: 1_352_092_272,
            decay_divisor: 65_535.0,
        }
    }
}

impl RankingConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let epoch_anchor = env::var("AETHER_RANK_EPOCH")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(defaults.epoch_anchor);
        let decay_divisor = env::var("AETHER_RANK_DIVISOR")
            .ok()
            .and_then(|raw| raw.parse::<f64>().ok())
            .filter(|divisor| *divisor > 0.0)
            .unwrap_or(defaults.decay_divisor);
        Self {
            epoch_anchor,
            decay_divisor,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpdateConfig {
    pub enabled: bool,
    pub url: String,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: DEFAULT_UPDATE_URL.to_string(),
        }
    }
}

impl UpdateConfig {
    pub fn from_env() -> Self {
        let url = env::var("AETHER_UPDATE_URL")
            .ok()
            .filter(|raw| !raw.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_UPDATE_URL.to_string());
        let enabled = env::var("AETHER_DISABLE_UPDATE_CHECK")
            .ok()
            .map(|v| v != "1" && v.to_lowercase() != "true")
            .unwrap_or(true);
        Self { enabled, url }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AetherPaths {
    pub base: PathBuf,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub profile_dir: PathBuf,
    pub user_profile_path: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub logs_dir: PathBuf,
}

impl AetherPaths {
    pub fn discover() -> Result<Self> {
        let exe_path = std::env::current_exe()
            .map_err(|err| anyhow!("failed to resolve current executable: {err}"))?;
        let base = exe_path
            .parent()
            .ok_or_else(|| anyhow!("executable path missing parent"))?
            .to_path_buf();
        Self::from_base_dir(base)
    }

    pub fn from_base_dir<P: AsRef<Path>>(base: P) -> Result<Self> {
        let base = base.as_ref().to_path_buf();
        let data_dir = base.join("Database");
        let db_path = data_dir.join("aether.db");
        let profile_dir = base.join("UserProfile");
        let user_profile_path = profile_dir.join(USER_PROFILE_FILE);
        let cert_path = profile_dir.join("cert.pem");
        let key_path = profile_dir.join("priv.pem");
        let logs_dir = base.join("logs");

        Ok(Self {
            base,
            data_dir,
            db_path,
            profile_dir,
            user_profile_path,
            cert_path,
            key_path,
            logs_dir,
        })
    }
}

/// The user-editable profile document shared with the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(rename = "selectedTopics", default)]
    pub selected_topics: Vec<String>,
    #[serde(rename = "UserDetails", default)]
    pub details: UserDetails,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserDetails {
    #[serde(rename = "UserLanguages", default = "default_languages")]
    pub languages: Vec<String>,
    #[serde(rename = "maxOutboundCount", default = "default_outbound")]
    pub max_outbound_count: usize,
    #[serde(rename = "maxInboundCount", default = "default_inbound")]
    pub max_inbound_count: usize,
    /// Minutes before a directly connected peer may be dialed again.
    #[serde(rename = "cooldown", default = "default_cooldown")]
    pub cooldown_minutes: i64,
}

impl Default for UserDetails {
    fn default() -> Self {
        Self {
            languages: default_languages(),
            max_outbound_count: default_outbound(),
            max_inbound_count: default_inbound(),
            cooldown_minutes: default_cooldown(),
        }
    }
}

impl Default for UserProfile {
    fn default() -> Self {
        Self {
            selected_topics: Vec::new(),
            details: UserDetails::default(),
        }
    }
}

fn default_languages() -> Vec<String> {
    [
        "English",
        "Turkish",
        "Spanish",
        "French",
        "German",
        "Portuguese",
        "Russian",
        "Chinese",
        "Chineset",
    ]
    .iter()
    .map(|lang| lang.to_string())
    .collect()
}

fn default_outbound() -> usize {
    10
}

fn default_inbound() -> usize {
    3
}

fn default_cooldown() -> i64 {
    5
}

impl UserProfile {
    /// Loads the profile, writing defaults when the file is missing or empty.
    /// Malformed JSON is an error; the node refuses to start on it.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            if !raw.trim().is_empty() {
                return Self::from_json(&raw)
                    .with_context(|| format!("malformed user profile at {}", path.display()));
            }
        }
        let profile = Self::default();
        profile.save(path)?;
        Ok(profile)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

/// Profile handle shared by the forum service and the network layer, so a
/// profile write is seen by the next connection round.
#[derive(Debug, Clone)]
pub struct SharedProfile {
    path: PathBuf,
    inner: Arc<RwLock<UserProfile>>,
}

impl SharedProfile {
    pub fn new(path: PathBuf, profile: UserProfile) -> Self {
        Self {
            path,
            inner: Arc::new(RwLock::new(profile)),
        }
    }

    pub fn snapshot(&self) -> UserProfile {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn raw_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.snapshot())?)
    }

    /// Persists a new profile document and refreshes the in-memory copy.
    pub fn replace_from_json(&self, raw: &str) -> Result<UserProfile> {
        let profile = UserProfile::from_json(raw).context("malformed user profile")?;
        profile.save(&self.path)?;
        let mut guard = self
            .inner
            .write()
            .map_err(|_| anyhow!("user profile lock poisoned"))?;
        *guard = profile.clone();
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn profile_is_created_with_defaults() {
        let temp = tempdir().expect("tempdir");
        let paths = AetherPaths::from_base_dir(temp.path()).expect("paths");
        let profile = UserProfile::load_or_create(&paths.user_profile_path).expect("profile");
        assert_eq!(profile.details.max_inbound_count, 3);
        assert_eq!(profile.details.languages.len(), 9);
        assert!(paths.user_profile_path.exists());
    }

    #[test]
    fn malformed_profile_is_rejected() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join(USER_PROFILE_FILE);
        fs::write(&path, "{ not json").expect("write");
        assert!(UserProfile::load_or_create(&path).is_err());
    }

    #[test]
    fn profile_reads_camel_case_field_names() {
        let raw = r#"{
            "selectedTopics": ["abc"],
            "UserDetails": {
                "UserLanguages": ["English"],
                "maxOutboundCount": 4,
                "maxInboundCount": 2,
                "cooldown": 1
            }
        }"#;
        let profile = UserProfile::from_json(raw).expect("parse");
        assert_eq!(profile.selected_topics, vec!["abc".to_string()]);
        assert_eq!(profile.details.max_outbound_count, 4);
        assert_eq!(profile.details.cooldown_minutes, 1);
    }

    #[test]
    fn shared_profile_replace_persists() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join(USER_PROFILE_FILE);
        let shared = SharedProfile::new(path.clone(), UserProfile::default());
        shared
            .replace_from_json(r#"{"selectedTopics":["t1"]}"#)
            .expect("replace");
        assert_eq!(shared.snapshot().selected_topics, vec!["t1".to_string()]);
        let reloaded = UserProfile::load_or_create(&path).expect("reload");
        assert_eq!(reloaded.details.max_outbound_count, 10);
        assert_eq!(reloaded.selected_topics, vec!["t1".to_string()]);
    }
}
