use crate::config::AetherPaths;
use crate::database::models::NodeRecord;
use crate::database::repositories::{NodeRepository, SettingsRepository, SqliteRepositories};
use crate::database::Database;
use crate::error::SyncError;
use crate::fingerprint::sha256_hex;
use crate::utils::{now_unix, LOCAL_IP_MARKER};
use anyhow::{Context, Result};
use rand::Rng;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

pub const SETTING_NODE_ID: &str = "node_id";
pub const SETTING_LISTENING_PORT: &str = "listening_port";
pub const SETTING_UPDATE_AVAILABLE: &str = "update_available";
pub const SETTING_ONBOARDING_COMPLETE: &str = "onboarding_complete";

/// Who this node is on the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub node_id: String,
    pub listening_port: u16,
}

#[derive(Debug, Clone)]
pub struct IdentitySummary {
    pub identity: LocalIdentity,
    pub node_created: bool,
    pub certificate_created: bool,
}

/// Loads or creates the node id, listening port, local node row and TLS
/// material. `port_override` replaces the persisted port for this run and
/// is persisted too.
pub fn ensure_local_identity(
    paths: &AetherPaths,
    database: &Database,
    port_override: Option<u16>,
) -> Result<IdentitySummary> {
    let (identity, node_created) =
        database.with_repositories(|repos| ensure_settings(&repos, port_override))?;
    database.with_repositories(|repos| ensure_local_node(&repos, &identity))?;
    let certificate_created = ensure_tls_material(paths)?;

    Ok(IdentitySummary {
        identity,
        node_created,
        certificate_created,
    })
}

fn ensure_settings(
    repos: &SqliteRepositories<'_>,
    port_override: Option<u16>,
) -> Result<(LocalIdentity, bool)> {
    let settings = repos.settings();
    let (node_id, node_created) = match settings.get(SETTING_NODE_ID)? {
        Some(existing) => {
            if existing.trim().is_empty() {
                return Err(SyncError::InvalidSetting {
                    key: SETTING_NODE_ID.into(),
                    value: existing,
                }
                .into());
            }
            (existing, false)
        }
        None => {
            let node_id = generate_node_id();
            settings.set(SETTING_NODE_ID, &node_id)?;
            (node_id, true)
        }
    };

    let persisted = match settings.get(SETTING_LISTENING_PORT)? {
        Some(raw) => Some(raw.parse::<u16>().map_err(|_| SyncError::InvalidSetting {
            key: SETTING_LISTENING_PORT.into(),
            value: raw.clone(),
        })?),
        None => None,
    };
    let listening_port = match (port_override, persisted) {
        (Some(port), _) => port,
        (None, Some(port)) => port,
        (None, None) => free_port()?,
    };
    if persisted != Some(listening_port) {
        settings.set(SETTING_LISTENING_PORT, &listening_port.to_string())?;
    }

    for flag in [SETTING_UPDATE_AVAILABLE, SETTING_ONBOARDING_COMPLETE] {
        match settings.get(flag)? {
            Some(raw) => {
                parse_flag(&raw).ok_or_else(|| SyncError::InvalidSetting {
                    key: flag.into(),
                    value: raw.clone(),
                })?;
            }
            None => settings.set(flag, "false")?,
        }
    }

    Ok((
        LocalIdentity {
            node_id,
            listening_port,
        },
        node_created,
    ))
}

pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

/// Keeps the `LOCAL` row in step with the current identity.
fn ensure_local_node(repos: &SqliteRepositories<'_>, identity: &LocalIdentity) -> Result<()> {
    let nodes = repos.nodes();
    match nodes.get_local()? {
        Some(mut local) => {
            if local.node_id != identity.node_id
                || local.last_connected_port != Some(identity.listening_port)
            {
                local.node_id = identity.node_id.clone();
                local.last_connected_port = Some(identity.listening_port);
                nodes.update(&local)?;
            }
        }
        None => {
            let mut local = NodeRecord::new(identity.node_id.clone());
            local.last_connected_ip = Some(LOCAL_IP_MARKER.to_string());
            local.last_connected_port = Some(identity.listening_port);
            local.last_connected_date = Some(now_unix());
            nodes.insert(&local)?;
        }
    }
    Ok(())
}

fn generate_node_id() -> String {
    let seed: [u8; 32] = rand::rng().random();
    sha256_hex(&seed)
}

fn free_port() -> Result<u16> {
    let listener =
        std::net::TcpListener::bind(("0.0.0.0", 0)).context("failed to find a free port")?;
    Ok(listener.local_addr()?.port())
}

/// Generates a self-signed certificate on first run. Returns whether new
/// material was written.
pub fn ensure_tls_material(paths: &AetherPaths) -> Result<bool> {
    if paths.cert_path.exists() && paths.key_path.exists() {
        return Ok(false);
    }
    fs::create_dir_all(&paths.profile_dir)?;
    tighten_permissions(&paths.profile_dir)?;

    let certified = rcgen::generate_simple_self_signed(vec![crate::network::tls::SERVER_NAME.to_string()])
        .context("failed to generate TLS certificate")?;
    fs::write(&paths.cert_path, certified.cert.pem())
        .with_context(|| format!("failed to write {}", paths.cert_path.display()))?;
    fs::write(&paths.key_path, certified.key_pair.serialize_pem())
        .with_context(|| format!("failed to write {}", paths.key_path.display()))?;
    tighten_permissions(&paths.key_path)?;
    tracing::info!(cert = %paths.cert_path.display(), "generated TLS certificate");
    Ok(true)
}

fn tighten_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let perms = if path.is_dir() {
            fs::Permissions::from_mode(0o700)
        } else {
            fs::Permissions::from_mode(0o600)
        };
        if let Err(err) = fs::set_permissions(path, perms) {
            tracing::warn!(path = %path.display(), error = ?err, "failed to tighten permissions");
        }
    }
    Ok(())
}
