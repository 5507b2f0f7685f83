//! Periodic check against the release endpoint.

use crate::config::UpdateConfig;
use crate::database::repositories::SettingsRepository;
use crate::database::Database;
use crate::identity::SETTING_UPDATE_AVAILABLE;
use crate::utils::{APP_NAME, APP_VERSION};
use anyhow::{Context, Result};
use std::time::Duration;

pub fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(format!("{APP_NAME}/{APP_VERSION}"))
        .timeout(Duration::from_secs(30))
        .build()
        .context("failed to build update HTTP client")
}

/// The endpoint answers with a bare version number; only its first three
/// characters are significant.
pub fn parse_version(body: &str) -> Option<u32> {
    let head: String = body.trim().chars().take(3).collect();
    head.parse().ok()
}

/// Stores whether `latest` is newer than this build. Returns the flag.
pub fn record_latest_version(database: &Database, latest: u32) -> Result<bool> {
    let available = latest > APP_VERSION;
    database.with_repositories(|repos| {
        repos
            .settings()
            .set(SETTING_UPDATE_AVAILABLE, if available { "true" } else { "false" })
    })?;
    Ok(available)
}

pub async fn check_for_update(
    client: &reqwest::Client,
    config: &UpdateConfig,
    database: &Database,
) -> Result<bool> {
    let body = client
        .get(&config.url)
        .send()
        .await
        .with_context(|| format!("update check against {} failed", config.url))?
        .error_for_status()?
        .text()
        .await?;
    let Some(latest) = parse_version(&body) else {
        tracing::debug!(body = %body.chars().take(16).collect::<String>(), "unparsable update response");
        return Ok(false);
    };
    let available = record_latest_version(database, latest)?;
    if available {
        tracing::info!(latest, current = APP_VERSION, "a newer version is available");
    }
    Ok(available)
}
