use crate::config::{AetherConfig, SharedProfile, UserProfile};
use crate::database::Database;
use crate::identity::{ensure_local_identity, IdentitySummary};
use anyhow::Result;
use std::fs;

pub struct BootstrapResources {
    pub directories_created: Vec<String>,
    pub database_initialized: bool,
    pub identity: IdentitySummary,
    pub database: Database,
    pub profile: SharedProfile,
}

/// Prepares on-disk state. Malformed settings or a malformed profile
/// document stop the node here.
pub async fn initialize(config: &AetherConfig) -> Result<BootstrapResources> {
    let mut directories_created = Vec::new();
    create_dir_if_missing(&config.paths.data_dir, &mut directories_created)?;
    create_dir_if_missing(&config.paths.profile_dir, &mut directories_created)?;
    create_dir_if_missing(&config.paths.logs_dir, &mut directories_created)?;

    let database = Database::connect(&config.paths)?;
    let database_initialized = database.ensure_migrations()?;

    let identity = ensure_local_identity(&config.paths, &database, config.listen_port)?;
    let profile = UserProfile::load_or_create(&config.paths.user_profile_path)?;

    Ok(BootstrapResources {
        directories_created,
        database_initialized,
        identity,
        database,
        profile: SharedProfile::new(config.paths.user_profile_path.clone(), profile),
    })
}

fn create_dir_if_missing(path: &std::path::Path, created: &mut Vec<String>) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
        created.push(path.display().to_string());
    }
    Ok(())
}
