#![allow(clippy::result_large_err)]

//! Admin entry point: ensures the universal tables exist and scans the
//! organizations named on the command line for recurring duplicates.

use dotenvy::dotenv;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use universal_schema::{
    config::{database, settings},
    core::duplicates::monitor_duplicate_patterns,
    errors::{Error, Result},
};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Initialize tracing (as early as possible)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // 2. Load .env file; env vars can also be set externally
    dotenv().ok();

    // 3. Load config.toml, falling back to defaults
    let settings = settings::load_default_settings()
        .inspect_err(|e| error!("Failed to load configuration: {}", e))?;

    // 4. Connect and make sure the tables exist
    let db = database::create_connection(&settings.database_url())
        .await
        .inspect_err(|e| error!("Failed to connect to database: {}", e))?;
    database::create_tables(&db)
        .await
        .inspect(|_| info!("Database initialized successfully."))?;

    // 5. Scan each organization
    let organizations: Vec<String> = std::env::args().skip(1).collect();
    if organizations.is_empty() {
        return Err(Error::Config {
            message: "usage: universal-schema <organization_id>...".to_string(),
        });
    }

    for organization_id in &organizations {
        let patterns = monitor_duplicate_patterns(&db, organization_id).await?;
        if patterns.is_empty() {
            info!("{}: no duplicate patterns", organization_id);
        }
        for pattern in &patterns {
            warn!(
                "{}: {:?} {:?} {} '{}' x{} -> {:?}",
                organization_id,
                pattern.severity,
                pattern.pattern_type,
                pattern.entity_type.as_deref().unwrap_or("-"),
                pattern.key,
                pattern.occurrences,
                pattern.affected_ids
            );
        }
    }

    Ok(())
}
