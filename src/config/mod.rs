/// Database connection and universal table creation
pub mod database;

/// Application settings loaded from config.toml
pub mod settings;
