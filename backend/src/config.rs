use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub retention_database_url: Option<String>,
    pub retention_statuses: Vec<String>,
    pub retention_cutoff_days: i64,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/consentkeeper".to_string());

        let retention_database_url = env::var("RETENTION_DATABASE_URL").ok();

        let retention_statuses = env::var("RETENTION_STATUSES")
            .map(|value| parse_statuses(&value))
            .unwrap_or_else(|_| vec!["Revoked".to_string(), "Expired".to_string()]);

        let retention_cutoff_days = env::var("RETENTION_CUTOFF_DAYS")
            .unwrap_or_else(|_| "365".to_string())
            .parse()
            .unwrap_or(365);

        Ok(Config {
            database_url,
            retention_database_url,
            retention_statuses,
            retention_cutoff_days,
        })
    }
}

fn parse_statuses(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|status| !status.is_empty())
        .map(str::to_string)
        .collect()
}
