use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub settlement: SettlementSettings,
    /// PostgreSQL connection URL; absent runs the in-memory store
    #[serde(default)]
    pub postgres_url: Option<String>,
}

/// Scheduler sweep settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SchedulerSettings {
    pub sweep_interval_secs: u64,
    pub batch_size: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            batch_size: 100,
        }
    }
}

/// Bid settlement settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SettlementSettings {
    /// Internal retries when a bid commit loses the write race
    pub max_commit_retries: u32,
}

impl Default for SettlementSettings {
    fn default() -> Self {
        Self {
            max_commit_retries: 3,
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> Self {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .unwrap_or_else(|_| panic!("Failed to read config file: {}", config_path));
        serde_yaml::from_str(&content).expect("Failed to parse config yaml")
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "./logs".to_string(),
            log_file: "gavel.log".to_string(),
            use_json: false,
            rotation: "daily".to_string(),
            scheduler: SchedulerSettings::default(),
            settlement: SettlementSettings::default(),
            postgres_url: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.scheduler.sweep_interval_secs, 60);
        assert_eq!(config.settlement.max_commit_retries, 3);
        assert!(config.postgres_url.is_none());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
log_level: "debug"
log_dir: "./logs"
log_file: "gavel.log"
use_json: true
rotation: "hourly"
scheduler:
  sweep_interval_secs: 15
  batch_size: 50
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.scheduler.sweep_interval_secs, 15);
        // Omitted sections fall back to defaults
        assert_eq!(config.settlement.max_commit_retries, 3);
    }
}
