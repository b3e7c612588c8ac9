// Configuration management with layered configuration (file, env)

use crate::errors::ScheduleError;
use crate::policy;
use chrono::NaiveTime;
use chrono_tz::Tz;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: Option<RedisConfig>,
    pub smtp: SmtpConfig,
    pub alerts: AlertsConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
    #[serde(default)]
    pub run_migrations: bool,
}

/// Redis is only used for the cross-instance sweep lease
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    pub lock_ttl_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub tls: SmtpTls,
    pub from: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_smtp_timeout")]
    pub timeout_seconds: u64,
    /// Log messages instead of sending them
    #[serde(default)]
    pub dry_run: bool,
}

fn default_smtp_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpTls {
    Starttls,
    Implicit,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    /// Cron expression (with seconds) for the reconciliation sweep
    pub sweep_cron: String,
    /// IANA zone used for both the cadence and the notion of "today"
    pub timezone: String,
    pub sweep_on_startup: bool,
    /// Upper bound on concurrent gateway calls within a sweep
    pub max_concurrency: usize,
    /// Days a dispatch record is kept after its milestone date
    pub retention_days: u32,
    /// Lease duration for an in-flight dispatch claim
    pub claim_ttl_seconds: u64,
    /// Lead-time offsets that also get an exact-time one-shot timer
    #[serde(default)]
    pub timer_offsets_days: Vec<u32>,
    /// Local time (HH:MM) at which one-shot timers fire
    pub timer_time_of_day: String,
    pub resolver_page_size: i64,
}

impl AlertsConfig {
    pub fn timezone(&self) -> Result<Tz, ScheduleError> {
        Tz::from_str(&self.timezone).map_err(|_| ScheduleError::InvalidTimezone(self.timezone.clone()))
    }

    pub fn timer_time(&self) -> Result<NaiveTime, ScheduleError> {
        NaiveTime::parse_from_str(&self.timer_time_of_day, "%H:%M")
            .map_err(|_| ScheduleError::InvalidTimeOfDay(self.timer_time_of_day.clone()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    #[serde(default)]
    pub metrics_port: Option<u16>,
    #[serde(default)]
    pub tracing_endpoint: Option<String>,
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.database.url.is_empty() {
            return Err("Database URL cannot be empty".to_string());
        }
        if self.database.max_connections == 0 {
            return Err("Database max_connections must be greater than 0".to_string());
        }
        if self.database.min_connections > self.database.max_connections {
            return Err("Database min_connections cannot exceed max_connections".to_string());
        }

        if let Some(redis) = &self.redis {
            if redis.url.is_empty() {
                return Err("Redis URL cannot be empty".to_string());
            }
            if redis.lock_ttl_seconds == 0 {
                return Err("Redis lock_ttl_seconds must be greater than 0".to_string());
            }
        }

        if !self.smtp.dry_run {
            if self.smtp.host.is_empty() {
                return Err("SMTP host cannot be empty".to_string());
            }
            if self.smtp.port == 0 {
                return Err("SMTP port must be greater than 0".to_string());
            }
        }
        if self.smtp.from.is_empty() {
            return Err("SMTP from address cannot be empty".to_string());
        }

        crate::scheduler::cadence::parse_cron_expression(&self.alerts.sweep_cron)
            .map_err(|e| e.to_string())?;
        self.alerts.timezone().map_err(|e| e.to_string())?;
        self.alerts.timer_time().map_err(|e| e.to_string())?;

        if self.alerts.max_concurrency == 0 {
            return Err("Alerts max_concurrency must be greater than 0".to_string());
        }
        if self.alerts.claim_ttl_seconds == 0 {
            return Err("Alerts claim_ttl_seconds must be greater than 0".to_string());
        }
        if self.alerts.resolver_page_size <= 0 {
            return Err("Alerts resolver_page_size must be greater than 0".to_string());
        }
        if let Some(offset) = self
            .alerts
            .timer_offsets_days
            .iter()
            .find(|offset| !policy::is_lead_time(**offset))
        {
            return Err(format!(
                "Timer offset {} is not one of the lead times {:?}",
                offset,
                policy::LEAD_TIMES_DAYS
            ));
        }

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgresql://localhost/vestibular_alerts".to_string(),
                max_connections: 10,
                min_connections: 2,
                connect_timeout_seconds: 30,
                run_migrations: false,
            },
            redis: None,
            smtp: SmtpConfig {
                host: "smtp.gmail.com".to_string(),
                port: 587,
                tls: SmtpTls::Starttls,
                from: "alerts@localhost".to_string(),
                username: None,
                password: None,
                timeout_seconds: 30,
                dry_run: true,
            },
            alerts: AlertsConfig {
                sweep_cron: "0 0 0 * * *".to_string(),
                timezone: "UTC".to_string(),
                sweep_on_startup: true,
                max_concurrency: 8,
                retention_days: 1,
                claim_ttl_seconds: 300,
                timer_offsets_days: vec![1],
                timer_time_of_day: "09:00".to_string(),
                resolver_page_size: 500,
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                metrics_port: None,
                tracing_endpoint: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_catches_empty_database_url() {
        let mut settings = Settings::default();
        settings.database.url = String::new();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_bad_cron() {
        let mut settings = Settings::default();
        settings.alerts.sweep_cron = "every day".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_unknown_timezone() {
        let mut settings = Settings::default();
        settings.alerts.timezone = "Mars/Olympus".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_timer_offset_outside_policy() {
        let mut settings = Settings::default();
        settings.alerts.timer_offsets_days = vec![1, 4];
        let err = settings.validate().unwrap_err();
        assert!(err.contains("Timer offset 4"));
    }

    #[test]
    fn test_validation_requires_smtp_host_when_sending() {
        let mut settings = Settings::default();
        settings.smtp.dry_run = false;
        settings.smtp.host = String::new();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_timer_time_parses_hours_and_minutes() {
        let mut alerts = Settings::default().alerts;
        alerts.timer_time_of_day = "08:30".to_string();
        assert_eq!(
            alerts.timer_time().unwrap(),
            NaiveTime::from_hms_opt(8, 30, 0).unwrap()
        );
        alerts.timer_time_of_day = "8h30".to_string();
        assert!(alerts.timer_time().is_err());
    }

    #[test]
    fn test_timezone_parses_iana_name() {
        let mut alerts = Settings::default().alerts;
        alerts.timezone = "America/Sao_Paulo".to_string();
        assert_eq!(alerts.timezone().unwrap(), chrono_tz::America::Sao_Paulo);
    }
}
