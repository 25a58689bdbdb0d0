//! Application configuration module
//!
//! Handles loading and validating configuration from environment variables.

use crate::automation::collaborators::Recipient;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;
use validator::ValidateEmail;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub max_pool_size: usize,
    /// Connect over TLS (hosted providers require it)
    pub require_tls: bool,
}

/// Automation tick configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AutomationConfig {
    /// Seconds between scheduled ticks
    pub interval: Duration,
    /// Placements fetched per scan page
    pub page_size: usize,
    /// Exact days-in-stage values that raise a reminder
    pub reminder_days: Vec<i64>,
    /// Who receives stage reminders
    pub reminder_recipients: Vec<Recipient>,
    /// Only transitions newer than this are considered for task creation
    pub task_lookback: Option<Duration>,
    /// Cooperative deadline for a single tick
    pub tick_budget: Option<Duration>,
    pub dry_run: bool,
    pub run_once: bool,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            page_size: 200,
            reminder_days: vec![7, 14, 30],
            reminder_recipients: Vec::new(),
            task_lookback: Some(Duration::from_secs(86_400)),
            tick_budget: None,
            dry_run: false,
            run_once: false,
        }
    }
}

/// Complete application settings
#[derive(Debug, Clone)]
pub struct Settings {
    /// `None` selects the in-memory backend
    pub database: Option<DatabaseConfig>,
    pub automation: AutomationConfig,
}

impl Settings {
    /// Load settings from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (ignore errors if file not found)
        let _ = dotenvy::dotenv();

        let database = if let Ok(database_url) = std::env::var("DATABASE_URL") {
            Some(Self::parse_database_url(&database_url)?)
        } else if let Ok(host) = std::env::var("DB_HOST") {
            Some(DatabaseConfig {
                host,
                port: parse_var("DB_PORT")?.unwrap_or(5432),
                user: std::env::var("DB_USER").unwrap_or_else(|_| "postgres".to_string()),
                password: std::env::var("DB_PASSWORD").unwrap_or_default(),
                database: std::env::var("DB_NAME").unwrap_or_else(|_| "postgres".to_string()),
                max_pool_size: parse_var("DB_MAX_CONNECTIONS")?.unwrap_or(10),
                require_tls: parse_bool("DB_REQUIRE_TLS")?.unwrap_or(false),
            })
        } else {
            None
        };

        let defaults = AutomationConfig::default();
        let automation = AutomationConfig {
            interval: parse_var::<u64>("AUTOMATION_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.interval),
            page_size: parse_var("AUTOMATION_PAGE_SIZE")?.unwrap_or(defaults.page_size),
            reminder_days: match std::env::var("AUTOMATION_REMINDER_DAYS") {
                Ok(raw) => parse_reminder_days(&raw)?,
                Err(_) => defaults.reminder_days,
            },
            reminder_recipients: match std::env::var("AUTOMATION_REMINDER_RECIPIENTS") {
                Ok(raw) => parse_recipients(&raw)?,
                Err(_) => defaults.reminder_recipients,
            },
            task_lookback: match parse_var::<u64>("AUTOMATION_TASK_LOOKBACK_DAYS")? {
                Some(0) => None,
                Some(days) => Some(Duration::from_secs(days * 86_400)),
                None => defaults.task_lookback,
            },
            tick_budget: parse_var::<u64>("AUTOMATION_TICK_BUDGET_SECS")?.map(Duration::from_secs),
            dry_run: parse_bool("AUTOMATION_DRY_RUN")?.unwrap_or(false),
            run_once: parse_bool("AUTOMATION_RUN_ONCE")?.unwrap_or(false),
        };

        if automation.page_size == 0 {
            return Err(ConfigError::InvalidValue(
                "AUTOMATION_PAGE_SIZE must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            database,
            automation,
        })
    }

    /// Parse a DATABASE_URL connection string (postgresql://...)
    fn parse_database_url(raw: &str) -> Result<DatabaseConfig, ConfigError> {
        let parsed = url::Url::parse(raw).map_err(|_| {
            ConfigError::InvalidValue(
                "Invalid DATABASE_URL format (expected postgresql://...)".to_string(),
            )
        })?;

        let host = parsed
            .host_str()
            .ok_or_else(|| ConfigError::InvalidValue("Missing host in DATABASE_URL".to_string()))?
            .to_string();

        let database = parsed.path().trim_start_matches('/').to_string();
        if database.is_empty() {
            return Err(ConfigError::InvalidValue(
                "Missing database name in DATABASE_URL".to_string(),
            ));
        }

        let require_tls = host.contains("neon.tech")
            || parsed
                .query_pairs()
                .any(|(k, v)| k == "sslmode" && v == "require");

        Ok(DatabaseConfig {
            port: parsed.port().unwrap_or(5432),
            user: parsed.username().to_string(),
            password: parsed.password().map(|p| p.to_string()).unwrap_or_default(),
            database,
            max_pool_size: parse_var("DB_MAX_CONNECTIONS")?.unwrap_or(10),
            require_tls,
            host,
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(format!("{}='{}'", name, raw))),
        Err(_) => Ok(None),
    }
}

fn parse_bool(name: &str) -> Result<Option<bool>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" | "" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue(format!("{}='{}'", name, raw))),
        },
        Err(_) => Ok(None),
    }
}

/// Parse a comma separated list of positive day counts ("7,14,30")
fn parse_reminder_days(raw: &str) -> Result<Vec<i64>, ConfigError> {
    let mut days = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let value: i64 = part.parse().map_err(|_| {
            ConfigError::InvalidValue(format!("AUTOMATION_REMINDER_DAYS entry '{}'", part))
        })?;
        if value <= 0 {
            return Err(ConfigError::InvalidValue(format!(
                "AUTOMATION_REMINDER_DAYS entry '{}' must be positive",
                part
            )));
        }
        days.push(value);
    }
    days.sort_unstable();
    days.dedup();
    Ok(days)
}

/// Parse a comma separated recipient list ("Office Admin <admin@example.org>, ops@example.org")
///
/// Ids are derived from the address so they stay stable across restarts.
fn parse_recipients(raw: &str) -> Result<Vec<Recipient>, ConfigError> {
    let mut recipients: Vec<Recipient> = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, email) = match part.split_once('<') {
            Some((name, rest)) => {
                let email = rest.strip_suffix('>').ok_or_else(|| {
                    ConfigError::InvalidValue(format!("AUTOMATION_REMINDER_RECIPIENTS entry '{}'", part))
                })?;
                (name.trim(), email.trim())
            }
            None => ("", part),
        };
        if !email.validate_email() {
            return Err(ConfigError::InvalidValue(format!(
                "AUTOMATION_REMINDER_RECIPIENTS entry '{}' is not an email address",
                part
            )));
        }
        let email = email.to_ascii_lowercase();
        if recipients.iter().any(|r| r.email.as_deref() == Some(email.as_str())) {
            continue;
        }
        recipients.push(Recipient {
            id: Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("mailto:{}", email).as_bytes()),
            name: if name.is_empty() { email.clone() } else { name.to_string() },
            email: Some(email),
        });
    }
    Ok(recipients)
}
