//! Settings database operations

use crate::db::Database;
use crate::error::{Error, Result};
use crate::media::VariantPolicy;
use crate::types::Settings;
use rusqlite::{params, OptionalExtension};

/// Keys accepted by [`SettingsDb::set`]
pub const SETTING_KEYS: &[&str] = &[
    "storage_path",
    "variant_policy",
    "prefer_hd",
    "resume_on_launch",
    "monitor_poll_interval_ms",
    "monitor_debounce_ms",
    "user_agent",
];

/// Settings database operations
pub struct SettingsDb;

impl SettingsDb {
    /// Load all settings from database
    pub fn load(db: &Database) -> Result<Settings> {
        let mut settings = Settings::default();

        db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;

            for row in rows {
                let (key, value) = row?;
                apply(&mut settings, &key, value);
            }

            Ok(())
        })?;

        Ok(settings)
    }

    /// Save a single setting
    pub fn set(db: &Database, key: &str, value: &str) -> Result<()> {
        if !SETTING_KEYS.contains(&key) {
            return Err(Error::InvalidInput(format!("unknown setting: {}", key)));
        }
        db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO settings (key, value, updated_at) VALUES (?1, ?2, CURRENT_TIMESTAMP)",
                params![key, value],
            )?;
            Ok(())
        })
    }

    /// Save all settings
    pub fn save(db: &Database, settings: &Settings) -> Result<()> {
        Self::set(db, "storage_path", &settings.storage_path)?;
        Self::set(db, "variant_policy", &settings.variant_policy.to_string())?;
        Self::set(db, "prefer_hd", bool_str(settings.prefer_hd))?;
        Self::set(db, "resume_on_launch", bool_str(settings.resume_on_launch))?;
        Self::set(db, "monitor_poll_interval_ms", &settings.monitor_poll_interval_ms.to_string())?;
        Self::set(db, "monitor_debounce_ms", &settings.monitor_debounce_ms.to_string())?;
        Self::set(db, "user_agent", &settings.user_agent)?;
        Ok(())
    }

    /// Get a single setting value
    pub fn get(db: &Database, key: &str) -> Result<Option<String>> {
        db.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
        })
    }
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

fn apply(settings: &mut Settings, key: &str, value: String) {
    let defaults = Settings::default();
    match key {
        "storage_path" => settings.storage_path = expand_home(value),
        "variant_policy" => settings.variant_policy = VariantPolicy::from(value.as_str()),
        "prefer_hd" => settings.prefer_hd = value == "true",
        "resume_on_launch" => settings.resume_on_launch = value == "true",
        "monitor_poll_interval_ms" => {
            settings.monitor_poll_interval_ms =
                value.parse().unwrap_or(defaults.monitor_poll_interval_ms);
        }
        "monitor_debounce_ms" => {
            settings.monitor_debounce_ms = value.parse().unwrap_or(defaults.monitor_debounce_ms);
        }
        "user_agent" => settings.user_agent = value,
        other => log::debug!("Ignoring unknown setting {}", other),
    }
}

// Expand ~ to home directory
fn expand_home(value: String) -> String {
    if let Some(rest) = value.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().to_string();
        }
        value
    } else if value == "~" {
        dirs::home_dir()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or(value)
    } else {
        value
    }
}
