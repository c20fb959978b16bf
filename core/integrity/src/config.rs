use std::path::PathBuf;
use tracing::warn;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:21960";
const DEFAULT_MONTHS_AHEAD: u32 = 2;
const DEFAULT_MONTHS_BEHIND: u32 = 1;

/// Runtime settings, read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityConfig {
    pub db_path: PathBuf,
    pub bind_addr: String,
    /// Monthly cycles kept generated ahead of today.
    pub months_ahead: u32,
    pub months_behind: u32,
    /// Roll stale tasks forward whenever the current cycle is requested.
    pub rollover_on_current: bool,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            months_ahead: DEFAULT_MONTHS_AHEAD,
            months_behind: DEFAULT_MONTHS_BEHIND,
            rollover_on_current: true,
        }
    }
}

impl IntegrityConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        Self {
            db_path: lookup("DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            bind_addr: lookup("BIND_ADDR").unwrap_or(defaults.bind_addr),
            months_ahead: parse_or("CYCLE_MONTHS_AHEAD", lookup("CYCLE_MONTHS_AHEAD"), defaults.months_ahead),
            months_behind: parse_or(
                "CYCLE_MONTHS_BEHIND",
                lookup("CYCLE_MONTHS_BEHIND"),
                defaults.months_behind,
            ),
            rollover_on_current: lookup("ROLLOVER_ON_CURRENT")
                .map(|raw| parse_flag(&raw))
                .unwrap_or(defaults.rollover_on_current),
        }
    }
}

fn default_db_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(format!(
        "{}/Library/Application Support/Farmstead/farmstead.db",
        home
    ))
}

fn parse_or(key: &str, raw: Option<String>, default: u32) -> u32 {
    match raw {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring {}={:?}, using {}", key, raw, default);
            default
        }),
        None => default,
    }
}

fn parse_flag(raw: &str) -> bool {
    !matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> IntegrityConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        IntegrityConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]);
        assert_eq!(config.bind_addr, "127.0.0.1:21960");
        assert_eq!(config.months_ahead, 2);
        assert_eq!(config.months_behind, 1);
        assert!(config.rollover_on_current);
        assert!(config.db_path.ends_with("Farmstead/farmstead.db"));
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("DB_PATH", "/tmp/farm.db"),
            ("CYCLE_MONTHS_AHEAD", "6"),
            ("CYCLE_MONTHS_BEHIND", " 0 "),
            ("ROLLOVER_ON_CURRENT", "off"),
        ]);
        assert_eq!(config.db_path, PathBuf::from("/tmp/farm.db"));
        assert_eq!(config.months_ahead, 6);
        assert_eq!(config.months_behind, 0);
        assert!(!config.rollover_on_current);
    }

    #[test]
    fn test_bad_numbers_fall_back() {
        let config = config(&[("CYCLE_MONTHS_AHEAD", "lots")]);
        assert_eq!(config.months_ahead, 2);
    }
}
