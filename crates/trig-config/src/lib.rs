//! Facet types for the trig configuration schema.
//!
//! Every field is optional; the accessors resolve the defaults so callers
//! never have to repeat them.

use facet::Facet;

/// Schema used when none is configured.
pub const DEFAULT_SCHEMA: &str = "public";

/// Directory scanned for migration files when none is configured.
pub const DEFAULT_MIGRATIONS_DIR: &str = "db/triggers";

/// Version-tracking table name when none is configured.
pub const DEFAULT_MIGRATIONS_TABLE: &str = "trig_migrations";

/// Registry table name when none is configured.
pub const DEFAULT_REGISTRY_TABLE: &str = "trig_registry";

/// Actions blocked by the kill switch when none are configured.
pub const DEFAULT_KILL_SWITCH_ACTIONS: &[&str] =
    &["drop_trigger", "execute_sql", "rollback_migration"];

/// Top-level configuration, read from `.config/trig.styx`.
#[derive(Debug, Clone, Default, Facet)]
pub struct Config {
    /// Database schema holding the managed triggers and bookkeeping tables.
    #[facet(default)]
    pub schema: Option<String>,

    /// Environment name used when the caller doesn't provide one.
    #[facet(default)]
    pub default_environment: Option<String>,

    /// Migration runner settings.
    #[facet(default)]
    pub migrations: Option<MigrationsConfig>,

    /// Trigger registry settings.
    #[facet(default)]
    pub registry: Option<RegistryConfig>,

    /// Kill switch for destructive actions.
    #[facet(default)]
    pub kill_switch: Option<KillSwitchConfig>,
}

/// Migration runner settings.
#[derive(Debug, Clone, Default, Facet)]
pub struct MigrationsConfig {
    /// Directory holding `<version>_<name>.sql` files.
    #[facet(default)]
    pub directory: Option<String>,

    /// Name of the version-tracking table.
    #[facet(default)]
    pub table: Option<String>,

    /// Apply migrations even when the safety validator objects.
    #[facet(default)]
    pub allow_unsafe: Option<bool>,
}

/// Trigger registry settings.
#[derive(Debug, Clone, Default, Facet)]
pub struct RegistryConfig {
    /// Name of the registry table.
    #[facet(default)]
    pub table: Option<String>,
}

/// Kill switch settings.
#[derive(Debug, Clone, Default, Facet)]
pub struct KillSwitchConfig {
    /// Whether the kill switch is armed. Defaults to `true`.
    #[facet(default)]
    pub enabled: Option<bool>,

    /// Environments the kill switch applies to. Empty or absent means all.
    #[facet(default)]
    pub environments: Option<Vec<String>>,

    /// Action names the kill switch blocks.
    #[facet(default)]
    pub actions: Option<Vec<String>>,
}

impl Config {
    pub fn schema(&self) -> &str {
        self.schema.as_deref().unwrap_or(DEFAULT_SCHEMA)
    }

    pub fn default_environment(&self) -> Option<&str> {
        self.default_environment.as_deref()
    }

    pub fn migrations_dir(&self) -> &str {
        self.migrations
            .as_ref()
            .and_then(|m| m.directory.as_deref())
            .unwrap_or(DEFAULT_MIGRATIONS_DIR)
    }

    pub fn migrations_table(&self) -> &str {
        self.migrations
            .as_ref()
            .and_then(|m| m.table.as_deref())
            .unwrap_or(DEFAULT_MIGRATIONS_TABLE)
    }

    pub fn allow_unsafe(&self) -> bool {
        self.migrations
            .as_ref()
            .and_then(|m| m.allow_unsafe)
            .unwrap_or(false)
    }

    pub fn registry_table(&self) -> &str {
        self.registry
            .as_ref()
            .and_then(|r| r.table.as_deref())
            .unwrap_or(DEFAULT_REGISTRY_TABLE)
    }

    pub fn kill_switch_enabled(&self) -> bool {
        self.kill_switch
            .as_ref()
            .and_then(|k| k.enabled)
            .unwrap_or(true)
    }

    pub fn kill_switch_environments(&self) -> &[String] {
        self.kill_switch
            .as_ref()
            .and_then(|k| k.environments.as_deref())
            .unwrap_or_default()
    }

    /// Configured kill switch action names, or the defaults.
    pub fn kill_switch_actions(&self) -> Vec<String> {
        match self.kill_switch.as_ref().and_then(|k| k.actions.as_ref()) {
            Some(actions) => actions.clone(),
            None => DEFAULT_KILL_SWITCH_ACTIONS
                .iter()
                .map(|a| a.to_string())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.schema(), "public");
        assert_eq!(config.migrations_dir(), "db/triggers");
        assert_eq!(config.migrations_table(), "trig_migrations");
        assert_eq!(config.registry_table(), "trig_registry");
        assert!(!config.allow_unsafe());
        assert!(config.kill_switch_enabled());
        assert!(config.kill_switch_environments().is_empty());
        assert_eq!(
            config.kill_switch_actions(),
            vec!["drop_trigger", "execute_sql", "rollback_migration"]
        );
    }

    #[test]
    fn test_overrides() {
        let config = Config {
            schema: Some("app".into()),
            migrations: Some(MigrationsConfig {
                directory: Some("sql/triggers".into()),
                table: None,
                allow_unsafe: Some(true),
            }),
            kill_switch: Some(KillSwitchConfig {
                enabled: Some(false),
                environments: Some(vec!["production".into()]),
                actions: Some(vec!["drop_trigger".into()]),
            }),
            ..Default::default()
        };
        assert_eq!(config.schema(), "app");
        assert_eq!(config.migrations_dir(), "sql/triggers");
        assert_eq!(config.migrations_table(), "trig_migrations");
        assert!(config.allow_unsafe());
        assert!(!config.kill_switch_enabled());
        assert_eq!(config.kill_switch_environments(), ["production".to_string()]);
        assert_eq!(config.kill_switch_actions(), vec!["drop_trigger"]);
    }
}
