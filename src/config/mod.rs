use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::supervisor::error::SupervisorError;
use crate::watch::WatchSet;

const DEFAULT_DEBOUNCE_MS: u64 = 50;
const DEFAULT_CONFIG_FILE: &str = "hotmod.toml";

/// Top-level `hotmod.toml`
#[derive(Deserialize, Debug, Clone, Default)]
pub struct HotmodConfig {
    #[serde(default)]
    pub unit: Vec<UnitConfig>,
}

/// One supervised module
#[derive(Deserialize, Debug, Clone)]
pub struct UnitConfig {
    /// Module file handed to the worker
    pub path: PathBuf,
    /// Paths or globs that trigger a reload; the module path when absent
    #[serde(default)]
    pub watch: Option<WatchEntries>,
    #[serde(default)]
    pub quiet: bool,
    /// Run without watching; `restart()` does nothing
    #[serde(default)]
    pub disabled: bool,
    pub worker: WorkerCommand,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

/// How to start a worker; the module path is appended as the last argument.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum WatchEntries {
    One(String),
    Many(Vec<String>),
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}

impl UnitConfig {
    pub fn new(path: impl Into<PathBuf>, worker: WorkerCommand) -> Self {
        Self {
            path: path.into(),
            watch: None,
            quiet: false,
            disabled: false,
            worker,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
        }
    }

    /// Entries of the watch set, defaulting to the module path.
    pub fn watch_entries(&self) -> Vec<String> {
        match &self.watch {
            Some(WatchEntries::One(entry)) => vec![entry.clone()],
            Some(WatchEntries::Many(entries)) if !entries.is_empty() => entries.clone(),
            _ => vec![self.path.to_string_lossy().into_owned()],
        }
    }

    pub fn watch_set(&self) -> Result<WatchSet, SupervisorError> {
        WatchSet::parse(&self.watch_entries())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn validate(&self) -> Result<(), SupervisorError> {
        if self.path.as_os_str().is_empty() {
            return Err(SupervisorError::InvalidConfig(
                "module path must not be empty".to_string(),
            ));
        }
        if self.worker.program.trim().is_empty() {
            return Err(SupervisorError::InvalidConfig(format!(
                "worker program for '{}' must not be empty",
                self.path.display()
            )));
        }
        self.watch_set()?;
        Ok(())
    }
}

impl HotmodConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config '{}': {}", path.display(), e))?;
        Self::parse(&s)
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let cfg: Self = toml::from_str(s)?;
        for unit in &cfg.unit {
            unit.validate()?;
        }
        Ok(cfg)
    }

    /// First CLI argument, then `HOTMOD_CONFIG`, then `./hotmod.toml`.
    pub fn locate(arg: Option<String>) -> PathBuf {
        arg.or_else(|| std::env::var("HOTMOD_CONFIG").ok())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        let cfg = HotmodConfig::parse(
            r#"
            [[unit]]
            path = "handlers/echo.js"
            worker = { program = "node", args = ["harness.js"] }

            [[unit]]
            path = "config.js"
            watch = ["config.js", "config/*.json"]
            quiet = true
            disabled = true
            debounce_ms = 200
            worker = { program = "node" }
            "#,
        )
        .unwrap();

        assert_eq!(cfg.unit.len(), 2);
        let echo = &cfg.unit[0];
        assert_eq!(echo.watch_entries(), vec!["handlers/echo.js".to_string()]);
        assert_eq!(echo.debounce(), Duration::from_millis(50));
        assert_eq!(echo.worker.args, vec!["harness.js".to_string()]);
        assert!(!echo.quiet && !echo.disabled);

        let config = &cfg.unit[1];
        assert!(config.quiet && config.disabled);
        assert_eq!(config.debounce_ms, 200);
        assert!(config.worker.args.is_empty());
        assert_eq!(config.watch_entries().len(), 2);
    }

    #[test]
    fn test_single_watch_string() {
        let cfg = HotmodConfig::parse(
            r#"
            [[unit]]
            path = "a.js"
            watch = "src"
            worker = { program = "node" }
            "#,
        )
        .unwrap();
        assert_eq!(cfg.unit[0].watch, Some(WatchEntries::One("src".to_string())));
        assert_eq!(cfg.unit[0].watch_entries(), vec!["src".to_string()]);
    }

    #[test]
    fn test_empty_config() {
        let cfg = HotmodConfig::parse("").unwrap();
        assert!(cfg.unit.is_empty());
    }

    #[test]
    fn test_missing_worker_is_rejected() {
        assert!(HotmodConfig::parse("[[unit]]\npath = \"a.js\"\n").is_err());
    }

    #[test]
    fn test_validate() {
        let worker = WorkerCommand { program: "node".into(), args: vec![] };
        assert!(UnitConfig::new("a.js", worker.clone()).validate().is_ok());

        let blank = WorkerCommand { program: "  ".into(), args: vec![] };
        assert!(matches!(
            UnitConfig::new("a.js", blank).validate(),
            Err(SupervisorError::InvalidConfig(_))
        ));

        let mut bad_glob = UnitConfig::new("a.js", worker);
        bad_glob.watch = Some(WatchEntries::Many(vec!["src/[*.js".into()]));
        assert!(matches!(
            bad_glob.validate(),
            Err(SupervisorError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_locate_prefers_argument() {
        assert_eq!(
            HotmodConfig::locate(Some("custom.toml".into())),
            PathBuf::from("custom.toml")
        );
    }
}
