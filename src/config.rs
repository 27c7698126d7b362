use std::path::PathBuf;

/// Runtime settings, read once from `CAREWINDOW_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    /// Command script; stdin when unset.
    pub input: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable numbers fall back to defaults.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            data_dir: var("CAREWINDOW_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            compact_threshold: var("CAREWINDOW_COMPACT_THRESHOLD")
                .and_then(|s| s.parse().ok())
                .unwrap_or(1000),
            metrics_port: var("CAREWINDOW_METRICS_PORT").and_then(|s| s.parse().ok()),
            input: var("CAREWINDOW_INPUT").map(PathBuf::from),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("schedule.wal")
    }
}
