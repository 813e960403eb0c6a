//! Registry selection from the process environment.

use std::env;
use std::path::PathBuf;

use tracing::warn;

use crate::state::{FileState, ReadOnlyState, ResourceState, State};

/// Path of the node registry document.
pub const STATE_FILE_ENV: &str = "IDGEN_STATE_FILE";
/// Flush interval override in milliseconds.
pub const SYNCH_INTERVAL_ENV: &str = "IDGEN_SYNCH_INTERVAL";
/// `read-only` (default) or `file` for a writable registry.
pub const STATE_MODE_ENV: &str = "IDGEN_STATE_MODE";

/// How the node registry is backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StateMode {
    #[default]
    ReadOnly,
    File,
}

impl StateMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadOnly => "read-only",
            Self::File => "file",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "read-only" | "readonly" => Some(Self::ReadOnly),
            "file" => Some(Self::File),
            _ => None,
        }
    }
}

/// Which registry to open and how.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateConfig {
    pub resource: Option<PathBuf>,
    pub mode: StateMode,
    pub synch_interval: Option<u64>,
}

impl StateConfig {
    /// Read the configuration from `IDGEN_*` environment variables.
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`StateConfig::from_env`] over an arbitrary key/value lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let resource = lookup(STATE_FILE_ENV)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let mode = match lookup(STATE_MODE_ENV) {
            None => StateMode::default(),
            Some(raw) => StateMode::parse(raw.trim()).unwrap_or_else(|| {
                warn!(target: "idgen.config", value = %raw, "unknown state mode, using read-only");
                StateMode::default()
            }),
        };

        let synch_interval = lookup(SYNCH_INTERVAL_ENV).and_then(|raw| {
            raw.trim()
                .parse::<u64>()
                .inspect_err(|_| {
                    warn!(
                        target: "idgen.config",
                        value = %raw,
                        "ignoring unparseable synch interval"
                    )
                })
                .ok()
        });

        Self {
            resource,
            mode,
            synch_interval,
        }
    }

    /// Build the configured registry, falling back to an empty in-memory
    /// read-only one when no resource is named.
    pub fn open_state(&self) -> Box<dyn State> {
        match (&self.resource, self.mode) {
            (None, _) => Box::new(ReadOnlyState::new()),
            (Some(path), StateMode::ReadOnly) => Box::new(ResourceState::new(Some(path.clone()))),
            (Some(path), StateMode::File) => {
                let state = FileState::new(path);
                match self.synch_interval {
                    Some(interval) => Box::new(state.with_synch_interval(interval)),
                    None => Box::new(state),
                }
            }
        }
    }
}
