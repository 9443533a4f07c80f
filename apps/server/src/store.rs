use crate::engine::EngineState;
use crate::intent::{AutomationSettings, UserIntent};
use crate::sleep::SleepSchedule;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// The persisted part of the engine state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    pub user_intent: UserIntent,
    pub settings: AutomationSettings,
    pub sleep_schedule: Option<SleepSchedule>,
}

impl From<PersistedState> for EngineState {
    fn from(p: PersistedState) -> Self {
        EngineState {
            intent: p.user_intent,
            settings: p.settings,
            sleep: p.sleep_schedule,
            controller: Default::default(),
        }
    }
}

impl From<&EngineState> for PersistedState {
    fn from(state: &EngineState) -> Self {
        PersistedState {
            user_intent: state.intent.clone(),
            settings: state.settings,
            sleep_schedule: state.sleep.clone(),
        }
    }
}

/// Single JSON document on disk. Every save replaces it atomically.
#[derive(Debug, Clone)]
pub struct Store {
    path: PathBuf,
}

impl Store {
    pub fn new(path: impl Into<PathBuf>) -> Store {
        Store { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the stored state, creating the file with defaults on first run.
    pub fn load(&self) -> Result<PersistedState> {
        if !self.path.exists() {
            let state = PersistedState::default();
            self.save(&state)?;
            info!(path = %self.path.display(), "created state file with defaults");
            return Ok(state);
        }
        let text = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Invalid state file {}", self.path.display()))
    }

    pub fn save(&self, state: &PersistedState) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let tmp_path = self.path.with_extension("tmp");
        let body = serde_json::to_vec_pretty(state)?;
        let mut file = File::create(&tmp_path)
            .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
        file.write_all(&body)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, &self.path).with_context(|| {
            format!("Failed to rename {} to {}", tmp_path.display(), self.path.display())
        })?;
        Ok(())
    }
}
