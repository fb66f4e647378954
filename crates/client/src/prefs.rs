use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::config::ClientConfig;

pub const PREFERENCES_FILE_NAME: &str = "preferences.json";

/// Persisted theme choice; `System` defers to the platform preference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThemeMode {
    Light,
    Dark,
    #[default]
    System,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    #[serde(default)]
    pub theme_mode: ThemeMode,
}

/// Client-side preferences persisted under the namespaced config directory.
///
/// Reads go through an `ArcSwap` cell so the view layer can sample the theme
/// on every frame without locking; writes go to a temp file first and rename
/// into place, so the stored file is never half-written.
pub struct PreferenceStore {
    preferences: Arc<ArcSwap<Preferences>>,
    path: PathBuf,
}

impl PreferenceStore {
    pub fn default_path() -> PathBuf {
        ClientConfig::default_config_dir().join(PREFERENCES_FILE_NAME)
    }

    pub fn new(path: PathBuf) -> Self {
        let preferences = Self::load_from_disk(&path);
        Self {
            preferences: Arc::new(ArcSwap::from_pointee(preferences)),
            path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_path())
    }

    pub fn preferences(&self) -> Arc<Preferences> {
        self.preferences.load_full()
    }

    pub fn theme_mode(&self) -> ThemeMode {
        self.preferences.load().theme_mode
    }

    pub fn update(&self, preferences: Preferences) -> Result<(), PreferenceError> {
        self.persist(&preferences)?;
        self.preferences.store(Arc::new(preferences));
        Ok(())
    }

    pub fn set_theme_mode(&self, theme_mode: ThemeMode) -> Result<(), PreferenceError> {
        let mut preferences = Preferences::clone(&self.preferences());
        preferences.theme_mode = theme_mode;
        self.update(preferences)
    }

    fn load_from_disk(path: &PathBuf) -> Preferences {
        if !path.exists() {
            tracing::info!("preferences file not found at {:?}, using defaults", path);
            return Preferences::default();
        }

        let figment =
            Figment::from(Serialized::defaults(Preferences::default())).merge(Json::file(path));

        match figment.extract::<Preferences>() {
            Ok(preferences) => preferences,
            Err(error) => {
                tracing::warn!(
                    "failed to parse preferences from {:?}: {}. using defaults",
                    path,
                    error
                );
                Preferences::default()
            }
        }
    }

    fn persist(&self, preferences: &Preferences) -> Result<(), PreferenceError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-preferences-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(preferences).context(SerializeSnafu {
            stage: "serialize-preferences-json",
        })?;

        let temp_path = self.path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-preferences-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.path).context(RenameTempFileSnafu {
            stage: "rename-temporary-preferences-file",
            from: temp_path,
            to: self.path.clone(),
        })?;

        tracing::info!("saved preferences to {:?}", self.path);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PreferenceError {
    #[snafu(display(
        "failed to create preferences directory at {path:?} on `{stage}`: {source}"
    ))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize preferences on `{stage}`: {source}"))]
    Serialize {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write preferences file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace preferences file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}
