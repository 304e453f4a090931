use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use storyreel_producer::{
    DEFAULT_CEILING, DEFAULT_ELEVENLABS_ENDPOINT, DEFAULT_IMAGE_MODEL, DEFAULT_IMAGE_SIZE,
    DEFAULT_OPENAI_ENDPOINT, DEFAULT_SCRIPT_MODEL, DEFAULT_VOICE_ID, GateLimits,
};
use storyreel_sequence::PromptBook;

pub const DEFAULT_SETTINGS_FILE: &str = "storyreel.json";
pub const ENV_PREFIX: &str = "STORYREEL_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiSettings {
    pub api_key: String,
    pub endpoint: String,
    pub script_model: String,
    pub image_model: String,
    pub image_size: String,
}

impl Default for OpenAiSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            endpoint: DEFAULT_OPENAI_ENDPOINT.to_string(),
            script_model: DEFAULT_SCRIPT_MODEL.to_string(),
            image_model: DEFAULT_IMAGE_MODEL.to_string(),
            image_size: DEFAULT_IMAGE_SIZE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElevenLabsSettings {
    pub api_key: String,
    pub endpoint: String,
    pub voice_id: String,
}

impl Default for ElevenLabsSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            endpoint: DEFAULT_ELEVENLABS_ENDPOINT.to_string(),
            voice_id: DEFAULT_VOICE_ID.to_string(),
        }
    }
}

/// Concurrency ceilings per capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    pub script: usize,
    pub image: usize,
    pub speech: usize,
    pub overload_pause_ms: u64,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            script: DEFAULT_CEILING,
            image: DEFAULT_CEILING,
            speech: DEFAULT_CEILING,
            overload_pause_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub openai: OpenAiSettings,
    pub elevenlabs: ElevenLabsSettings,
    pub limits: LimitSettings,
    pub image_dir: PathBuf,
    pub audio_dir: PathBuf,
    pub database: String,
    pub prompt_book: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            openai: OpenAiSettings::default(),
            elevenlabs: ElevenLabsSettings::default(),
            limits: LimitSettings::default(),
            image_dir: PathBuf::from("images"),
            audio_dir: PathBuf::from("audio"),
            database: "storyreel.db".to_string(),
            prompt_book: None,
        }
    }
}

impl Settings {
    /// Defaults, then the JSON file at `path` if present, then `STORYREEL_*` variables
    /// (`__` separates nested keys, e.g. `STORYREEL_OPENAI__API_KEY`).
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "settings file not found, using defaults and environment");
        }

        let figment = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let settings = figment
            .extract::<Settings>()
            .map_err(Box::new)
            .context(ExtractSnafu {
                stage: "extract-settings",
                path: path.to_path_buf(),
            })?;
        Ok(settings.normalized())
    }

    pub fn normalized(mut self) -> Self {
        self.openai.api_key = self.openai.api_key.trim().to_string();
        self.elevenlabs.api_key = self.elevenlabs.api_key.trim().to_string();
        self.elevenlabs.voice_id = self.elevenlabs.voice_id.trim().to_string();
        if self.elevenlabs.voice_id.is_empty() {
            self.elevenlabs.voice_id = DEFAULT_VOICE_ID.to_string();
        }
        self.limits.script = self.limits.script.max(1);
        self.limits.image = self.limits.image.max(1);
        self.limits.speech = self.limits.speech.max(1);
        self
    }

    pub fn gate_limits(&self) -> GateLimits {
        GateLimits {
            script: self.limits.script,
            image: self.limits.image,
            speech: self.limits.speech,
            overload_pause: Duration::from_millis(self.limits.overload_pause_ms),
        }
    }

    /// Built-in prompts, overridden key by key from the configured prompt-book file.
    pub fn load_prompt_book(&self) -> Result<PromptBook, SettingsError> {
        let Some(path) = &self.prompt_book else {
            return Ok(PromptBook::default());
        };

        Figment::from(Serialized::defaults(PromptBook::default()))
            .merge(Json::file(path))
            .extract::<PromptBook>()
            .map_err(Box::new)
            .context(ExtractSnafu {
                stage: "extract-prompt-book",
                path: path.clone(),
            })
    }

    /// Writes the settings as pretty JSON, replacing `path` atomically.
    pub fn persist(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(self).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: path.to_path_buf(),
        })?;

        tracing::info!(path = %path.display(), "saved settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to read settings from {path:?} on `{stage}`: {source}"))]
    Extract {
        stage: &'static str,
        path: PathBuf,
        source: Box<figment::Error>,
    },
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    #[test]
    fn file_and_environment_layer_over_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                DEFAULT_SETTINGS_FILE,
                r#"{
                    "openai": { "api_key": "  sk-file  " },
                    "limits": { "image": 5 },
                    "database": "data/reel.db"
                }"#,
            )?;
            jail.set_env("STORYREEL_LIMITS__SPEECH", "0");
            jail.set_env("STORYREEL_ELEVENLABS__API_KEY", "xi-env");

            let settings =
                Settings::load(Path::new(DEFAULT_SETTINGS_FILE)).map_err(|error| error.to_string())?;

            assert_eq!(settings.openai.api_key, "sk-file");
            assert_eq!(settings.openai.script_model, DEFAULT_SCRIPT_MODEL);
            assert_eq!(settings.elevenlabs.api_key, "xi-env");
            assert_eq!(settings.database, "data/reel.db");
            let limits = settings.gate_limits();
            assert_eq!((limits.script, limits.image, limits.speech), (3, 5, 1));
            Ok(())
        });
    }

    #[test]
    fn missing_file_yields_defaults() {
        Jail::expect_with(|_| {
            let settings =
                Settings::load(Path::new("absent.json")).map_err(|error| error.to_string())?;

            assert_eq!(settings, Settings::default());
            Ok(())
        });
    }

    #[test]
    fn persisted_settings_load_back() {
        Jail::expect_with(|_| {
            let mut settings = Settings::default();
            settings.openai.api_key = "sk-saved".to_string();
            settings.limits.script = 2;
            let path = Path::new("nested/storyreel.json");

            settings.persist(path).map_err(|error| error.to_string())?;
            let loaded = Settings::load(path).map_err(|error| error.to_string())?;

            assert_eq!(loaded, settings);
            Ok(())
        });
    }

    #[test]
    fn prompt_book_file_overrides_single_templates() {
        Jail::expect_with(|jail| {
            jail.create_file("prompts.json", r#"{ "script": "Write about vegetables." }"#)?;
            let settings = Settings {
                prompt_book: Some(PathBuf::from("prompts.json")),
                ..Settings::default()
            };

            let prompts = settings
                .load_prompt_book()
                .map_err(|error| error.to_string())?;

            assert_eq!(prompts.script, "Write about vegetables.");
            assert_eq!(prompts.sentence_between, PromptBook::default().sentence_between);
            Ok(())
        });
    }
}
