use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

const CONFIG_FILE_NAME: &str = "config.toml";
const DATABASE_FILE_NAME: &str = "imgforge.db";

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory - computed from home, not serialized
    #[serde(skip)]
    pub data_dir: PathBuf,
    /// Path to config.toml - computed from home, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Database file. Defaults to `<data_dir>/imgforge.db`.
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Root under which each session gets its own image directory.
    /// Defaults to `<data_dir>/images`.
    #[serde(default)]
    pub images_dir: Option<PathBuf>,

    #[serde(default = "default_model")]
    pub default_model: String,

    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Extension used when allocating new image paths.
    #[serde(default = "default_image_format")]
    pub image_format: String,
}

fn default_model() -> String {
    "gpt-image-1".into()
}

fn default_provider() -> String {
    "openai".into()
}

fn default_image_format() -> String {
    "png".into()
}

fn default_data_dir() -> PathBuf {
    home_data_dir().unwrap_or_else(|| PathBuf::from(".imgforge"))
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            config_path: data_dir.join(CONFIG_FILE_NAME),
            data_dir,
            database_path: None,
            images_dir: None,
            default_model: default_model(),
            default_provider: default_provider(),
            image_format: default_image_format(),
        }
    }
}

impl Config {
    /// Load `~/.imgforge/config.toml`, writing defaults on first run.
    pub fn load_or_init() -> Result<Self> {
        let data_dir = home_data_dir().context("Could not find home directory")?;
        fs::create_dir_all(&data_dir).context("Failed to create .imgforge directory")?;

        let config_path = data_dir.join(CONFIG_FILE_NAME);
        let mut config = if config_path.exists() {
            Self::load_from(&config_path)?
        } else {
            let config = Config {
                data_dir,
                config_path,
                ..Config::default()
            };
            config.save()?;
            config
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load_or_init`] but never touches the filesystem: a
    /// missing home directory or config file yields defaults.
    pub fn load_if_present() -> Result<Self> {
        let mut config = match home_data_dir() {
            Some(data_dir) => Self::load_if_present_at(&data_dir)?,
            None => Config::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_if_present_at(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join(CONFIG_FILE_NAME);
        if config_path.exists() {
            return Self::load_from(&config_path);
        }
        Ok(Config {
            data_dir: data_dir.to_path_buf(),
            config_path,
            ..Config::default()
        })
    }

    /// Read an explicit config file. Its directory becomes the data directory.
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.config_path = path.to_path_buf();
        config.data_dir = path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Ok(config)
    }

    /// Effective database path.
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join(DATABASE_FILE_NAME))
    }

    /// Effective image root.
    pub fn images_dir(&self) -> PathBuf {
        self.images_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("images"))
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = non_empty("IMGFORGE_DB_PATH") {
            self.database_path = Some(PathBuf::from(path));
        }
        if let Some(dir) = non_empty("IMGFORGE_IMAGES_DIR") {
            self.images_dir = Some(PathBuf::from(dir));
        }
        if let Some(model) = non_empty("IMGFORGE_MODEL") {
            self.default_model = model;
        }
        if let Some(provider) = non_empty("IMGFORGE_PROVIDER") {
            self.default_provider = provider;
        }
    }

    /// Write the config through a sibling temp file so readers never see a
    /// partial file.
    pub fn save(&self) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(dir) = self.config_path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        let temp_path = self.config_path.with_extension("toml.tmp");
        let written = File::create(&temp_path)
            .and_then(|mut file| {
                file.write_all(contents.as_bytes())?;
                file.sync_all()
            })
            .and_then(|()| fs::rename(&temp_path, &self.config_path));
        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(e).with_context(|| {
                format!("Failed to write config file {}", self.config_path.display())
            });
        }
        Ok(())
    }
}

fn home_data_dir() -> Option<PathBuf> {
    UserDirs::new().map(|u| u.home_dir().join(".imgforge"))
}
