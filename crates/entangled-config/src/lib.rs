use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {config_path}: {source}")]
    ConfigReadError {
        config_path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {config_path}: {source}")]
    ConfigParseError {
        config_path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    ConfigSerializeError(#[from] toml::ser::Error),

    #[error("Failed to write config file at {config_path}: {source}")]
    ConfigWriteError {
        config_path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid value for `{field}`: {value:?} (expected one of {expected:?})")]
    InvalidEnumValue {
        field: &'static str,
        value: String,
        expected: &'static [&'static str],
    },
}

/// Block-header grammar selection. See `entangled.toml`'s `style` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Style {
    EntangledRs,
    Pandoc,
    Quarto,
    Knitr,
}

impl Default for Style {
    fn default() -> Self {
        Self::EntangledRs
    }
}

/// Emission policy for tangle begin/end markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Annotation {
    Standard,
    Naked,
    Supplemental,
}

impl Default for Annotation {
    fn default() -> Self {
        Self::Standard
    }
}

/// Whether a block's external id is namespaced by its source filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceDefault {
    File,
    None,
}

impl Default for NamespaceDefault {
    fn default() -> Self {
        Self::File
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HooksConfig {
    #[serde(default)]
    pub shebang: bool,
    #[serde(default)]
    pub spdx_license: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_debounce_ms() -> u64 {
    100
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

/// An extra language definition contributed through `entangled.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageDef {
    pub name: String,
    pub comment: String,
    #[serde(default)]
    pub identifiers: Vec<String>,
}

fn default_source_patterns() -> Vec<String> {
    vec!["**/*.md".to_string()]
}

fn default_filedb_path() -> PathBuf {
    PathBuf::from(".entangled/filedb.json")
}

/// The engine's configuration record, loaded from `entangled.toml`.
///
/// All fields have defaults, so a missing config file is equivalent to
/// every field taking its default value (see `Config::default`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_source_patterns")]
    pub source_patterns: Vec<String>,
    #[serde(default)]
    pub style: Style,
    #[serde(default)]
    pub annotation: Annotation,
    #[serde(default)]
    pub namespace_default: NamespaceDefault,
    #[serde(default = "default_filedb_path")]
    pub filedb_path: PathBuf,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub strip_quarto_options: bool,
    #[serde(default)]
    pub hooks: HooksConfig,
    #[serde(default)]
    pub languages: Vec<LanguageDef>,
    #[serde(default)]
    pub watch: WatchConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source_patterns: default_source_patterns(),
            style: Style::default(),
            annotation: Annotation::default(),
            namespace_default: NamespaceDefault::default(),
            filedb_path: default_filedb_path(),
            output_dir: None,
            strip_quarto_options: false,
            hooks: HooksConfig::default(),
            languages: Vec::new(),
            watch: WatchConfig::default(),
        }
    }
}

const KNOWN_TOP_LEVEL_KEYS: &[&str] = &[
    "source_patterns",
    "style",
    "annotation",
    "namespace_default",
    "filedb_path",
    "output_dir",
    "strip_quarto_options",
    "hooks",
    "languages",
    "watch",
];

impl Config {
    /// Load config from `entangled.toml` at `config_path`. A missing file
    /// yields `Ok(Config::default())`, matching the "lenient reader" the
    /// spec calls for rather than `Option<Config>`: callers always get a
    /// usable, fully-defaulted record.
    pub fn load_from_path<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        let config_path = config_path.as_ref();
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(config_path).map_err(|source| {
            ConfigError::ConfigReadError {
                config_path: config_path.to_path_buf(),
                source,
            }
        })?;

        Self::warn_unknown_keys(&content, config_path);

        let config: Config =
            toml::from_str(&content).map_err(|source| ConfigError::ConfigParseError {
                config_path: config_path.to_path_buf(),
                source,
            })?;

        Ok(config)
    }

    /// Load `entangled.toml` from `base_dir`, defaulting if absent.
    pub fn load(base_dir: &Path) -> Result<Self, ConfigError> {
        Self::load_from_path(base_dir.join("entangled.toml"))
    }

    pub fn save_to_path<P: AsRef<Path>>(&self, config_path: P) -> Result<(), ConfigError> {
        let config_path = config_path.as_ref();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::ConfigWriteError {
                config_path: config_path.to_path_buf(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content).map_err(|source| ConfigError::ConfigWriteError {
            config_path: config_path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    /// Parse `content` as a loose TOML table and warn (via `log::warn!`)
    /// about any top-level key this config doesn't recognize. Serde's
    /// default behavior silently drops unknown fields, which would hide
    /// the warning the spec requires.
    fn warn_unknown_keys(content: &str, config_path: &Path) {
        let Ok(table) = content.parse::<toml::Table>() else {
            return;
        };
        for key in table.keys() {
            if !KNOWN_TOP_LEVEL_KEYS.contains(&key.as_str()) {
                log::warn!(
                    "{}: unrecognized config key `{key}`, ignoring",
                    config_path.display()
                );
            }
        }
    }

    /// Built-in language table, overlaid with any `languages` entries from
    /// this config (config entries take precedence on name collision).
    pub fn language_table(&self) -> BTreeMap<String, String> {
        let mut table: BTreeMap<String, String> = builtin_languages()
            .iter()
            .map(|(name, comment)| (name.to_string(), comment.to_string()))
            .collect();
        for lang in &self.languages {
            table.insert(lang.name.clone(), lang.comment.clone());
            for alias in &lang.identifiers {
                table.insert(alias.clone(), lang.comment.clone());
            }
        }
        table
    }
}

/// The built-in `(language, line-comment token)` table from §6.
pub fn builtin_languages() -> &'static [(&'static str, &'static str)] {
    &[
        ("python", "#"),
        ("rust", "//"),
        ("javascript", "//"),
        ("typescript", "//"),
        ("go", "//"),
        ("c", "//"),
        ("cpp", "//"),
        ("java", "//"),
        ("ruby", "#"),
        ("shell", "#"),
        ("haskell", "--"),
        ("lua", "--"),
    ]
}
