//! Config file discovery and layered merging.
//!
//! Resolution order (later overrides earlier):
//! 1. `<user config dir>/config.toml`
//! 2. `./flowline.toml` (project-local)
//! 3. CLI arguments (handled by the binary)

use std::path::{Path, PathBuf};

use crate::{ConfigError, FlowlineConfig, Result};

const PROJECT_CONFIG_FILE: &str = "flowline.toml";

const USER_CONFIG_FILE: &str = "config.toml";

const APP_NAME: &str = "flowline";

/// Overrides the platform config directory when set and non-empty.
const CONFIG_DIR_ENV: &str = "FLOWLINE_CONFIG_DIR";

/// Tracks where each config layer was loaded from.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    pub path: PathBuf,
    /// Whether the file was found and loaded.
    pub loaded: bool,
}

/// Result of config discovery and loading.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// The merged configuration.
    pub config: FlowlineConfig,
    /// Sources that were checked, lowest precedence first.
    pub sources: Vec<ConfigSource>,
    /// The user config directory that was searched, if any.
    pub config_dir: Option<PathBuf>,
    /// Layers that existed but failed to load.
    pub warnings: Vec<String>,
}

impl LoadedConfig {
    /// Paths of sources that were actually loaded.
    pub fn loaded_from(&self) -> Vec<&Path> {
        self.sources
            .iter()
            .filter(|s| s.loaded)
            .map(|s| s.path.as_path())
            .collect()
    }
}

/// Load configuration from the default user directory and `project_dir`.
pub fn load_config(project_dir: Option<&Path>) -> Result<LoadedConfig> {
    load_config_with_options(project_dir, None)
}

/// Load configuration with explicit control over the user config directory.
///
/// `config_dir` overrides both `FLOWLINE_CONFIG_DIR` and the platform default.
pub fn load_config_with_options(
    project_dir: Option<&Path>,
    config_dir: Option<&Path>,
) -> Result<LoadedConfig> {
    let mut config = FlowlineConfig::new();
    let mut sources = Vec::new();
    let mut warnings = Vec::new();

    let user_dir = match config_dir {
        Some(dir) => Some(dir.to_path_buf()),
        None => user_config_dir(),
    };
    if let Some(dir) = &user_dir {
        sources.push(load_layer(
            &mut config,
            &dir.join(USER_CONFIG_FILE),
            &mut warnings,
        ));
    }

    let project_path = project_dir
        .map(|d| d.join(PROJECT_CONFIG_FILE))
        .unwrap_or_else(|| PathBuf::from(PROJECT_CONFIG_FILE));
    sources.push(load_layer(&mut config, &project_path, &mut warnings));

    Ok(LoadedConfig {
        config,
        sources,
        config_dir: user_dir,
        warnings,
    })
}

/// Load config from a specific file path (no discovery).
pub fn load_config_file(path: &Path) -> Result<FlowlineConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })?;
    FlowlineConfig::from_toml(&contents)
}

/// Save configuration to a file, creating parent directories.
pub fn save_config(config: &FlowlineConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteFile {
            path: parent.display().to_string(),
            source: e,
        })?;
    }

    let contents = config.to_toml()?;
    std::fs::write(path, contents).map_err(|e| ConfigError::WriteFile {
        path: path.display().to_string(),
        source: e,
    })
}

/// `config.toml` inside [`user_config_dir`].
pub fn user_config_path() -> Option<PathBuf> {
    user_config_dir().map(|d| d.join(USER_CONFIG_FILE))
}

/// The user config directory.
///
/// `FLOWLINE_CONFIG_DIR` first, then the platform default
/// (`~/.config/flowline` on Linux).
pub fn user_config_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV)
        && !dir.is_empty()
    {
        return Some(PathBuf::from(dir));
    }
    dirs::config_dir().map(|d| d.join(APP_NAME))
}

/// Merge one layer into `config`. A broken file becomes a warning.
fn load_layer(config: &mut FlowlineConfig, path: &Path, warnings: &mut Vec<String>) -> ConfigSource {
    let mut source = ConfigSource {
        path: path.to_path_buf(),
        loaded: false,
    };
    if !path.is_file() {
        return source;
    }

    match load_config_file(path) {
        Ok(layer) => {
            config.merge(layer);
            source.loaded = true;
        }
        Err(e) => warnings.push(format!("Failed to load {}: {}", path.display(), e)),
    }
    source
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_user_config_path_shape() {
        if let Some(p) = user_config_path() {
            assert!(p.ends_with("config.toml"));
        }
    }

    #[test]
    fn test_load_config_file_not_found() {
        let err = load_config_file(Path::new("/nonexistent/config.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "this is not valid toml {{{{").unwrap();

        let err = load_config_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_config_no_files() {
        let project = TempDir::new().unwrap();
        let user = TempDir::new().unwrap();
        let loaded = load_config_with_options(Some(project.path()), Some(user.path())).unwrap();
        assert_eq!(loaded.config, FlowlineConfig::new());
        assert!(loaded.loaded_from().is_empty());
        assert_eq!(loaded.sources.len(), 2);
        assert_eq!(loaded.config_dir.as_deref(), Some(user.path()));
    }

    #[test]
    fn test_project_layer_overrides_user_layer() {
        let user = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        fs::write(
            user.path().join("config.toml"),
            r#"
[engine]
inline_delay_threshold_ms = 2000

[store]
database = "/data/user.db"
"#,
        )
        .unwrap();
        fs::write(
            project.path().join("flowline.toml"),
            r#"
[store]
database = "/data/project.db"
"#,
        )
        .unwrap();

        let loaded = load_config_with_options(Some(project.path()), Some(user.path())).unwrap();
        assert_eq!(loaded.loaded_from().len(), 2);
        assert_eq!(loaded.config.engine().inline_delay_threshold_ms, 2000);
        assert_eq!(
            loaded.config.store().database,
            Some(PathBuf::from("/data/project.db"))
        );
    }

    #[test]
    fn test_broken_layer_becomes_warning() {
        let user = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        fs::write(user.path().join("config.toml"), "[scheduler]\ntick_ms = 0\n").unwrap();

        let loaded = load_config_with_options(Some(project.path()), Some(user.path())).unwrap();
        assert!(loaded.loaded_from().is_empty());
        assert_eq!(loaded.warnings.len(), 1);
        assert!(loaded.warnings[0].contains("tick_ms"));
    }

    #[test]
    fn test_save_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/dir/config.toml");
        let config = FlowlineConfig::from_toml("[logging]\nfile = false\n").unwrap();

        save_config(&config, &path).unwrap();
        assert_eq!(load_config_file(&path).unwrap(), config);
    }
}
