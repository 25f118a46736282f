//! Configuration for Flowline.
//!
//! TOML configuration with layering: the user config directory
//! (`--config-dir`, `FLOWLINE_CONFIG_DIR`, or the platform default) is
//! loaded first, then a project-local `./flowline.toml` overrides it
//! section by section.

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    LoadedConfig, load_config, load_config_file, load_config_with_options, save_config,
    user_config_dir, user_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;
