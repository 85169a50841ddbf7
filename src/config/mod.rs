// Configuration: TOML file in the base directory, overridden by environment variables

pub mod display;
pub mod settings;

pub use display::show_config;
pub use settings::{
    Config, ConfigError, DestinationConfig, ElasticsearchConfig, EmbeddingConfig, PipelineConfig,
    SearchConfig, SourceConfig, WeightedField,
};

use std::path::{Path, PathBuf};

/// The base directory: `override_dir` when given, otherwise `~/.semantic-reindex`
#[inline]
pub fn get_config_dir(override_dir: Option<&Path>) -> Result<PathBuf, ConfigError> {
    override_dir.map_or_else(Config::config_dir, |dir| Ok(dir.to_path_buf()))
}
