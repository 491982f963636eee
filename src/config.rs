//! Engine configuration.
//!
//! Settings are read with the `config` crate: an optional file (any format the
//! crate understands, e.g. `squall.toml`) overridden by `SQUALL_*` environment
//! variables. Everything has a default so an empty source set is valid.

use serde::Deserialize;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Tsv,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Ceiling on the number of live groups; `None` means unlimited.
    pub group_limit: Option<usize>,
    /// Query option flags, matched case-insensitively by `has_option`.
    pub options: Vec<String>,
    /// A `tracing_subscriber::EnvFilter` directive used by the binary.
    pub log_filter: String,
    pub output: OutputFormat,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            group_limit: None,
            options: Vec::new(),
            log_filter: "info".to_string(),
            output: OutputFormat::Tsv,
        }
    }
}

impl EngineConfig {
    /// Loads from `path` (optional, missing file is fine) and the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("SQUALL")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("options"),
        );
        Self::from_sources(builder.build()?)
    }

    pub fn from_sources(sources: config::Config) -> Result<Self> {
        Ok(sources.try_deserialize::<EngineConfig>()?)
    }

    pub fn with_group_limit(mut self, limit: usize) -> Self {
        self.group_limit = Some(limit);
        self
    }

    pub fn has_option(&self, option: &str) -> bool {
        self.options.iter().any(|o| o.eq_ignore_ascii_case(option))
    }
}
