//! Stack-level configuration.
use std::path::{Path, PathBuf};

use form::aws::RemovalPolicy;
use snafu::prelude::*;

#[derive(Debug, Snafu)]
pub enum PropsError {
    #[snafu(display("Could not read props file {path:?}: {source}"))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Could not parse props file {path:?}: {source}"))]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Where the function's code comes from.
#[derive(Debug, Default, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum FunctionSource {
    /// The inline Node.js handler on `nodejs18.x`.
    #[default]
    InlineNode,
    /// A zipped `bootstrap` binary on `provided.al2023`, eg. the
    /// `hello-lambda` crate.
    RustBootstrap { zip_path: PathBuf },
}

/// Properties of the stack. Every field has a default.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StackProps {
    /// Applies to the bucket and the table.
    pub removal_policy: RemovalPolicy,
    pub bucket_versioned: bool,
    pub table_name: String,
    /// Function memory in MB.
    pub memory_size: i32,
    pub timeout_secs: i32,
    pub function: FunctionSource,
    /// Adopt an existing bucket and table instead of creating them, eg.
    /// ones retained by an earlier teardown.
    pub import_existing: bool,
}

impl Default for StackProps {
    fn default() -> Self {
        Self {
            removal_policy: RemovalPolicy::Destroy,
            bucket_versioned: true,
            table_name: "MyTable".to_owned(),
            memory_size: 128,
            timeout_secs: 3,
            function: FunctionSource::default(),
            import_existing: false,
        }
    }
}

impl StackProps {
    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PropsError> {
        let path = path.as_ref();
        log::debug!("reading stack props from {path:?}");
        let contents = std::fs::read_to_string(path).context(ReadSnafu { path })?;
        Self::from_toml_str(&contents).context(ParseSnafu { path })
    }
}
