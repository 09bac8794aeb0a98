use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::MapError;

/// The capability keys and paths of one map, read from its `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapConfig {
    #[serde(default = "default_feature_conf")]
    pub feature_conf: String,
    #[serde(default = "default_matcher_conf")]
    pub matcher_conf: String,
    /// The global extractor, if ranked retrieval is available for the map
    #[serde(default)]
    pub retrieval_conf: Option<String>,
    #[serde(default = "default_solver_conf")]
    pub solver_conf: String,
    /// Where the reconstruction lives if not in the map directory
    #[serde(default)]
    pub reconstruction_path: Option<PathBuf>,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            feature_conf: default_feature_conf(),
            matcher_conf: default_matcher_conf(),
            retrieval_conf: None,
            solver_conf: default_solver_conf(),
            reconstruction_path: None,
        }
    }
}

fn default_feature_conf() -> String {
    "akaze".into()
}

fn default_matcher_conf() -> String {
    "mutual-nn".into()
}

fn default_solver_conf() -> String {
    "arrsac-lambda-twist".into()
}

impl MapConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MapError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| MapError::io(path, e))?;
        serde_json::from_str(&text).map_err(|e| MapError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Reads `config.json` from the map directory, or the defaults if there is none.
    pub fn load_or_default(directory: impl AsRef<Path>) -> Result<Self, MapError> {
        let path = directory.as_ref().join("config.json");
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Replaces the `from` prefix of stored paths with `to`.
    ///
    /// Maps built on another machine carry absolute paths of that machine.
    pub fn rewrite_root(&mut self, from: impl AsRef<Path>, to: impl AsRef<Path>) {
        if let Some(path) = &self.reconstruction_path {
            if let Ok(rest) = path.strip_prefix(from.as_ref()) {
                self.reconstruction_path = Some(to.as_ref().join(rest));
            }
        }
    }

    /// The directory holding the reconstruction text files.
    pub fn reconstruction_dir(&self, map_directory: impl AsRef<Path>) -> PathBuf {
        match &self.reconstruction_path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => map_directory.as_ref().join(path),
            None => map_directory.as_ref().to_path_buf(),
        }
    }
}
