use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::WeftError;

/// Optional capabilities a backend may or may not implement.
///
/// Support is queried at first use, never eagerly, so a program that never
/// spawns a conditional runs fine on a backend without [`Feature::Conditional`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    /// Index-range task collections and collection-typed handles.
    Collections,
    /// if/then/else composition.
    Conditional,
    /// Publish/fetch across execution contexts.
    Publication,
}

impl Feature {
    pub const ALL: [Feature; 3] = [
        Feature::Collections,
        Feature::Conditional,
        Feature::Publication,
    ];
}

impl Display for Feature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Feature::Collections => "collections",
            Feature::Conditional => "conditional",
            Feature::Publication => "publication",
        };
        f.write_str(text)
    }
}

/// Runtime configuration.
///
/// Every field has a default, so an empty JSON object is a valid
/// configuration.
///
/// ```rust
/// use weft::{Config, Feature};
///
/// let config = Config::from_json(r#"{ "ranks": 2, "features": ["publication"] }"#).unwrap();
/// assert_eq!(config.ranks, 2);
/// assert!(config.features.contains(&Feature::Publication));
/// assert!(!config.features.contains(&Feature::Conditional));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Number of distributed execution contexts.
    pub ranks: u32,
    /// Capabilities advertised by the in-memory backend.
    pub features: BTreeSet<Feature>,
    /// Treat open publications and unfinished tasks at finalization as errors
    /// instead of only logging them.
    pub strict_finalize: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ranks: 1,
            features: Feature::ALL.into_iter().collect(),
            strict_finalize: true,
        }
    }
}

impl Config {
    pub fn from_json(text: &str) -> Result<Self, WeftError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn with_ranks(mut self, ranks: u32) -> Self {
        self.ranks = ranks;
        self
    }

    pub fn with_features(mut self, features: impl IntoIterator<Item = Feature>) -> Self {
        self.features = features.into_iter().collect();
        self
    }
}
