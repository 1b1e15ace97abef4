//! Runtime configuration shared across a context tree.

use serde::{Deserialize, Serialize};

/// Options read by every context of a machine.
///
/// Keys serialize in camelCase (`debug`, `requireHandler`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HsmConfig {
    /// Log every enter as an indented `name => state` line.
    pub debug: bool,
    /// Fail when entering a state that has no registered handler.
    pub require_handler: bool,
}

impl HsmConfig {
    /// Apply the keys present in `patch`, leaving the others untouched.
    pub fn merge(self, patch: ConfigPatch) -> Self {
        Self {
            debug: patch.debug.unwrap_or(self.debug),
            require_handler: patch.require_handler.unwrap_or(self.require_handler),
        }
    }
}

/// Partial configuration; absent keys keep their current value.
///
/// # Example
///
/// ```rust
/// use regent::runtime::{ConfigPatch, HsmConfig};
///
/// let patch = ConfigPatch::from_json(r#"{"requireHandler": true}"#).unwrap();
/// let config = HsmConfig::default().merge(patch);
///
/// assert!(config.require_handler);
/// assert!(!config.debug);
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConfigPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub require_handler: Option<bool>,
}

impl ConfigPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = Some(debug);
        self
    }

    pub fn with_require_handler(mut self, require_handler: bool) -> Self {
        self.require_handler = Some(require_handler);
        self
    }

    /// Parse a patch from JSON. Unknown keys are ignored.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl From<HsmConfig> for ConfigPatch {
    fn from(config: HsmConfig) -> Self {
        Self {
            debug: Some(config.debug),
            require_handler: Some(config.require_handler),
        }
    }
}
