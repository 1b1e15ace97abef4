//! Snapshot and checkpoint formats for context trees.
//!
//! A [`Snapshot`] is the structural image of a live context tree: one entry
//! per active context, carrying its node name, state and payload. A
//! [`Checkpoint`] wraps the root snapshot with a version, an id and a
//! timestamp so that it can be stored and resumed later.
//!
//! Restoring never runs guards; it rebuilds the tree and re-runs enter
//! handlers so they can reinstall their update and exit callbacks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub mod error;

pub use error::CheckpointError;

/// Version identifier for checkpoint format
pub const CHECKPOINT_VERSION: u32 = 1;

/// Structural image of one active context and its active children.
///
/// # Example
///
/// ```rust
/// use regent::checkpoint::Snapshot;
///
/// let snapshot = Snapshot::new("door", "open").with_child(Snapshot::new("light", "on"));
/// let json = serde_json::to_string(&snapshot).unwrap();
///
/// assert_eq!(
///     json,
///     r#"{"name":"door","state":"open","data":null,"children":[{"name":"light","state":"on","data":null,"children":[]}]}"#
/// );
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub name: String,
    pub state: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub children: Vec<Snapshot>,
}

impl Snapshot {
    pub fn new(name: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: state.into(),
            data: Value::Null,
            children: Vec::new(),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_child(mut self, child: Snapshot) -> Self {
        self.children.push(child);
        self
    }

    /// Depth-first `(name, state)` pairs of every entry below this one.
    pub fn pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for child in &self.children {
            child.collect_pairs(&mut pairs);
        }
        pairs
    }

    fn collect_pairs(&self, pairs: &mut Vec<(String, String)>) {
        pairs.push((self.name.clone(), self.state.clone()));
        for child in &self.children {
            child.collect_pairs(pairs);
        }
    }
}

/// Serializable checkpoint of a whole machine.
/// Does NOT include handlers (not serializable).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint format version
    pub version: u32,

    /// Unique checkpoint identifier
    pub id: String,

    /// When checkpoint was created
    pub taken_at: DateTime<Utc>,

    /// Snapshot of the root context
    pub root: Snapshot,
}

impl Checkpoint {
    pub fn new(root: Snapshot) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            id: Uuid::new_v4().to_string(),
            taken_at: Utc::now(),
            root,
        }
    }

    /// Reject checkpoints written by an unsupported format version.
    pub fn validate(&self) -> Result<(), CheckpointError> {
        if self.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::UnsupportedVersion {
                found: self.version,
                supported: CHECKPOINT_VERSION,
            });
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, CheckpointError> {
        serde_json::to_string(self).map_err(CheckpointError::Encode)
    }

    pub fn to_json_pretty(&self) -> Result<String, CheckpointError> {
        serde_json::to_string_pretty(self).map_err(CheckpointError::Encode)
    }

    /// Parse and validate a checkpoint.
    pub fn from_json(json: &str) -> Result<Self, CheckpointError> {
        let checkpoint: Self = serde_json::from_str(json).map_err(CheckpointError::Decode)?;
        checkpoint.validate()?;
        Ok(checkpoint)
    }
}
