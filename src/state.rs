//! Persisted stack state.
//!
//! The reconciler reads state once at the start of a run and writes it back
//! incrementally as each node action completes, so a crash mid-run leaves the
//! file consistent with whichever subset of nodes actually changed.

use std::collections::BTreeMap;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::{AttributeMap, ResourceKind};

/// Recorded outcome of the last successful action on one node.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct NodeRecord {
    /// Provider-assigned identifier. Written exclusively by the reconciler.
    pub id: String,
    /// Last applied attributes, merged with provider-observed values.
    pub attributes: AttributeMap,
}

/// Mapping from node kind to its last applied record.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct StackState {
    #[serde(default)]
    records: BTreeMap<ResourceKind, NodeRecord>,
}

impl StackState {
    /// Returns the record for a node, if one exists.
    #[must_use]
    pub fn record(&self, kind: ResourceKind) -> Option<&NodeRecord> {
        self.records.get(&kind)
    }

    /// Stores (or replaces) the record for a node.
    pub fn insert(&mut self, kind: ResourceKind, record: NodeRecord) {
        self.records.insert(kind, record);
    }

    /// Removes the record for a node, returning it when present.
    pub fn remove(&mut self, kind: ResourceKind) -> Option<NodeRecord> {
        self.records.remove(&kind)
    }

    /// Recorded kinds in reverse declaration order, the order destruction
    /// must proceed in.
    #[must_use]
    pub fn kinds_reversed(&self) -> Vec<ResourceKind> {
        ResourceKind::DECLARATION_ORDER
            .into_iter()
            .rev()
            .filter(|kind| self.records.contains_key(kind))
            .collect()
    }

    /// Number of recorded nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when no node has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Errors raised while loading or saving stack state.
#[derive(Debug, Error)]
pub enum StateStoreError {
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when parsing or rendering state content fails.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Path that could not be parsed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the state path has no usable file name.
    #[error("state path {path} is missing a filename")]
    InvalidPath {
        /// Offending path.
        path: Utf8PathBuf,
    },
}

/// Abstraction over state persistence for dependency injection.
pub trait StateStore {
    /// Loads the persisted state, defaulting to empty when none exists yet.
    ///
    /// # Errors
    ///
    /// Returns [`StateStoreError`] when the backing store cannot be read or
    /// parsed.
    fn load(&self) -> Result<StackState, StateStoreError>;

    /// Persists the state.
    ///
    /// # Errors
    ///
    /// Returns [`StateStoreError`] when the backing store cannot be written.
    fn save(&self, state: &StackState) -> Result<(), StateStoreError>;
}

/// File-backed state store writing pretty-printed JSON.
#[derive(Clone, Debug)]
pub struct FileStateStore {
    path: Utf8PathBuf,
}

impl FileStateStore {
    /// Default state file location relative to the working directory.
    pub const DEFAULT_PATH: &'static str = ".stratus/state.json";

    /// Builds a store around the given file path.
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn split(&self) -> Result<(&Utf8Path, &str), StateStoreError> {
        let parent = self.path.parent().unwrap_or_else(|| Utf8Path::new("."));
        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| StateStoreError::InvalidPath {
                path: self.path.clone(),
            })?;
        Ok((parent, file_name))
    }
}

impl Default for FileStateStore {
    fn default() -> Self {
        Self::new(Self::DEFAULT_PATH)
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<StackState, StateStoreError> {
        let (parent, file_name) = self.split()?;

        let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(StackState::default());
            }
            Err(err) => {
                return Err(StateStoreError::Io {
                    path: parent.to_path_buf(),
                    message: err.to_string(),
                });
            }
        };

        let exists = dir.try_exists(file_name).map_err(|err| StateStoreError::Io {
            path: self.path.clone(),
            message: err.to_string(),
        })?;
        if !exists {
            return Ok(StackState::default());
        }

        let contents = dir
            .read_to_string(file_name)
            .map_err(|err| StateStoreError::Io {
                path: self.path.clone(),
                message: err.to_string(),
            })?;
        serde_json::from_str(&contents).map_err(|err| StateStoreError::Parse {
            path: self.path.clone(),
            message: err.to_string(),
        })
    }

    fn save(&self, state: &StackState) -> Result<(), StateStoreError> {
        let (parent, file_name) = self.split()?;

        Dir::create_ambient_dir_all(parent, ambient_authority()).map_err(|err| {
            StateStoreError::Io {
                path: parent.to_path_buf(),
                message: err.to_string(),
            }
        })?;
        let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| {
            StateStoreError::Io {
                path: parent.to_path_buf(),
                message: err.to_string(),
            }
        })?;

        let rendered =
            serde_json::to_string_pretty(state).map_err(|err| StateStoreError::Parse {
                path: self.path.clone(),
                message: err.to_string(),
            })?;
        dir.write(file_name, rendered)
            .map_err(|err| StateStoreError::Io {
                path: self.path.clone(),
                message: err.to_string(),
            })
    }
}
