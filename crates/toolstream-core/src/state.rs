//! Shared key/value state mirrored between a run and its client.
//!
//! Both sides hold one JSON object. The server publishes it whole with
//! STATE_SNAPSHOT and mutates it with ordered STATE_DELTA operations; the
//! client applies the same operations with the same function.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single path-addressed operation on the shared state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum StateOp {
    Replace { path: String, value: Value },
}

impl StateOp {
    pub fn replace(path: impl Into<String>, value: Value) -> Self {
        Self::Replace {
            path: path.into(),
            value,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Self::Replace { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("invalid path {0:?}: must start with '/'")]
    InvalidPath(String),
    #[error("cannot address {path:?}: segment {segment:?} is not an object")]
    NotAnObject { path: String, segment: String },
}

/// Apply operations in order. On error the operations before the failing one
/// stay applied.
pub fn apply_ops(state: &mut Value, ops: &[StateOp]) -> Result<(), StateError> {
    for op in ops {
        match op {
            StateOp::Replace { path, value } => replace(state, path, value.clone())?,
        }
    }
    Ok(())
}

/// Path-addressed replace. The empty path replaces the whole document;
/// missing members and intermediate objects are created.
fn replace(state: &mut Value, path: &str, value: Value) -> Result<(), StateError> {
    if path.is_empty() {
        *state = value;
        return Ok(());
    }
    let Some(rest) = path.strip_prefix('/') else {
        return Err(StateError::InvalidPath(path.to_string()));
    };

    let segments: Vec<String> = rest.split('/').map(unescape).collect();
    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| StateError::InvalidPath(path.to_string()))?;

    if state.is_null() {
        *state = Value::Object(Map::new());
    }

    let mut cursor = state;
    for segment in parents {
        let obj = cursor.as_object_mut().ok_or_else(|| StateError::NotAnObject {
            path: path.to_string(),
            segment: segment.clone(),
        })?;
        cursor = obj
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    let obj = cursor.as_object_mut().ok_or_else(|| StateError::NotAnObject {
        path: path.to_string(),
        segment: last.clone(),
    })?;
    obj.insert(last.clone(), value);
    Ok(())
}

fn unescape(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}
