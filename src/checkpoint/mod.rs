//! PyTorch checkpoint support.
//!
//! A checkpoint is read into a [StateDict]: the stored keys mapped to their values, in the
//! order they were stored. Tensors are materialized in host memory, whatever device the
//! checkpoint was produced on; any other value is kept as a described [Entry::Other] so
//! loading can still report it.

mod archive;
pub mod pickle;

use burn::tensor::TensorData;
use pickle::{Object, PickleError, Unpickler};
use std::io::Cursor;
use std::path::Path;
use std::rc::Rc;

/// Substring inserted in every parameter name by replicated-training wrappers.
pub const WRAPPER_PREFIX: &str = "module.";

/// Error raised while reading a checkpoint file.
#[derive(thiserror::Error, Debug)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Pickle error: {0}")]
    Pickle(#[from] PickleError),

    #[error(
        "Unsupported checkpoint format: expected a zip archive written by torch.save (PyTorch >= 1.6)"
    )]
    UnsupportedFormat,

    #[error("Checkpoint does not hold a dictionary of tensors (found {0})")]
    NotAStateDict(String),
}

/// Value stored under a state dict key.
#[derive(Debug, Clone)]
pub enum Entry {
    Tensor(TensorData),
    /// Anything else, described by its Python type (e.g. `int`, `dict`).
    Other(String),
}

impl From<TensorData> for Entry {
    fn from(data: TensorData) -> Self {
        Self::Tensor(data)
    }
}

/// Keys mapped to values, in storage order.
#[derive(Debug, Clone, Default)]
pub struct StateDict {
    entries: Vec<(String, Entry)>,
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry, replacing the value of an existing name in place.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Entry>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(key, _)| *key == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Tensor stored under `name`, `None` when absent or not a tensor.
    pub fn get(&self, name: &str) -> Option<&TensorData> {
        match self.entry(name)? {
            Entry::Tensor(data) => Some(data),
            Entry::Other(_) => None,
        }
    }

    pub fn entry(&self, name: &str) -> Option<&Entry> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    pub fn first_key(&self) -> Option<&str> {
        self.entries.first().map(|(key, _)| key.as_str())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Entry)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Strips the replicated-training wrapper prefix.
    ///
    /// Only the first key is inspected: when it contains [WRAPPER_PREFIX], every occurrence of
    /// that substring is removed from every key. A checkpoint whose first key is clean is
    /// returned untouched, even if later keys carry the prefix. Returns whether keys were
    /// rewritten.
    pub fn strip_wrapper_prefix(&mut self) -> bool {
        let wrapped = self
            .first_key()
            .is_some_and(|key| key.contains(WRAPPER_PREFIX));

        if wrapped {
            for (key, _) in self.entries.iter_mut() {
                *key = key.replace(WRAPPER_PREFIX, "");
            }
        }

        wrapped
    }
}

/// Dotted parameter name under construction, e.g. `model.layer1.0.conv1`.
#[derive(Debug, Clone, Default)]
pub struct KeyPath {
    segments: Vec<String>,
}

impl KeyPath {
    pub fn push(&mut self, segment: impl std::fmt::Display) {
        self.segments.push(segment.to_string());
    }

    pub fn pop(&mut self) {
        self.segments.pop();
    }

    /// Full name of `leaf` under the current path.
    pub fn key(&self, leaf: &str) -> String {
        let mut key = self.segments.join(".");
        if !key.is_empty() {
            key.push('.');
        }
        key.push_str(leaf);
        key
    }
}

impl IntoIterator for StateDict {
    type Item = (String, Entry);
    type IntoIter = std::vec::IntoIter<(String, Entry)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<V: Into<Entry>> FromIterator<(String, V)> for StateDict {
    fn from_iter<I: IntoIterator<Item = (String, V)>>(iter: I) -> Self {
        let mut state = StateDict::new();
        for (name, value) in iter {
            state.insert(name, value);
        }
        state
    }
}

/// Reads a `torch.save`'d state dict.
pub fn load_checkpoint(path: &Path) -> Result<StateDict, CheckpointError> {
    if !archive::is_zip(path)? {
        return Err(CheckpointError::UnsupportedFormat);
    }

    let mut archive = archive::CheckpointArchive::open(path)?;
    let pickle = archive.pickle()?;
    let object = Unpickler::new(&mut archive).load(&mut Cursor::new(pickle))?;

    let entries = match object {
        Object::Dict(entries) => entries,
        other => return Err(CheckpointError::NotAStateDict(type_name(&other))),
    };

    let state: StateDict = entries
        .into_iter()
        .map(|(key, value)| {
            let entry = match value {
                Object::Tensor(data) => {
                    Entry::Tensor(Rc::try_unwrap(data).unwrap_or_else(|shared| (*shared).clone()))
                }
                other => Entry::Other(type_name(&other)),
            };
            (key, entry)
        })
        .collect();

    let others = state
        .iter()
        .filter(|(_, entry)| matches!(entry, Entry::Other(_)))
        .count();
    log::debug!(
        "Read {} entries ({others} not tensors) from {}",
        state.len(),
        path.display()
    );

    Ok(state)
}

/// Python type of an unpickled value.
fn type_name(object: &Object) -> String {
    match object {
        Object::Tensor(_) => "Tensor",
        Object::Int(_) => "int",
        Object::Float(_) => "float",
        Object::Bool(_) => "bool",
        Object::String(_) => "str",
        Object::None => "NoneType",
        Object::Tuple(_) => "tuple",
        Object::List(_) => "list",
        Object::Dict(_) => "dict",
        Object::Class { module_name, name } => return format!("{module_name}.{name}"),
        _ => "object",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(keys: &[&str]) -> StateDict {
        keys.iter()
            .map(|key| (key.to_string(), TensorData::new(vec![0.0f32], [1])))
            .collect()
    }

    #[test]
    fn strips_prefix_from_every_key() {
        let mut state = state(&["module.model.conv1.weight", "module.model.fc.bias"]);
        assert!(state.strip_wrapper_prefix());
        let keys: Vec<_> = state.keys().collect();
        assert_eq!(keys, ["model.conv1.weight", "model.fc.bias"]);
    }

    #[test]
    fn removes_the_substring_anywhere_in_the_key() {
        let mut state = state(&["model.module.weight", "a.module.b.module.c"]);
        assert!(state.strip_wrapper_prefix());
        let keys: Vec<_> = state.keys().collect();
        assert_eq!(keys, ["model.weight", "a.b.c"]);
    }

    #[test]
    fn only_the_first_key_is_inspected() {
        let mut state = state(&["model.conv1.weight", "module.model.fc.bias"]);
        assert!(!state.strip_wrapper_prefix());
        let keys: Vec<_> = state.keys().collect();
        assert_eq!(keys, ["model.conv1.weight", "module.model.fc.bias"]);
    }

    #[test]
    fn non_tensor_entries_count_as_the_first_key() {
        let mut state = StateDict::new();
        state.insert("epoch", Entry::Other("int".to_string()));
        state.insert("module.model.fc.bias", TensorData::new(vec![0.0f32], [1]));

        assert!(!state.strip_wrapper_prefix());
        assert_eq!(state.first_key(), Some("epoch"));
        assert!(state.get("epoch").is_none());
        assert!(matches!(state.entry("epoch"), Some(Entry::Other(kind)) if kind == "int"));
    }

    #[test]
    fn empty_state_is_left_alone() {
        let mut state = StateDict::new();
        assert!(!state.strip_wrapper_prefix());
        assert!(state.is_empty());
    }

    #[test]
    fn insert_keeps_position_of_existing_names() {
        let mut state = state(&["b", "a"]);
        state.insert("b", TensorData::new(vec![1.0f32, 2.0], [2]));
        assert_eq!(state.first_key(), Some("b"));
        assert_eq!(state.get("b").unwrap().shape, vec![2]);
        assert_eq!(state.len(), 2);
    }

    #[test]
    fn non_zip_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.pth");
        std::fs::write(&path, [0x80, 0x02, b'.']).unwrap();

        let err = load_checkpoint(&path).unwrap_err();
        assert!(matches!(err, CheckpointError::UnsupportedFormat));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_checkpoint(&dir.path().join("absent.pth")).unwrap_err();
        assert!(matches!(err, CheckpointError::Io(_)));
    }
}
