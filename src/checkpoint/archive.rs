//! Access to the zip container written by `torch.save` (PyTorch 1.6 and later).
//!
//! The archive has a single root directory whose name depends on the file name used when
//! saving; it holds `data.pkl` and one `data/<key>` entry per tensor storage.
use super::pickle::StorageLoader;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::sync::Arc;
use zip::ZipArchive;

const ZIP_MAGIC: [u8; 4] = [b'P', b'K', 0x03, 0x04];

/// Returns true when the file starts with a zip local file header.
pub fn is_zip(path: &Path) -> io::Result<bool> {
    let mut magic = [0u8; 4];
    let mut file = File::open(path)?;
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == ZIP_MAGIC),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(err),
    }
}

/// An opened checkpoint archive.
pub struct CheckpointArchive {
    archive: ZipArchive<BufReader<File>>,
    prefix: String,
    cache: HashMap<String, Arc<Vec<u8>>>,
}

impl CheckpointArchive {
    pub fn open(path: &Path) -> Result<Self, zip::result::ZipError> {
        let file = File::open(path)?;
        let archive = ZipArchive::new(BufReader::new(file))?;

        let pickle_entry = archive
            .file_names()
            .filter(|name| *name == "data.pkl" || name.ends_with("/data.pkl"))
            .min_by_key(|name| name.len())
            .map(str::to_string)
            .ok_or(zip::result::ZipError::FileNotFound)?;
        let prefix = pickle_entry.trim_end_matches("data.pkl").to_string();

        Ok(Self {
            archive,
            prefix,
            cache: HashMap::new(),
        })
    }

    /// Raw bytes of the pickled object.
    pub fn pickle(&mut self) -> io::Result<Vec<u8>> {
        let name = format!("{}data.pkl", self.prefix);
        self.read_entry(&name)
    }

    fn read_entry(&mut self, name: &str) -> io::Result<Vec<u8>> {
        let mut file = self.archive.by_name(name)?;
        let mut contents = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut contents)?;
        Ok(contents)
    }
}

impl StorageLoader for CheckpointArchive {
    fn load(&mut self, key: &str) -> io::Result<Arc<Vec<u8>>> {
        if let Some(bytes) = self.cache.get(key) {
            return Ok(bytes.clone());
        }

        let name = format!("{}data/{}", self.prefix, key);
        let bytes = Arc::new(self.read_entry(&name)?);
        self.cache.insert(key.to_string(), bytes.clone());
        Ok(bytes)
    }
}
