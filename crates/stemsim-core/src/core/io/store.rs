use ndarray::{ArrayD, IxDyn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const DATASET_EXTENSION: &str = "bin";
const METADATA_FILE: &str = "metadata.toml";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("File I/O error for '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to encode or decode dataset '{path}': {source}")]
    Encoding {
        path: String,
        source: bincode::Error,
    },
    #[error("TOML serialization error for '{path}': {source}")]
    TomlWrite {
        path: String,
        source: toml::ser::Error,
    },
    #[error("TOML parsing error for '{path}': {source}")]
    TomlRead {
        path: String,
        source: toml::de::Error,
    },
    #[error("Dataset '{name}' in '{path}' is corrupt: shape {shape:?} does not match {len} values")]
    Corrupt {
        path: String,
        name: String,
        shape: Vec<usize>,
        len: usize,
    },
    #[error("Dataset '{name}' does not exist in '{path}'")]
    MissingDataset { path: String, name: String },
    #[error("Invalid dataset name '{0}'")]
    InvalidName(String),
    #[error("Refusing to replace '{path}': '{entry}' does not belong to a dataset store")]
    NotAStore { path: String, entry: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredArray {
    shape: Vec<usize>,
    data: Vec<f64>,
}

/// A directory-backed store of named real-valued datasets plus one metadata
/// document.
///
/// Every dataset is written to a temporary file, flushed to disk and renamed into
/// place, so a dataset observed by [`DatasetStore::read`] is always complete. No
/// file handle outlives a single call.
#[derive(Debug, Clone)]
pub struct DatasetStore {
    root: PathBuf,
}

impl DatasetStore {
    /// Creates an empty store at `root`, discarding the datasets and metadata of
    /// a previous store at the same location.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotAStore`] if `root` exists but holds anything other
    /// than store files, and [`StoreError::Io`] if the directory cannot be
    /// cleared or created.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for file in Self::store_files(&root)? {
            fs::remove_file(&file).map_err(|e| io_error(&file, e))?;
        }
        fs::create_dir_all(&root).map_err(|e| io_error(&root, e))?;
        Ok(Self { root })
    }

    /// Checks that [`DatasetStore::create`] at `root` would only discard store
    /// files. Nothing is modified.
    pub fn check_replaceable(root: &Path) -> Result<(), StoreError> {
        Self::store_files(root).map(|_| ())
    }

    /// Lists the files of an existing store at `root`, or nothing if `root` does
    /// not exist. Any other entry (a subdirectory, a foreign file, a plain file
    /// at `root` itself) is a [`StoreError::NotAStore`].
    fn store_files(root: &Path) -> Result<Vec<PathBuf>, StoreError> {
        let metadata = match fs::symlink_metadata(root) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(root, e)),
        };
        if !metadata.is_dir() {
            return Err(StoreError::NotAStore {
                path: display(root),
                entry: display(root),
            });
        }

        let mut files = Vec::new();
        for entry in fs::read_dir(root).map_err(|e| io_error(root, e))? {
            let entry = entry.map_err(|e| io_error(root, e))?;
            let path = entry.path();
            let is_file = entry
                .file_type()
                .map_err(|e| io_error(&path, e))?
                .is_file();
            if !is_file || !is_store_file(&path) {
                return Err(StoreError::NotAStore {
                    path: display(root),
                    entry: entry.file_name().to_string_lossy().to_string(),
                });
            }
            files.push(path);
        }
        Ok(files)
    }

    /// Opens an existing store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if `root` is not an existing directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(io_error(
                &root,
                std::io::Error::new(std::io::ErrorKind::NotFound, "store directory not found"),
            ));
        }
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn contains(&self, name: &str) -> bool {
        self.dataset_path(name)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    /// Persists `data` under `name`, replacing any previous dataset of that name.
    pub fn write(&self, name: &str, data: &ArrayD<f64>) -> Result<(), StoreError> {
        let path = self.dataset_path(name)?;
        let record = StoredArray {
            shape: data.shape().to_vec(),
            data: data.iter().copied().collect(),
        };
        self.write_atomically(&path, |writer| {
            bincode::serialize_into(writer, &record).map_err(|e| StoreError::Encoding {
                path: display(&path),
                source: e,
            })
        })
    }

    /// Loads the dataset stored under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MissingDataset`] if nothing was written under `name`,
    /// or [`StoreError::Corrupt`] if the stored shape and value count disagree.
    pub fn read(&self, name: &str) -> Result<ArrayD<f64>, StoreError> {
        let path = self.dataset_path(name)?;
        if !path.is_file() {
            return Err(StoreError::MissingDataset {
                path: display(&self.root),
                name: name.to_string(),
            });
        }
        let file = File::open(&path).map_err(|e| io_error(&path, e))?;
        let record: StoredArray =
            bincode::deserialize_from(BufReader::new(file)).map_err(|e| StoreError::Encoding {
                path: display(&path),
                source: e,
            })?;

        let len = record.data.len();
        ArrayD::from_shape_vec(IxDyn(&record.shape), record.data).map_err(|_| {
            StoreError::Corrupt {
                path: display(&self.root),
                name: name.to_string(),
                shape: record.shape,
                len,
            }
        })
    }

    pub fn write_metadata<T: Serialize>(&self, metadata: &T) -> Result<(), StoreError> {
        let path = self.root.join(METADATA_FILE);
        let content = toml::to_string_pretty(metadata).map_err(|e| StoreError::TomlWrite {
            path: display(&path),
            source: e,
        })?;
        self.write_atomically(&path, |writer| {
            writer
                .write_all(content.as_bytes())
                .map_err(|e| io_error(&path, e))
        })
    }

    pub fn read_metadata<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        let path = self.root.join(METADATA_FILE);
        let content = fs::read_to_string(&path).map_err(|e| io_error(&path, e))?;
        toml::from_str(&content).map_err(|e| StoreError::TomlRead {
            path: display(&path),
            source: e,
        })
    }

    /// Deletes the store and everything in it.
    pub fn remove(self) -> Result<(), StoreError> {
        fs::remove_dir_all(&self.root).map_err(|e| io_error(&self.root, e))
    }

    fn dataset_path(&self, name: &str) -> Result<PathBuf, StoreError> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
            && !name.starts_with('.');
        if !valid {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        Ok(self.root.join(format!("{}.{}", name, DATASET_EXTENSION)))
    }

    fn write_atomically<F>(&self, path: &Path, write: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut BufWriter<File>) -> Result<(), StoreError>,
    {
        let tmp_path = path.with_extension("tmp");
        let file = File::create(&tmp_path).map_err(|e| io_error(&tmp_path, e))?;
        let mut writer = BufWriter::new(file);
        write(&mut writer)?;
        let file = writer
            .into_inner()
            .map_err(|e| io_error(&tmp_path, e.into_error()))?;
        file.sync_all().map_err(|e| io_error(&tmp_path, e))?;
        fs::rename(&tmp_path, path).map_err(|e| io_error(path, e))
    }
}

fn is_store_file(path: &Path) -> bool {
    if path.file_name().is_some_and(|name| name == METADATA_FILE) {
        return true;
    }
    let named = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .is_some_and(|stem| !stem.is_empty() && !stem.starts_with('.'));
    let extension = path.extension().and_then(|ext| ext.to_str());
    named && matches!(extension, Some(DATASET_EXTENSION) | Some("tmp"))
}

fn display(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: display(path),
        source,
    }
}
