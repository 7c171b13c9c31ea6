//! Persistent gallery of known-person encodings.
//!
//! The store is a JSON document with two index-aligned arrays:
//! `{"encodings": [[f32, ...], ...], "names": ["alice", ...]}`. Writes go to
//! a sibling temp file which is synced and renamed over the store.

use crate::analyzer::FaceAnalyzer;
use crate::types::{FaceEncoding, GalleryEntry};
use doorwatch_media::Frame;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp"];

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery store {path} is corrupt: {reason}")]
    CorruptStore { path: PathBuf, reason: String },
    #[error("encoding has {actual} dimensions, gallery uses {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("gallery I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not lock gallery at {path}: {reason}")]
    Lock { path: PathBuf, reason: String },
}

impl GalleryError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn corrupt(path: &Path, reason: impl Into<String>) -> Self {
        Self::CorruptStore {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

/// On-disk layout.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreRecord {
    encodings: Vec<Vec<f32>>,
    names: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddReport {
    pub added: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GalleryStats {
    /// Encodings per person, in order of first appearance.
    pub per_person: Vec<(String, usize)>,
    pub persons: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FaceGallery {
    path: Option<PathBuf>,
    entries: Vec<GalleryEntry>,
}

impl FaceGallery {
    /// Load the store at `path`. An absent store is an empty gallery.
    pub fn load(path: &Path) -> Result<Self, GalleryError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no gallery store yet, starting empty");
                return Ok(Self {
                    path: Some(path.to_path_buf()),
                    entries: Vec::new(),
                });
            }
            Err(e) => return Err(GalleryError::io(path, e)),
        };

        let record: StoreRecord =
            serde_json::from_slice(&bytes).map_err(|e| GalleryError::corrupt(path, e.to_string()))?;
        if record.encodings.len() != record.names.len() {
            return Err(GalleryError::corrupt(
                path,
                format!("{} encodings but {} names", record.encodings.len(), record.names.len()),
            ));
        }

        let entries: Vec<GalleryEntry> = record
            .names
            .into_iter()
            .zip(record.encodings)
            .map(|(name, values)| GalleryEntry {
                name,
                encoding: FaceEncoding::new(values),
            })
            .collect();
        check_uniform(&entries).map_err(|e| GalleryError::corrupt(path, e.to_string()))?;

        tracing::info!(path = %path.display(), entries = entries.len(), "gallery loaded");
        Ok(Self {
            path: Some(path.to_path_buf()),
            entries,
        })
    }

    /// In-memory gallery with no backing store.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<GalleryEntry>) -> Result<Self, GalleryError> {
        check_uniform(&entries)?;
        Ok(Self { path: None, entries })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Dimensionality shared by every entry, `None` while empty.
    pub fn dimension(&self) -> Option<usize> {
        self.entries.first().map(|e| e.encoding.dimension())
    }

    fn push(&mut self, name: &str, encoding: FaceEncoding) -> Result<(), GalleryError> {
        if let Some(expected) = self.dimension() {
            if encoding.dimension() != expected {
                return Err(GalleryError::DimensionMismatch {
                    expected,
                    actual: encoding.dimension(),
                });
            }
        }
        self.entries.push(GalleryEntry {
            name: name.to_string(),
            encoding,
        });
        Ok(())
    }

    /// Encode the largest face of each image and append it under `name`.
    ///
    /// Images that cannot be decoded or contain no face are skipped. The
    /// store is rewritten when anything was added.
    pub fn add_person<A: FaceAnalyzer + ?Sized>(
        &mut self,
        name: &str,
        images: &[PathBuf],
        encoder: &mut A,
    ) -> Result<AddReport, GalleryError> {
        let mut report = AddReport::default();
        for (seq, image) in images.iter().enumerate() {
            match encode_image(image, seq as u64, encoder) {
                Some(encoding) => {
                    self.push(name, encoding)?;
                    report.added += 1;
                    tracing::debug!(person = name, image = %image.display(), "encoded face");
                }
                None => report.skipped += 1,
            }
        }

        tracing::info!(person = name, added = report.added, skipped = report.skipped, "add person finished");
        if report.added > 0 {
            self.save()?;
        }
        Ok(report)
    }

    /// Drop every entry for `name`. Returns how many were removed.
    pub fn remove_person(&mut self, name: &str) -> Result<usize, GalleryError> {
        let before = self.entries.len();
        self.entries.retain(|e| e.name != name);
        let removed = before - self.entries.len();

        if removed == 0 {
            tracing::info!(person = name, "no encodings to remove");
        } else {
            tracing::info!(person = name, removed, "removed encodings");
            self.save()?;
        }
        Ok(removed)
    }

    /// Re-encode every person directory from scratch and replace the store at `path`.
    pub fn rebuild_all<A: FaceAnalyzer + ?Sized>(
        path: &Path,
        person_dirs: &[(String, PathBuf)],
        encoder: &mut A,
    ) -> Result<(Self, AddReport), GalleryError> {
        let mut gallery = Self {
            path: Some(path.to_path_buf()),
            entries: Vec::new(),
        };
        let mut total = AddReport::default();

        for (name, dir) in person_dirs {
            let images = list_images(dir)?;
            for (seq, image) in images.iter().enumerate() {
                match encode_image(image, seq as u64, encoder) {
                    Some(encoding) => {
                        gallery.push(name, encoding)?;
                        total.added += 1;
                    }
                    None => total.skipped += 1,
                }
            }
            tracing::info!(person = %name, images = images.len(), "person re-encoded");
        }

        gallery.save()?;
        Ok((gallery, total))
    }

    /// Atomically write the store: temp file, fsync, rename.
    pub fn save(&self) -> Result<(), GalleryError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| GalleryError::io(parent, e))?;
        }

        let record = StoreRecord {
            encodings: self.entries.iter().map(|e| e.encoding.values().to_vec()).collect(),
            names: self.entries.iter().map(|e| e.name.clone()).collect(),
        };
        let json = serde_json::to_vec(&record).map_err(|e| GalleryError::corrupt(path, e.to_string()))?;

        let tmp = temp_path(path);
        let mut file = File::create(&tmp).map_err(|e| GalleryError::io(&tmp, e))?;
        file.write_all(&json).map_err(|e| GalleryError::io(&tmp, e))?;
        file.sync_all().map_err(|e| GalleryError::io(&tmp, e))?;
        drop(file);
        fs::rename(&tmp, path).map_err(|e| GalleryError::io(path, e))?;

        tracing::info!(path = %path.display(), entries = self.entries.len(), "gallery saved");
        Ok(())
    }

    pub fn stats(&self) -> GalleryStats {
        let mut per_person: Vec<(String, usize)> = Vec::new();
        for entry in &self.entries {
            match per_person.iter_mut().find(|(name, _)| *name == entry.name) {
                Some((_, count)) => *count += 1,
                None => per_person.push((entry.name.clone(), 1)),
            }
        }
        GalleryStats {
            persons: per_person.len(),
            total: self.entries.len(),
            per_person,
        }
    }

    /// Distinct names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.name.clone()).collect();
        names.sort();
        names.dedup();
        names
    }
}

fn check_uniform(entries: &[GalleryEntry]) -> Result<(), GalleryError> {
    let Some(first) = entries.first() else {
        return Ok(());
    };
    let expected = first.encoding.dimension();
    match entries.iter().find(|e| e.encoding.dimension() != expected) {
        Some(odd) => Err(GalleryError::DimensionMismatch {
            expected,
            actual: odd.encoding.dimension(),
        }),
        None => Ok(()),
    }
}

fn encode_image<A: FaceAnalyzer + ?Sized>(path: &Path, seq: u64, encoder: &mut A) -> Option<FaceEncoding> {
    let image = match image::open(path) {
        Ok(image) => image.to_rgb8(),
        Err(e) => {
            tracing::warn!(image = %path.display(), error = %e, "cannot decode image, skipping");
            return None;
        }
    };
    let frame = Frame::new(image, chrono::Local::now(), seq);
    match encoder.encode_largest(&frame) {
        Ok(Some(encoding)) => Some(encoding),
        Ok(None) => {
            tracing::warn!(image = %path.display(), "no face found, skipping");
            None
        }
        Err(e) => {
            tracing::warn!(image = %path.display(), error = %e, "face analysis failed, skipping");
            None
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Image files directly inside `dir`, sorted by file name.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>, GalleryError> {
    let read = fs::read_dir(dir).map_err(|e| GalleryError::io(dir, e))?;
    let mut images: Vec<PathBuf> = read
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .filter(|p| {
            p.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        })
        .collect();
    images.sort();
    Ok(images)
}

/// `(person, directory)` for each subdirectory of `root`, sorted by name.
pub fn person_directories(root: &Path) -> Result<Vec<(String, PathBuf)>, GalleryError> {
    let read = fs::read_dir(root).map_err(|e| GalleryError::io(root, e))?;
    let mut dirs: Vec<(String, PathBuf)> = read
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .filter_map(|p| Some((p.file_name()?.to_str()?.to_string(), p.clone())))
        .collect();
    dirs.sort();
    Ok(dirs)
}

/// Exclusive advisory lock serializing gallery mutations across processes.
///
/// Held until dropped.
pub struct GalleryLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl GalleryLock {
    /// Block until `<store>.lock` is exclusively held.
    pub fn acquire(store_path: &Path) -> Result<Self, GalleryError> {
        let mut name = store_path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".lock");
        let path = store_path.with_file_name(name);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| GalleryError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| GalleryError::io(&path, e))?;

        let lock = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| GalleryError::Lock {
            path: path.clone(),
            reason: errno.desc().to_string(),
        })?;
        tracing::debug!(path = %path.display(), "gallery lock acquired");
        Ok(Self { _lock: lock, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
