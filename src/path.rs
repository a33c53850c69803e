//! Path objects over registered volumes.
//!
//! A path is `<device_name>:<sep><component>(<sep><component>)*`, with
//! Unix-style device names (`/dev/<name>`) omitting the colon. Separators
//! are `/` and `\`. Component matching is case-insensitive on disk (short
//! names are stored upper case) but case-preserving through long names.

use crate::clock::DateTime;
use crate::dir::{DirEntry, Directory};
use crate::file::{FatFile, Mode};
use crate::fs::FileSystem;
use crate::registry::VolumeRegistry;
use crate::{FsError, Result};

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

/// One parsed path, bound to its volume at construction time.
#[derive(Clone)]
pub struct FatPath {
    device_name: String,
    fs: Arc<FileSystem>,
    /// Normalized components; empty means the volume root.
    components: Vec<String>,
}

impl FatPath {
    /// Parse `spec` and resolve its device against `registry`.
    pub fn new(registry: &VolumeRegistry, spec: &str) -> Result<FatPath> {
        let (device_name, rest) = split_device(spec)?;
        let fs = registry
            .lookup(&device_name)
            .ok_or(FsError::FileNotFound)?;
        Ok(FatPath {
            device_name,
            fs,
            components: normalize(&rest),
        })
    }

    /// A path on an already-mounted volume, bypassing the registry.
    pub fn on_volume(fs: Arc<FileSystem>, device_name: &str, path: &str) -> FatPath {
        FatPath {
            device_name: device_name.to_string(),
            fs,
            components: normalize(path),
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn volume(&self) -> &Arc<FileSystem> {
        &self.fs
    }

    /// The final component, empty for the root.
    pub fn name(&self) -> &str {
        self.components.last().map(String::as_str).unwrap_or("")
    }

    /// Path to the parent (the root is its own parent).
    pub fn parent(&self) -> FatPath {
        let mut components = self.components.clone();
        components.pop();
        FatPath {
            device_name: self.device_name.clone(),
            fs: Arc::clone(&self.fs),
            components,
        }
    }

    /// Child path below this one.
    pub fn join(&self, component: &str) -> FatPath {
        let mut components = self.components.clone();
        for piece in normalize(component) {
            components.push(piece);
        }
        FatPath {
            device_name: self.device_name.clone(),
            fs: Arc::clone(&self.fs),
            components,
        }
    }

    fn is_volume_root(&self) -> bool {
        self.components.is_empty()
    }

    /// The directory holding this path's entry.
    fn parent_dir(&self) -> Result<Directory> {
        let root = self.fs.root_dir();
        if self.components.len() <= 1 {
            return Ok(root);
        }
        let refs: Vec<&str> = self.components[..self.components.len() - 1]
            .iter()
            .map(String::as_str)
            .collect();
        root.resolve(&refs)
    }

    /// The directory entry this path names, if it exists.
    fn entry(&self) -> Result<Option<DirEntry>> {
        if self.is_volume_root() {
            return Ok(None);
        }
        self.parent_dir()?.find(self.name())
    }

    /// The directory this path names (the root, or a subdirectory entry).
    fn as_dir(&self) -> Result<Directory> {
        if self.is_volume_root() {
            return Ok(self.fs.root_dir());
        }
        let parent = self.parent_dir()?;
        let entry = parent.find(self.name())?.ok_or(FsError::FileNotFound)?;
        parent.sub_dir(&entry)
    }

    // ------------------------------------------------------------------
    // attribute queries

    pub fn exists(&self) -> bool {
        if self.is_volume_root() {
            return true;
        }
        matches!(self.entry(), Ok(Some(_)))
    }

    pub fn is_directory(&self) -> bool {
        if self.is_volume_root() {
            return true;
        }
        matches!(self.entry(), Ok(Some(e)) if e.is_dir())
    }

    pub fn is_file(&self) -> bool {
        matches!(self.entry(), Ok(Some(e)) if e.short.is_file())
    }

    pub fn is_hidden(&self) -> bool {
        matches!(self.entry(), Ok(Some(e)) if e.short.is_hidden())
    }

    /// File length in bytes; 0 for directories and missing paths.
    pub fn length(&self) -> u64 {
        match self.entry() {
            Ok(Some(e)) if !e.is_dir() => e.file_size() as u64,
            _ => 0,
        }
    }

    pub fn last_modified(&self) -> Option<DateTime> {
        self.entry().ok().flatten().map(|e| e.short.modified())
    }

    pub fn creation_time(&self) -> Option<DateTime> {
        self.entry().ok().flatten().map(|e| e.short.created())
    }

    // ------------------------------------------------------------------
    // listing

    /// Names in this directory, long-name case preserved.
    pub fn list(&self) -> Result<Vec<String>> {
        Ok(self
            .as_dir()?
            .list()?
            .into_iter()
            .map(|e| e.name)
            .collect())
    }

    /// Names accepted by `filter` (globbing hook: the predicate sees the
    /// whole entry).
    pub fn list_with(&self, filter: impl Fn(&DirEntry) -> bool) -> Result<Vec<String>> {
        Ok(self
            .as_dir()?
            .list()?
            .into_iter()
            .filter(|e| filter(e))
            .map(|e| e.name)
            .collect())
    }

    // ------------------------------------------------------------------
    // mutation

    /// Create the named file; false when it already exists.
    pub fn create_new_file(&self) -> Result<bool> {
        if self.is_volume_root() {
            return Ok(false);
        }
        match self.parent_dir()?.create_file(self.name(), 0) {
            Ok(_) => Ok(true),
            Err(FsError::NameAlreadyExists) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Create the named directory; false when it exists or the parent is
    /// missing.
    pub fn mkdir(&self) -> bool {
        if self.is_volume_root() {
            return false;
        }
        match self.parent_dir() {
            Ok(parent) => parent.create_dir(self.name()).is_ok(),
            Err(_) => false,
        }
    }

    /// Create the directory and any missing ancestors.
    pub fn mkdirs(&self) -> bool {
        if self.is_volume_root() {
            return true;
        }
        let mut dir = self.fs.root_dir();
        for comp in &self.components {
            match dir.find(comp) {
                Ok(Some(entry)) if entry.is_dir() => match dir.sub_dir(&entry) {
                    Ok(sub) => dir = sub,
                    Err(_) => return false,
                },
                Ok(Some(_)) => return false, // a file is in the way
                Ok(None) => match dir.create_dir(comp) {
                    Ok(entry) => match dir.sub_dir(&entry) {
                        Ok(sub) => dir = sub,
                        Err(_) => return false,
                    },
                    Err(_) => return false,
                },
                Err(_) => return false,
            }
        }
        true
    }

    /// Delete a file or an *empty* directory; false otherwise.
    pub fn delete(&self) -> bool {
        if self.is_volume_root() {
            return false;
        }
        match self.parent_dir() {
            Ok(parent) => parent.remove(self.name()).unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Rename/move within one volume; a cross-volume destination returns
    /// false. Missing destination parents are created.
    pub fn rename_to(&self, dest: &FatPath) -> bool {
        if !Arc::ptr_eq(&self.fs, &dest.fs) {
            return false;
        }
        if self.is_volume_root() || dest.is_volume_root() {
            return false;
        }
        if !dest.parent().is_volume_root() && !dest.parent().mkdirs() {
            return false;
        }
        let (src_dir, dst_dir) = match (self.parent_dir(), dest.parent_dir()) {
            (Ok(s), Ok(d)) => (s, d),
            _ => return false,
        };
        src_dir.rename(self.name(), &dst_dir, dest.name()).is_ok()
    }

    pub fn set_last_modified(&self, when: DateTime) -> Result<()> {
        let time = when.fat_time()?;
        let date = when.fat_date()?;
        let entry = self.entry()?.ok_or(FsError::FileNotFound)?;
        self.fs.update_short_entry(entry.pos, |sde| {
            sde.wrt_time = time;
            sde.wrt_date = date;
            sde.lst_acc_date = date;
        })
    }

    /// Open the named file with `"r"` or `"rw"`.
    pub fn open(&self, mode: &str) -> Result<FatFile> {
        let mode = Mode::parse(mode)?;
        self.parent_dir()?.open_file(self.name(), mode)
    }
}

/// Split the device prefix off a path spec.
fn split_device(spec: &str) -> Result<(String, String)> {
    if let Some(rest) = spec.strip_prefix("/dev/") {
        // Unix-style device names omit the colon: `/dev/hda/FOO/BAR`.
        let end = rest.find(['/', '\\']).unwrap_or(rest.len());
        if end == 0 {
            return Err(FsError::IllegalName);
        }
        let device = format!("/dev/{}", &rest[..end]);
        return Ok((device, rest[end..].to_string()));
    }
    match spec.find(':') {
        Some(0) | None => Err(FsError::IllegalName),
        Some(i) => Ok((spec[..i].to_string(), spec[i + 1..].to_string())),
    }
}

/// Split on separators, dropping empty and `.` components and resolving
/// `..` lexically.
fn normalize(path: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for piece in path.split(['/', '\\']) {
        match piece {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            other => out.push(other.to_string()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_prefix_forms() {
        let (dev, rest) = split_device("vol0:/A/B.TXT").unwrap();
        assert_eq!(dev, "vol0");
        assert_eq!(rest, "/A/B.TXT");

        let (dev, rest) = split_device("/dev/hda/A/B.TXT").unwrap();
        assert_eq!(dev, "/dev/hda");
        assert_eq!(rest, "/A/B.TXT");

        let (dev, rest) = split_device("/dev/hda").unwrap();
        assert_eq!(dev, "/dev/hda");
        assert_eq!(rest, "");

        assert!(split_device("no-device").is_err());
    }

    #[test]
    fn components_normalized() {
        assert_eq!(normalize("/A//B/./C"), ["A", "B", "C"]);
        assert_eq!(normalize("A\\B"), ["A", "B"]);
        assert_eq!(normalize("/A/../B"), ["B"]);
        assert!(normalize("/").is_empty());
    }
}
