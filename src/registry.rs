//! Process-wide catalog of mounted volumes.
//!
//! Volumes are indexed by device name and reference-counted per attach.
//! Durable backends are recorded in a newline-delimited manifest file,
//! one record per line:
//!
//!   <device_name>\t<size_in_bytes>\t<backend_kind>
//!
//! `RAF` volumes are host-filesystem-backed images (the name is the image
//! path), `NATIVE` raw partitions; `RAM` volumes live and die with the
//! process and are never recorded. Booting a registry replays the
//! manifest, re-mounting each entry; entries that fail to parse or mount
//! are skipped with a logged message and stay in the manifest. Removing a
//! volume rewrites the manifest without its line.

use crate::clock::Clock;
use crate::device::{BlockDevice, ImageDevice, RamDevice};
use crate::fs::FileSystem;
use crate::{FsError, Result};

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Host-filesystem-backed image file.
    Raf,
    /// In-memory volume; never recorded in the manifest.
    Ram,
    /// Raw partition / device node.
    Native,
}

impl BackendKind {
    fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Raf => "RAF",
            BackendKind::Ram => "RAM",
            BackendKind::Native => "NATIVE",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "RAF" => Some(BackendKind::Raf),
            "RAM" => Some(BackendKind::Ram),
            "NATIVE" => Some(BackendKind::Native),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct ManifestEntry {
    name: String,
    size_bytes: u64,
    kind: BackendKind,
}

struct Mounted {
    fs: Arc<FileSystem>,
    kind: BackendKind,
    attaches: u32,
}

/// The catalog. Tests build their own with a private manifest path; hosts
/// normally use [`default_registry`].
pub struct VolumeRegistry {
    manifest_path: PathBuf,
    clock: Arc<dyn Clock>,
    volumes: Mutex<BTreeMap<String, Mounted>>,
    /// Every durable record, including ones that failed to re-mount; the
    /// manifest is rewritten from this list.
    recorded: Mutex<Vec<ManifestEntry>>,
}

impl VolumeRegistry {
    /// An empty registry writing to `manifest_path`.
    pub fn new<P: AsRef<Path>>(manifest_path: P, clock: Arc<dyn Clock>) -> Self {
        Self {
            manifest_path: manifest_path.as_ref().to_path_buf(),
            clock,
            volumes: Mutex::new(BTreeMap::new()),
            recorded: Mutex::new(Vec::new()),
        }
    }

    /// Boot-time construction: replay the manifest, re-mounting each entry
    /// and skipping whatever fails.
    pub fn boot<P: AsRef<Path>>(manifest_path: P, clock: Arc<dyn Clock>) -> Self {
        let registry = Self::new(manifest_path, clock);
        registry.replay();
        registry
    }

    fn replay(&self) {
        let mut content = String::new();
        match std::fs::File::open(&self.manifest_path) {
            Ok(mut f) => {
                if f.read_to_string(&mut content).is_err() {
                    log::warn!("manifest {:?} unreadable, starting empty", self.manifest_path);
                    return;
                }
            }
            Err(_) => return, // no manifest yet
        }

        for line in content.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let entry = match Self::parse_line(line) {
                Some(entry) => entry,
                None => {
                    log::warn!("manifest: skipping unparseable line: {:?}", line);
                    continue;
                }
            };
            self.recorded.lock().push(entry.clone());

            match self.mount_backend(&entry) {
                Ok(fs) => {
                    self.volumes.lock().insert(
                        entry.name.clone(),
                        Mounted {
                            fs,
                            kind: entry.kind,
                            attaches: 0,
                        },
                    );
                    log::info!("manifest: re-mounted {}", entry.name);
                }
                Err(e) => {
                    log::warn!("manifest: skipping {}: {}", entry.name, e);
                }
            }
        }
    }

    fn parse_line(line: &str) -> Option<ManifestEntry> {
        let mut fields = line.split('\t');
        let name = fields.next()?.to_string();
        let size_bytes: u64 = fields.next()?.parse().ok()?;
        let kind = BackendKind::parse(fields.next()?)?;
        if fields.next().is_some() || name.is_empty() {
            return None;
        }
        Some(ManifestEntry {
            name,
            size_bytes,
            kind,
        })
    }

    fn mount_backend(&self, entry: &ManifestEntry) -> Result<Arc<FileSystem>> {
        let device: Arc<dyn BlockDevice> = match entry.kind {
            BackendKind::Raf | BackendKind::Native => ImageDevice::open(&entry.name, 512)?,
            BackendKind::Ram => RamDevice::new(entry.size_bytes / 512, 512),
        };
        FileSystem::mount(device, Arc::clone(&self.clock))
    }

    /// Register an already-built device under `name`, mounting it and (for
    /// durable backends) appending a manifest record.
    pub fn register(
        &self,
        name: &str,
        device: Arc<dyn BlockDevice>,
        kind: BackendKind,
    ) -> Result<Arc<FileSystem>> {
        if name.is_empty() || name.contains('\t') || name.contains('\n') {
            return Err(FsError::IllegalName);
        }
        if self.volumes.lock().contains_key(name) {
            return Err(FsError::NameAlreadyExists);
        }

        let size_bytes = device.num_sectors() * device.sector_size() as u64;
        let fs = FileSystem::mount(device, Arc::clone(&self.clock))?;
        self.volumes.lock().insert(
            name.to_string(),
            Mounted {
                fs: Arc::clone(&fs),
                kind,
                attaches: 1,
            },
        );

        if kind != BackendKind::Ram {
            let entry = ManifestEntry {
                name: name.to_string(),
                size_bytes,
                kind,
            };
            self.recorded.lock().push(entry.clone());
            if let Err(e) = self.append_line(&entry) {
                log::warn!("manifest: could not record {}: {}", name, e);
            }
        }
        Ok(fs)
    }

    fn append_line(&self, entry: &ManifestEntry) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.manifest_path)
            .map_err(|_| FsError::IoError)?;
        writeln!(
            file,
            "{}\t{}\t{}",
            entry.name,
            entry.size_bytes,
            entry.kind.as_str()
        )
        .map_err(|_| FsError::IoError)
    }

    fn rewrite_manifest(&self) -> Result<()> {
        let recorded = self.recorded.lock();
        let mut out = String::new();
        for entry in recorded.iter() {
            out.push_str(&entry.name);
            out.push('\t');
            out.push_str(&entry.size_bytes.to_string());
            out.push('\t');
            out.push_str(entry.kind.as_str());
            out.push('\n');
        }
        std::fs::write(&self.manifest_path, out).map_err(|_| FsError::IoError)
    }

    /// Attach to a mounted volume, bumping its refcount.
    pub fn attach(&self, name: &str) -> Option<Arc<FileSystem>> {
        let mut volumes = self.volumes.lock();
        let mounted = volumes.get_mut(name)?;
        mounted.attaches += 1;
        Some(Arc::clone(&mounted.fs))
    }

    /// Drop one attach reference.
    pub fn detach(&self, name: &str) -> Result<()> {
        let mut volumes = self.volumes.lock();
        let mounted = volumes.get_mut(name).ok_or(FsError::FileNotFound)?;
        mounted.attaches = mounted.attaches.saturating_sub(1);
        log::debug!("{}: {} attaches remain", name, mounted.attaches);
        Ok(())
    }

    /// Look a volume up without touching the refcount (the path layer's
    /// resolution step).
    pub fn lookup(&self, name: &str) -> Option<Arc<FileSystem>> {
        self.volumes.lock().get(name).map(|m| Arc::clone(&m.fs))
    }

    pub fn names(&self) -> Vec<String> {
        self.volumes.lock().keys().cloned().collect()
    }

    /// Dismount and drop a volume, rewriting the manifest without it.
    pub fn remove(&self, name: &str) -> Result<()> {
        let mounted = self
            .volumes
            .lock()
            .remove(name)
            .ok_or(FsError::FileNotFound)?;
        let dismount_result = mounted.fs.dismount();

        self.recorded.lock().retain(|e| e.name != name);
        if mounted.kind != BackendKind::Ram {
            self.rewrite_manifest()?;
        }
        dismount_result
    }

    /// Teardown: dismount everything, leave the manifest as it stands.
    pub fn shutdown(&self) {
        let mut volumes = self.volumes.lock();
        for (name, mounted) in volumes.iter() {
            if let Err(e) = mounted.fs.dismount() {
                log::warn!("shutdown: dismounting {} failed: {}", name, e);
            }
        }
        volumes.clear();
    }
}

lazy_static::lazy_static! {
    static ref DEFAULT_REGISTRY: VolumeRegistry = VolumeRegistry::boot(
        "fat-volumes.manifest",
        Arc::new(crate::clock::SystemClock),
    );
}

/// The process-wide default registry, booted from `fat-volumes.manifest`
/// in the working directory on first use. Tests should build their own
/// [`VolumeRegistry`] with a private manifest instead.
pub fn default_registry() -> &'static VolumeRegistry {
    &DEFAULT_REGISTRY
}
