use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, warn};

use arca_types::error::{ArcaError, Result};
use arca_types::{CancelToken, FileType, Handle};

use crate::{send_name, spawn_lister, Backend, FileInfo, CONFIG_NAME};

const CONFIG_FILE: &str = "config";
const TMP_DIR: &str = "tmp";

/// Directories that must exist for a path to count as a repository.
const LAYOUT_DIRS: [&str; 6] = ["data", "snapshots", "index", "locks", "keys", TMP_DIR];

/// Storage backend for a local directory, using `std::fs` directly.
///
/// Layout under the root:
/// `config`, `data/<2-hex>/<name>`, `snapshots/`, `index/`, `locks/`,
/// `keys/` and the `tmp/` staging area used by atomic saves.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Open an existing repository. Every layout directory must be present.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in LAYOUT_DIRS {
            match fs::metadata(root.join(dir)) {
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => return Err(ArcaError::RepoNotFound(root.display().to_string())),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(ArcaError::RepoNotFound(root.display().to_string()));
                }
                Err(e) => return Err(e.into()),
            }
        }
        // Canonicalize for clearer locations with symlinked roots.
        let root = fs::canonicalize(&root)?;
        debug!(root = %root.display(), "opened local repository");
        Ok(Self { root })
    }

    /// Create the directory skeleton for a new repository.
    ///
    /// Refuses to adopt a path that already holds a config object.
    pub fn create(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        match fs::symlink_metadata(root.join(CONFIG_FILE)) {
            Ok(_) => return Err(ArcaError::RepoAlreadyExists(root.display().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        for dir in LAYOUT_DIRS {
            fs::create_dir_all(root.join(dir))?;
        }
        let data = root.join("data");
        for shard in 0..=255u8 {
            fs::create_dir_all(data.join(format!("{shard:02x}")))?;
        }
        let root = fs::canonicalize(&root)?;
        debug!(root = %root.display(), "created local repository");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path of the object behind `handle`. The handle must be valid.
    fn path_for(&self, handle: &Handle) -> PathBuf {
        match (handle.file_type.dir_name(), handle.shard_prefix()) {
            (None, _) => self.root.join(CONFIG_FILE),
            (Some(dir), Some(shard)) => self.root.join(dir).join(shard).join(&handle.name),
            (Some(dir), None) => self.root.join(dir).join(&handle.name),
        }
    }

    /// Stage `data` in `tmp/`, fsync it, then rename it into place without
    /// replacing an existing file. Readers never see a partial object.
    fn write_atomic(&self, handle: &Handle, path: &Path, data: &[u8]) -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(self.root.join(TMP_DIR))?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist_noclobber(path).map_err(|e| {
            if e.error.kind() == std::io::ErrorKind::AlreadyExists {
                ArcaError::AlreadyExists(handle.clone())
            } else {
                ArcaError::Io(e.error)
            }
        })?;
        set_readonly(path)
    }
}

fn not_found_as(handle: &Handle, e: std::io::Error) -> ArcaError {
    if e.kind() == std::io::ErrorKind::NotFound {
        ArcaError::NotFound(handle.clone())
    } else {
        ArcaError::Io(e)
    }
}

fn set_readonly(path: &Path) -> Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(true);
    fs::set_permissions(path, perms)?;
    Ok(())
}

fn set_writable(path: &Path) -> std::io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(perms.mode() | 0o200);
    }
    #[cfg(not(unix))]
    {
        #[allow(clippy::permissions_set_readonly_false)]
        perms.set_readonly(false);
    }
    fs::set_permissions(path, perms)
}

impl Backend for LocalBackend {
    fn location(&self) -> String {
        self.root.display().to_string()
    }

    fn save(&self, handle: &Handle, data: &[u8]) -> Result<()> {
        handle.validate()?;
        let path = self.path_for(handle);
        match fs::symlink_metadata(&path) {
            Ok(_) => return Err(ArcaError::AlreadyExists(handle.clone())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        match self.write_atomic(handle, &path, data) {
            // A shard directory may have been removed out from under us.
            Err(ArcaError::Io(ref e)) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                self.write_atomic(handle, &path, data)?;
            }
            other => other?,
        }
        debug!(%handle, size = data.len(), "saved object");
        Ok(())
    }

    fn load(&self, handle: &Handle, length: u64, offset: i64) -> Result<Box<dyn Read + Send>> {
        handle.validate()?;
        if offset < 0 {
            return Err(ArcaError::InvalidOffset {
                handle: handle.clone(),
                offset,
                reason: "negative".into(),
            });
        }
        let path = self.path_for(handle);
        let mut file = fs::File::open(&path).map_err(|e| not_found_as(handle, e))?;
        let size = file.metadata()?.len();
        let start = offset as u64;
        if start > size {
            return Err(ArcaError::InvalidOffset {
                handle: handle.clone(),
                offset,
                reason: format!("past end of object of {size} bytes"),
            });
        }
        if start > 0 {
            file.seek(SeekFrom::Start(start))?;
        }
        if length > 0 {
            Ok(Box::new(file.take(length)))
        } else {
            Ok(Box::new(file))
        }
    }

    fn stat(&self, handle: &Handle) -> Result<FileInfo> {
        handle.validate()?;
        let meta = fs::metadata(self.path_for(handle)).map_err(|e| not_found_as(handle, e))?;
        Ok(FileInfo { size: meta.len() })
    }

    fn test(&self, handle: &Handle) -> Result<bool> {
        handle.validate()?;
        match fs::metadata(self.path_for(handle)) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&self, handle: &Handle) -> Result<()> {
        handle.validate()?;
        let path = self.path_for(handle);
        // Saved objects are read-only; unlinking needs write permission
        // on some platforms.
        set_writable(&path).map_err(|e| not_found_as(handle, e))?;
        fs::remove_file(&path).map_err(|e| not_found_as(handle, e))?;
        debug!(%handle, "removed object");
        Ok(())
    }

    fn list(&self, file_type: FileType, cancel: &CancelToken) -> Receiver<String> {
        let root = self.root.clone();
        let cancel = cancel.clone();
        spawn_lister(file_type, move |tx| {
            if let Err(e) = produce_names(&root, file_type, tx, &cancel) {
                // The stream just ends, so an unreadable directory lists as
                // empty. Lock acquisition scans `locks/` this way and will not
                // see locks it cannot read.
                warn!(%file_type, error = %e, "listing failed");
            }
        })
    }

    fn delete(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {
                debug!(root = %self.root.display(), "deleted local repository");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Walk the directory for `file_type` and stream file names to `tx`.
fn produce_names(
    root: &Path,
    file_type: FileType,
    tx: &Sender<String>,
    cancel: &CancelToken,
) -> Result<()> {
    let Some(dir) = file_type.dir_name() else {
        if root.join(CONFIG_FILE).is_file() {
            send_name(tx, cancel, CONFIG_NAME.to_string());
        }
        return Ok(());
    };
    let dir = root.join(dir);
    if file_type == FileType::Data {
        for shard in fs::read_dir(&dir)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            if !send_dir_entries(&shard.path(), tx, cancel)? {
                return Ok(());
            }
        }
        Ok(())
    } else {
        send_dir_entries(&dir, tx, cancel).map(|_| ())
    }
}

/// Returns `false` once the consumer stopped listening.
fn send_dir_entries(dir: &Path, tx: &Sender<String>, cancel: &CancelToken) -> Result<bool> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if !send_name(tx, cancel, name) {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{list_all, load_all};

    fn new_backend() -> (tempfile::TempDir, LocalBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::create(dir.path().join("repo")).unwrap();
        (dir, backend)
    }

    fn data_handle(payload: &[u8]) -> Handle {
        Handle::from_id(FileType::Data, &arca_types::Id::hash(payload))
    }

    #[test]
    fn create_builds_full_skeleton() {
        let (_dir, backend) = new_backend();
        for dir in LAYOUT_DIRS {
            assert!(backend.root().join(dir).is_dir(), "{dir} missing");
        }
        assert!(backend.root().join("data/00").is_dir());
        assert!(backend.root().join("data/ff").is_dir());
    }

    #[test]
    fn create_refuses_existing_repository() {
        let (dir, backend) = new_backend();
        backend.save(&Handle::config(), b"cfg").unwrap();
        let err = LocalBackend::create(dir.path().join("repo")).err().unwrap();
        assert!(matches!(err, ArcaError::RepoAlreadyExists(_)), "{err}");
    }

    #[test]
    fn open_requires_every_layout_dir() {
        let (dir, backend) = new_backend();
        let root = dir.path().join("repo");
        assert!(LocalBackend::open(&root).is_ok());
        fs::remove_dir(backend.root().join("keys")).unwrap();
        let err = LocalBackend::open(&root).err().unwrap();
        assert!(matches!(err, ArcaError::RepoNotFound(_)), "{err}");
    }

    #[test]
    fn data_objects_are_sharded() {
        let (_dir, backend) = new_backend();
        let h = data_handle(b"sharded");
        backend.save(&h, b"sharded").unwrap();
        let expected = backend.root().join("data").join(&h.name[..2]).join(&h.name);
        assert!(expected.is_file());
    }

    #[test]
    fn typed_objects_land_in_their_directory() {
        let (_dir, backend) = new_backend();
        for (file_type, dir) in [
            (FileType::Snapshot, "snapshots"),
            (FileType::Index, "index"),
            (FileType::Lock, "locks"),
            (FileType::Key, "keys"),
        ] {
            let h = Handle::new(file_type, "abc123");
            backend.save(&h, b"x").unwrap();
            assert!(backend.root().join(dir).join("abc123").is_file(), "{dir}");
        }
        backend.save(&Handle::config(), b"cfg").unwrap();
        assert!(backend.root().join("config").is_file());
    }

    #[test]
    fn saved_objects_are_read_only() {
        let (_dir, backend) = new_backend();
        let h = data_handle(b"ro");
        backend.save(&h, b"ro").unwrap();
        let meta = fs::metadata(backend.path_for(&h)).unwrap();
        assert!(meta.permissions().readonly());
    }

    #[test]
    fn save_existing_fails_and_keeps_bytes() {
        let (_dir, backend) = new_backend();
        let h = Handle::new(FileType::Snapshot, "deadbeef");
        backend.save(&h, b"first").unwrap();
        let err = backend.save(&h, b"second").unwrap_err();
        assert!(err.is_already_exists(), "{err}");
        assert_eq!(load_all(&backend, &h).unwrap(), b"first");
    }

    #[test]
    fn save_leaves_staging_area_empty() {
        let (_dir, backend) = new_backend();
        backend.save(&data_handle(b"a"), b"a").unwrap();
        let _ = backend.save(&data_handle(b"a"), b"a");
        let leftovers = fs::read_dir(backend.root().join(TMP_DIR)).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn save_recreates_missing_shard_dir() {
        let (_dir, backend) = new_backend();
        let h = data_handle(b"lost shard");
        fs::remove_dir(backend.root().join("data").join(&h.name[..2])).unwrap();
        backend.save(&h, b"lost shard").unwrap();
        assert_eq!(load_all(&backend, &h).unwrap(), b"lost shard");
    }

    #[test]
    fn invalid_handle_touches_nothing() {
        let (_dir, backend) = new_backend();
        let bad = Handle::new(FileType::Snapshot, "../escape");
        assert!(matches!(
            backend.save(&bad, b"bad").unwrap_err(),
            ArcaError::InvalidHandle(_)
        ));
        assert!(backend.load(&bad, 0, 0).is_err());
        assert!(backend.remove(&bad).is_err());
        assert!(!dir_has_entries(&backend.root().join("snapshots")));
        assert!(!backend.root().parent().unwrap().join("escape").exists());
    }

    fn dir_has_entries(dir: &Path) -> bool {
        fs::read_dir(dir).unwrap().next().is_some()
    }

    #[test]
    fn load_partial_ranges() {
        let (_dir, backend) = new_backend();
        let payload: Vec<u8> = (0..=255u8).collect();
        let h = data_handle(&payload);
        backend.save(&h, &payload).unwrap();

        let read = |length: u64, offset: i64| {
            let mut buf = Vec::new();
            backend
                .load(&h, length, offset)
                .unwrap()
                .read_to_end(&mut buf)
                .unwrap();
            buf
        };
        assert_eq!(read(0, 0), payload);
        assert_eq!(read(10, 5), payload[5..15]);
        assert_eq!(read(0, 200), payload[200..]);
        assert_eq!(read(1000, 250), payload[250..]);
        assert!(read(0, 256).is_empty());
    }

    #[test]
    fn load_rejects_bad_offsets() {
        let (_dir, backend) = new_backend();
        let h = data_handle(b"short");
        backend.save(&h, b"short").unwrap();
        assert!(matches!(
            backend.load(&h, 0, -1).err().unwrap(),
            ArcaError::InvalidOffset { .. }
        ));
        assert!(matches!(
            backend.load(&h, 0, 6).err().unwrap(),
            ArcaError::InvalidOffset { .. }
        ));
    }

    #[test]
    fn missing_objects_are_not_found() {
        let (_dir, backend) = new_backend();
        let h = data_handle(b"nope");
        assert!(!backend.test(&h).unwrap());
        assert!(backend.stat(&h).unwrap_err().is_not_found());
        assert!(backend.load(&h, 0, 0).err().unwrap().is_not_found());
        assert!(backend.remove(&h).unwrap_err().is_not_found());
    }

    #[test]
    fn stat_reports_size_and_remove_deletes() {
        let (_dir, backend) = new_backend();
        let h = data_handle(b"twelve bytes");
        backend.save(&h, b"twelve bytes").unwrap();
        assert!(backend.test(&h).unwrap());
        assert_eq!(backend.stat(&h).unwrap().size, 12);
        backend.remove(&h).unwrap();
        assert!(!backend.test(&h).unwrap());
    }

    #[test]
    fn list_reports_each_name_once() {
        let (_dir, backend) = new_backend();
        let mut expected = Vec::new();
        for i in 0..20u32 {
            let payload = i.to_le_bytes();
            let h = data_handle(&payload);
            backend.save(&h, &payload).unwrap();
            expected.push(h.name);
        }
        backend
            .save(&Handle::new(FileType::Index, "abcd"), b"idx")
            .unwrap();

        let mut names = list_all(&backend, FileType::Data);
        names.sort();
        expected.sort();
        assert_eq!(names, expected);
        assert_eq!(list_all(&backend, FileType::Index), vec!["abcd".to_string()]);
        assert!(list_all(&backend, FileType::Snapshot).is_empty());
    }

    #[test]
    fn list_config_reports_fixed_name() {
        let (_dir, backend) = new_backend();
        assert!(list_all(&backend, FileType::Config).is_empty());
        backend.save(&Handle::config(), b"cfg").unwrap();
        assert_eq!(list_all(&backend, FileType::Config), vec![CONFIG_NAME]);
    }

    #[test]
    fn list_stops_on_cancel() {
        let (_dir, backend) = new_backend();
        for i in 0..(crate::LIST_BUFFER as u32 * 4) {
            let h = Handle::new(FileType::Snapshot, format!("snap{i}"));
            backend.save(&h, b"s").unwrap();
        }
        let cancel = CancelToken::new();
        let rx = backend.list(FileType::Snapshot, &cancel);
        assert!(rx.recv().is_ok());
        cancel.cancel();
        // Drains whatever was buffered, then closes.
        let rest = rx.iter().count();
        assert!(rest < crate::LIST_BUFFER * 4);
    }

    #[test]
    fn delete_removes_everything() {
        let (_dir, backend) = new_backend();
        backend.save(&data_handle(b"gone"), b"gone").unwrap();
        backend.delete().unwrap();
        assert!(!backend.root().exists());
        backend.delete().unwrap();
    }

    #[test]
    fn concurrent_saves_of_same_handle_leave_one_intact_copy() {
        use std::sync::{Arc, Barrier};
        use std::thread;

        let (_dir, backend) = new_backend();
        let backend = Arc::new(backend);
        let h = Handle::new(FileType::Snapshot, "contested");

        let payload_a = vec![0xAAu8; 1024 * 64];
        let payload_b = vec![0xBBu8; 1024 * 64];

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = [payload_a.clone(), payload_b.clone()]
            .into_iter()
            .map(|payload| {
                let backend = Arc::clone(&backend);
                let barrier = Arc::clone(&barrier);
                let h = h.clone();
                thread::spawn(move || {
                    barrier.wait();
                    backend.save(&h, &payload)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|t| t.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);

        let stored = load_all(backend.as_ref(), &h).unwrap();
        // Exactly one of the two full payloads, never a mixture.
        assert!(stored == payload_a || stored == payload_b);
    }
}
