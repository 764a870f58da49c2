use std::collections::HashSet;

use rand::{Rng, RngCore};

use arca_core::blobs::{check_blobs, remove_blobs, save_blobs};
use arca_core::config::{ArcaConfig, LockConfig, RepositoryConfig, WorkerConfig};
use arca_core::loader::{BackendBlobLoader, BlobLoader};
use arca_core::lock::{list_locks, new_lock, with_repo_lock};
use arca_core::storage::{init_repo, open_repo};
use arca_storage::{list_all, RetryConfig};
use arca_types::{ArcaError, CancelToken, FileType, Id};

fn random_blobs(n: usize) -> Vec<Vec<u8>> {
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| {
            let mut buf = vec![0u8; rng.gen_range(1024..=1024 * 1024)];
            rng.fill_bytes(&mut buf);
            buf
        })
        .collect()
}

fn local_config(root: &std::path::Path) -> ArcaConfig {
    ArcaConfig {
        repository: RepositoryConfig {
            url: root.display().to_string(),
            retry: RetryConfig::default(),
        },
        locks: LockConfig::default(),
        workers: WorkerConfig { count: 4 },
    }
}

#[test]
fn archive_verify_and_prune_under_lock() {
    let tmp = tempfile::tempdir().unwrap();
    let config = local_config(&tmp.path().join("repo"));
    config.validate().unwrap();
    let workers = config.workers.effective_count();
    let cancel = CancelToken::new();

    let storage = init_repo(&config.repository, b"{}").unwrap();
    let blobs = random_blobs(10);

    // Archive with an exclusive lock held.
    let report = with_repo_lock(&*storage, &config.locks, true, || {
        save_blobs(storage.clone(), FileType::Data, blobs.clone(), workers, &cancel)
    })
    .unwrap();
    assert_eq!(report.saved, 10);
    assert!(list_locks(&*storage).unwrap().is_empty());

    // Reopen and verify with a shared lock.
    let storage = open_repo(&config.repository).unwrap();
    let names: HashSet<String> = list_all(&*storage, FileType::Data).into_iter().collect();
    assert_eq!(names.len(), 10);

    let check = with_repo_lock(&*storage, &config.locks, false, || {
        check_blobs(storage.clone(), FileType::Data, workers, &cancel)
    })
    .unwrap();
    assert_eq!(check.checked, 10);
    assert!(check.is_ok(), "{:?}", check.errors);

    let loader = BackendBlobLoader::new(storage.clone());
    let mut buf = Vec::new();
    for (id, data) in report.ids.iter().zip(&blobs) {
        assert_eq!(loader.lookup_blob_size(id).unwrap(), data.len() as u64);
        buf = loader.load_blob(FileType::Data, id, buf).unwrap();
        assert_eq!(&buf, data);
    }

    // Prune three objects.
    let doomed: Vec<String> = report.ids[..3].iter().map(Id::to_hex).collect();
    let removed = with_repo_lock(&*storage, &config.locks, true, || {
        remove_blobs(storage.clone(), FileType::Data, doomed.clone(), workers, &cancel)
    })
    .unwrap();
    assert_eq!(removed.removed, 3);
    assert_eq!(list_all(&*storage, FileType::Data).len(), 7);

    let err = loader
        .load_blob(FileType::Data, &report.ids[0], Vec::new())
        .unwrap_err();
    assert!(err.is_not_found(), "{err}");
}

#[test]
fn exclusive_operation_waits_for_shared_reader() {
    let tmp = tempfile::tempdir().unwrap();
    let config = local_config(&tmp.path().join("repo"));
    let storage = init_repo(&config.repository, b"{}").unwrap();

    let mut reader = new_lock(&*storage, &config.locks).unwrap();
    let err = with_repo_lock(&*storage, &config.locks, true, || Ok(()))
        .unwrap_err();
    assert!(matches!(err, ArcaError::Locked(_)), "{err}");

    reader.unlock(&*storage).unwrap();
    with_repo_lock(&*storage, &config.locks, true, || Ok(())).unwrap();
}
