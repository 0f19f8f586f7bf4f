use bytes::Bytes;
use packrat_backends::LocalBackend;
use packrat_core::backend::Backend;
use packrat_core::{Error, FileType, Handle, InitOptions, ObjectID, Repository, RepositoryOptions};
use std::path::Path;
use std::sync::Arc;

fn pack_handle(data: &[u8]) -> Handle {
    Handle::for_id(FileType::Data, &ObjectID::from_data(data))
}

#[tokio::test]
async fn test_save_load_and_ranges() {
    let dir = tempfile::tempdir().unwrap();
    let backend = LocalBackend::new(dir.path());
    backend.init().await.unwrap();

    let handle = pack_handle(b"pack");
    backend
        .save(&handle, Bytes::from_static(b"0123456789"))
        .await
        .unwrap();

    let prefix = &handle.name[..2];
    assert!(dir.path().join("data").join(prefix).join(&handle.name).is_file());

    assert_eq!(backend.load(&handle, 0, 0).await.unwrap(), &b"0123456789"[..]);
    assert_eq!(backend.load(&handle, 3, 2).await.unwrap(), &b"234"[..]);
    assert_eq!(backend.load(&handle, 0, 7).await.unwrap(), &b"789"[..]);
    assert!(backend.load(&handle, 4, 8).await.is_err());
    assert!(backend.load(&handle, 0, 11).await.is_err());

    assert_eq!(backend.stat(&handle).await.unwrap().size, 10);
}

#[tokio::test]
async fn test_save_never_overwrites() {
    let dir = tempfile::tempdir().unwrap();
    let backend = LocalBackend::new(dir.path());
    backend.init().await.unwrap();

    let handle = Handle::new(FileType::Snapshot, "abc");
    backend.save(&handle, Bytes::from_static(b"one")).await.unwrap();
    let err = backend
        .save(&handle, Bytes::from_static(b"two"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::FileExists { .. }));
    assert_eq!(backend.load(&handle, 0, 0).await.unwrap(), &b"one"[..]);
}

/// Every file below `dir` whose name starts with a dot.
fn hidden_files(dir: &Path) -> Vec<String> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir).unwrap() {
        let entry = entry.unwrap();
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().unwrap().is_dir() {
            found.extend(hidden_files(&entry.path()));
        } else if name.starts_with('.') {
            found.push(name);
        }
    }
    found
}

#[tokio::test]
async fn test_save_leaves_no_temp_files() {
    let dir = tempfile::tempdir().unwrap();
    let backend = LocalBackend::new(dir.path());
    backend.init().await.unwrap();

    let pack = pack_handle(b"pack");
    backend.save(&pack, Bytes::from_static(b"pack")).await.unwrap();
    backend
        .save(&Handle::config(), Bytes::from_static(b"c"))
        .await
        .unwrap();
    let snapshot = Handle::new(FileType::Snapshot, "s1");
    backend.save(&snapshot, Bytes::from_static(b"s")).await.unwrap();
    assert!(backend.save(&snapshot, Bytes::from_static(b"x")).await.is_err());

    assert!(hidden_files(dir.path()).is_empty());
}

#[tokio::test]
async fn test_list_skips_interrupted_writes() {
    let dir = tempfile::tempdir().unwrap();
    let backend = LocalBackend::new(dir.path());
    backend.init().await.unwrap();

    let pack = pack_handle(b"kept");
    backend.save(&pack, Bytes::from_static(b"kept")).await.unwrap();
    let prefix = &pack.name[..2];
    std::fs::write(
        dir.path().join("data").join(prefix).join(".tmp-2f1c"),
        b"half",
    )
    .unwrap();
    std::fs::write(dir.path().join("index").join(".tmp-9b0e"), b"half").unwrap();

    assert_eq!(backend.list(FileType::Data).await.unwrap(), vec![pack.name.clone()]);
    assert!(backend.list(FileType::Index).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_files() {
    let dir = tempfile::tempdir().unwrap();
    let backend = LocalBackend::new(dir.path());
    backend.init().await.unwrap();

    let handle = Handle::new(FileType::Index, "nope");
    assert!(!backend.test(&handle).await.unwrap());
    assert!(backend.load(&handle, 0, 0).await.unwrap_err().is_not_found());
    assert!(backend.stat(&handle).await.unwrap_err().is_not_found());
    assert!(backend.remove(&handle).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_list_and_remove() {
    let dir = tempfile::tempdir().unwrap();
    let backend = LocalBackend::new(dir.path());
    backend.init().await.unwrap();

    let a = pack_handle(b"a");
    let b = pack_handle(b"b");
    backend.save(&a, Bytes::from_static(b"a")).await.unwrap();
    backend.save(&b, Bytes::from_static(b"b")).await.unwrap();
    backend
        .save(&Handle::new(FileType::Key, "k1"), Bytes::from_static(b"k"))
        .await
        .unwrap();
    backend
        .save(&Handle::config(), Bytes::from_static(b"c"))
        .await
        .unwrap();

    let mut packs = backend.list(FileType::Data).await.unwrap();
    packs.sort();
    let mut expected = vec![a.name.clone(), b.name.clone()];
    expected.sort();
    assert_eq!(packs, expected);
    assert_eq!(backend.list(FileType::Key).await.unwrap(), vec!["k1".to_string()]);
    assert_eq!(backend.list(FileType::Config).await.unwrap(), vec!["config".to_string()]);
    assert!(backend.list(FileType::Lock).await.unwrap().is_empty());
    assert!(dir.path().join("config").is_file());

    backend.remove(&a).await.unwrap();
    assert_eq!(backend.list(FileType::Data).await.unwrap(), vec![b.name.clone()]);
}

#[tokio::test]
async fn test_repository_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let init = InitOptions {
        kdf_memory: 64,
        kdf_iterations: 1,
        kdf_parallelism: 1,
        ..InitOptions::default()
    };

    let backend = Arc::new(LocalBackend::new(dir.path()));
    let repo = Repository::init(backend, "secret", init, RepositoryOptions::default())
        .await
        .unwrap();
    let id = repo
        .save_blob(packrat_core::BlobType::Data, b"on disk", None)
        .await
        .unwrap();
    repo.flush().await.unwrap();
    repo.save_index().await.unwrap();
    drop(repo);

    let backend = Arc::new(LocalBackend::new(dir.path()));
    let repo = Repository::open(backend, "secret", RepositoryOptions::default())
        .await
        .unwrap();
    assert_eq!(repo.load_index().await.unwrap(), 1);
    assert_eq!(
        repo.load_blob(packrat_core::BlobType::Data, &id).await.unwrap(),
        b"on disk"
    );
}
