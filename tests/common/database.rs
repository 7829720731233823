//! Store fixtures

use reliefsync::client::local_store::LocalStore;
use tempfile::TempDir;

/// Fresh in-memory store
pub async fn memory_store() -> LocalStore {
    LocalStore::open_in_memory()
        .await
        .expect("in-memory store should open")
}

/// On-disk store in a temporary directory
///
/// Keep the returned `TempDir` alive for as long as the store is used.
pub async fn temp_store() -> (TempDir, LocalStore) {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = LocalStore::open(dir.path().join("local.db"))
        .await
        .expect("on-disk store should open");
    (dir, store)
}
