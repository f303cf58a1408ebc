use crate::storage::Store;

/// A file-backed store in a scratch dir. Keep the TempDir alive for the
/// duration of the test; dropping it deletes the database.
pub async fn temp_store() -> (Store, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("hub.db");
    let url = format!("sqlite://{}", path.display());
    let store = Store::connect(&url).await.expect("store connects");
    (store, dir)
}
