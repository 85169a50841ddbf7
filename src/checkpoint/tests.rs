use super::*;
use serde_json::json;
use tempfile::TempDir;

fn cursor(id: &str) -> Cursor {
    Cursor::new(vec![json!(id)])
}

#[tokio::test]
async fn missing_file_loads_as_none() {
    let dir = TempDir::new().expect("temp dir");
    let store = FileCheckpointStore::new(dir.path().join("checkpoint.json"));
    assert!(store.load().await.expect("load succeeds").is_none());
}

#[tokio::test]
async fn saved_checkpoint_survives_reopen() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("state").join("checkpoint.json");

    let first = Checkpoint::start("src", "dest").advance(cursor("p009"), 9, 1);
    FileCheckpointStore::new(&path)
        .compare_and_swap(None, &first)
        .await
        .expect("first save");

    let reopened = FileCheckpointStore::new(&path);
    let loaded = reopened.load().await.expect("load").expect("checkpoint exists");
    assert_eq!(loaded, first);
    assert_eq!(loaded.documents_processed, 10);
    assert_eq!(loaded.batches_committed, 1);

    let leftovers: Vec<_> = std::fs::read_dir(path.parent().expect("parent"))
        .expect("read dir")
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn stale_expectation_is_rejected() {
    let dir = TempDir::new().expect("temp dir");
    let store = FileCheckpointStore::new(dir.path().join("checkpoint.json"));

    let first = Checkpoint::start("src", "dest").advance(cursor("a"), 1, 0);
    store.compare_and_swap(None, &first).await.expect("first save");
    let second = first.advance(cursor("b"), 1, 0);
    store
        .compare_and_swap(Some(&first), &second)
        .await
        .expect("second save");

    let conflicting = first.advance(cursor("c"), 2, 0);
    let error = store
        .compare_and_swap(Some(&first), &conflicting)
        .await
        .expect_err("first is no longer current");
    assert!(matches!(error, PipelineError::Checkpoint(_)));
    assert_eq!(store.load().await.expect("load"), Some(second));
}

#[tokio::test]
async fn progress_never_moves_backwards() {
    let store = MemoryCheckpointStore::new();
    let start = Checkpoint::start("src", "dest");
    let ahead = start.advance(cursor("a"), 5, 0).advance(cursor("b"), 5, 0);
    store.compare_and_swap(None, &ahead).await.expect("save");

    let behind = start.advance(cursor("a"), 5, 0);
    let error = store
        .compare_and_swap(Some(&ahead), &behind)
        .await
        .expect_err("regression refused");
    assert!(error.to_string().contains("backwards"));
}

#[tokio::test]
async fn clear_removes_the_file() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("checkpoint.json");
    let store = FileCheckpointStore::new(&path);

    store
        .compare_and_swap(None, &Checkpoint::start("src", "dest"))
        .await
        .expect("save");
    assert!(path.exists());

    store.clear().await.expect("clear");
    store.clear().await.expect("clearing twice is fine");
    assert!(!path.exists());
}

#[tokio::test]
async fn corrupt_file_is_reported() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("checkpoint.json");
    std::fs::write(&path, "{ not json").expect("write");

    let error = FileCheckpointStore::new(&path)
        .load()
        .await
        .expect_err("corrupt");
    assert!(matches!(error, PipelineError::Checkpoint(_)));
}

#[test]
fn belongs_to_matches_both_indices() {
    let checkpoint = Checkpoint::start("src", "dest");
    assert!(checkpoint.belongs_to("src", "dest"));
    assert!(!checkpoint.belongs_to("src", "other"));
}
