use super::*;
use crate::store::MemoryStore;
use serde_json::json;

const DIMS: usize = 4;

fn writer(store: &Arc<MemoryStore>) -> IndexWriter {
    let codec = VectorCodec::new(DIMS).expect("valid dimensions");
    IndexWriter::new(
        Arc::clone(store) as Arc<dyn DestinationIndex>,
        codec,
        "dest",
        "productEmbedding",
    )
    .with_retry_policy(RetryPolicy::immediate(3))
}

fn enriched(id: &str, dims: usize) -> EnrichedDocument {
    let codec = VectorCodec::new(dims).expect("valid dimensions");
    let values: Vec<f32> = (0..dims).map(|i| i as f32 / 10.0).collect();
    EnrichedDocument {
        id: id.to_string(),
        fields: json!({ "id": id, "name": format!("Product {id}") })
            .as_object()
            .cloned()
            .expect("object"),
        embedding: codec.validate(0, values).expect("valid vector"),
    }
}

#[tokio::test]
async fn ensure_schema_creates_missing_index_idempotently() {
    let store = Arc::new(MemoryStore::new());
    let writer = writer(&store);

    writer.ensure_schema().await.expect("index created");
    writer.ensure_schema().await.expect("second call is a no-op");

    assert_eq!(
        store.field_mapping("dest", "productEmbedding"),
        Some(FieldMapping {
            field_type: "dense_vector".to_string(),
            dims: Some(DIMS),
        })
    );
}

#[tokio::test]
async fn ensure_schema_adds_field_to_existing_index() {
    let store = Arc::new(MemoryStore::new());
    store.create_plain_index("dest");

    writer(&store).ensure_schema().await.expect("field added");
    assert_eq!(
        store
            .field_mapping("dest", "productEmbedding")
            .and_then(|m| m.dims),
        Some(DIMS)
    );
}

#[tokio::test]
async fn ensure_schema_rejects_conflicting_mappings() {
    let store = Arc::new(MemoryStore::new());
    store.set_field_mapping(
        "dest",
        "productEmbedding",
        FieldMapping {
            field_type: "dense_vector".to_string(),
            dims: Some(DIMS + 1),
        },
    );
    let error = writer(&store)
        .ensure_schema()
        .await
        .expect_err("dims differ");
    assert!(matches!(error, PipelineError::SchemaConflict(_)));

    let store = Arc::new(MemoryStore::new());
    store.set_field_mapping(
        "dest",
        "productEmbedding",
        FieldMapping {
            field_type: "keyword".to_string(),
            dims: None,
        },
    );
    let error = writer(&store)
        .ensure_schema()
        .await
        .expect_err("type differs");
    assert!(error.to_string().contains("type keyword"));
}

#[tokio::test]
async fn writing_twice_leaves_the_same_state() {
    let store = Arc::new(MemoryStore::new());
    let writer = writer(&store);
    writer.ensure_schema().await.expect("schema ready");
    let documents = vec![enriched("a", DIMS), enriched("b", DIMS)];

    let first = writer.write_batch(&documents).await.expect("write succeeds");
    assert!(first.iter().all(WriteOutcome::is_committed));
    let after_first = store.documents("dest");

    let second = writer.write_batch(&documents).await.expect("write succeeds");
    assert!(second.iter().all(WriteOutcome::is_committed));
    assert_eq!(store.documents("dest"), after_first);

    let (_, stored) = &after_first[0];
    assert_eq!(stored["productEmbedding"].as_array().map(Vec::len), Some(DIMS));
}

#[tokio::test]
async fn wrong_sized_vectors_are_never_sent() {
    let store = Arc::new(MemoryStore::new());
    let writer = writer(&store);
    writer.ensure_schema().await.expect("schema ready");

    let outcomes = writer
        .write_batch(&[enriched("good", DIMS), enriched("bad", DIMS - 1)])
        .await
        .expect("write succeeds");

    assert_eq!(outcomes[0], WriteOutcome::Committed);
    assert!(matches!(&outcomes[1], WriteOutcome::Failed(reason) if reason.contains("dimension")));
    assert_eq!(store.count("dest").await.expect("count"), 1);
}

#[tokio::test]
async fn retryable_items_are_retried_and_others_fail() {
    let store = Arc::new(MemoryStore::new());
    let writer = writer(&store);
    writer.ensure_schema().await.expect("schema ready");
    store.reject_writes("throttled", 429, "es_rejected_execution_exception", 1);
    store.reject_writes("invalid", 400, "mapper_parsing_exception", 5);

    let outcomes = writer
        .write_batch(&[
            enriched("ok", DIMS),
            enriched("throttled", DIMS),
            enriched("invalid", DIMS),
        ])
        .await
        .expect("write succeeds");

    assert_eq!(outcomes[0], WriteOutcome::Committed);
    assert_eq!(outcomes[1], WriteOutcome::Committed);
    assert_eq!(
        outcomes[2],
        WriteOutcome::Failed("mapper_parsing_exception".to_string())
    );
}

#[tokio::test]
async fn whole_bulk_outages_are_retried() {
    let store = Arc::new(MemoryStore::new());
    let writer = writer(&store);
    writer.ensure_schema().await.expect("schema ready");
    store.fail_next_bulk_calls(2);

    let outcomes = writer
        .write_batch(&[enriched("a", DIMS)])
        .await
        .expect("third attempt succeeds");
    assert_eq!(outcomes, [WriteOutcome::Committed]);

    store.fail_next_bulk_calls(3);
    let outcomes = writer
        .write_batch(&[enriched("b", DIMS)])
        .await
        .expect("per-document failure, not an error");
    assert!(matches!(outcomes[0], WriteOutcome::Failed(_)));
}

#[tokio::test]
async fn missing_destination_fails_the_batch() {
    let store = Arc::new(MemoryStore::new());
    let error = writer(&store)
        .write_batch(&[enriched("a", DIMS)])
        .await
        .expect_err("index was never created");
    assert!(matches!(error, PipelineError::WriteFailed(_)));
}
