use super::*;
use crate::testing::{FakeEmbedder, unavailable};
use rand::Rng;

fn client_with(service: &Arc<FakeEmbedder>, dims: usize, attempts: u32) -> EmbeddingClient {
    let codec = VectorCodec::new(dims).expect("valid dimensions");
    EmbeddingClient::new(Arc::clone(service) as Arc<dyn EmbeddingService>, codec)
        .with_retry_policy(RetryPolicy::immediate(attempts))
}

fn texts(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("product number {i}")).collect()
}

#[tokio::test]
async fn empty_input_makes_no_call() {
    let service = Arc::new(FakeEmbedder::new(8));
    let client = client_with(&service, 8, 3);

    let vectors = client.embed(&[]).await.expect("empty input succeeds");
    assert!(vectors.is_empty());
    assert_eq!(service.call_count(), 0);
}

#[tokio::test]
async fn output_matches_input_length_and_order() {
    let service = Arc::new(FakeEmbedder::new(16));
    let client = client_with(&service, 16, 1).with_max_request_size(7);
    let mut rng = rand::thread_rng();

    for _ in 0..20 {
        let count = rng.gen_range(1..40);
        let input: Vec<String> = (0..count)
            .map(|_| format!("word{} word{}", rng.gen_range(0..50), rng.gen_range(0..50)))
            .collect();

        let vectors = client.embed(&input).await.expect("embedding succeeds");
        assert_eq!(vectors.len(), input.len());
        for (text, vector) in input.iter().zip(&vectors) {
            assert_eq!(vector.as_slice(), crate::testing::bag_of_words(text, 16));
        }
    }
}

#[tokio::test]
async fn splits_only_above_max_request_size() {
    let service = Arc::new(FakeEmbedder::new(4));
    let client = client_with(&service, 4, 1).with_max_request_size(10);

    client.embed(&texts(10)).await.expect("one request");
    assert_eq!(service.call_count(), 1);

    client.embed(&texts(25)).await.expect("three requests");
    let sizes: Vec<usize> = service.calls()[1..].iter().map(Vec::len).collect();
    assert_eq!(sizes, [10, 10, 5]);
}

#[tokio::test]
async fn recovers_after_three_unavailable_responses() {
    let service = Arc::new(FakeEmbedder::new(8).fail_next([
        unavailable(),
        unavailable(),
        unavailable(),
    ]));
    let client = client_with(&service, 8, 5);

    let vectors = client.embed(&texts(3)).await.expect("fourth attempt succeeds");
    assert_eq!(vectors.len(), 3);
    assert_eq!(service.call_count(), 4);
}

#[tokio::test]
async fn exhausted_retries_become_rejection() {
    let service = Arc::new(FakeEmbedder::new(8).fail_next([
        unavailable(),
        unavailable(),
        unavailable(),
        unavailable(),
    ]));
    let client = client_with(&service, 8, 4);

    let error = client.embed(&texts(2)).await.expect_err("budget exhausted");
    match error {
        PipelineError::EmbeddingRejected { reason, failed } => {
            assert!(reason.contains("after 4 attempts"), "reason: {reason}");
            assert_eq!(failed.len(), 2);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(service.call_count(), 4);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let service = Arc::new(FakeEmbedder::new(8).fail_next([ServiceError::Rejected {
        status: 401,
        message: "bad token".to_string(),
    }]));
    let client = client_with(&service, 8, 5);

    let error = client.embed(&texts(1)).await.expect_err("401 is permanent");
    assert!(matches!(error, PipelineError::EmbeddingRejected { .. }));
    assert_eq!(service.call_count(), 1);
}

#[tokio::test]
async fn wrong_dimensions_are_fatal() {
    let service = Arc::new(FakeEmbedder::new(8).with_output_dimensions(6));
    let client = client_with(&service, 8, 3);

    let error = client
        .embed_detailed(&texts(2))
        .await
        .expect_err("dimension mismatch");
    assert!(matches!(
        error,
        PipelineError::EmbeddingDimensionMismatch {
            index: 0,
            expected: 8,
            actual: 6
        }
    ));
    assert!(error.is_fatal());
}

#[tokio::test]
async fn partial_rejection_keeps_successful_vectors() {
    let service = Arc::new(FakeEmbedder::new(8).reject_containing("poison"));
    let client = client_with(&service, 8, 1);
    let input = vec![
        "red shoes".to_string(),
        "poison pill".to_string(),
        "blue hat".to_string(),
    ];

    let batch = client.embed_detailed(&input).await.expect("partial success");
    assert_eq!(batch.succeeded(), 2);
    assert!(batch.vectors[1].is_none());
    assert_eq!(batch.rejections.len(), 1);
    assert_eq!(batch.rejections[0].index, 1);

    let error = client.embed(&input).await.expect_err("embed is all-or-nothing");
    match error {
        PipelineError::EmbeddingRejected { failed, .. } => {
            assert_eq!(failed.iter().map(|f| f.index).collect::<Vec<_>>(), [1]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn health_check_embeds_one_text() {
    let service = Arc::new(FakeEmbedder::new(8));
    let client = client_with(&service, 8, 1);

    client.health_check().await.expect("healthy");
    assert_eq!(service.calls(), vec![vec!["health check".to_string()]]);
}
