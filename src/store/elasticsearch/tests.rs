use super::*;
use crate::store::{KnnQuery, LexicalQuery};
use wiremock::matchers::{body_json, body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> ElasticsearchClient {
    let base = Url::parse(&server.uri()).expect("mock server uri should parse");
    ElasticsearchClient::new(base, Duration::from_secs(5), Some("secret"))
}

fn knn_query() -> KnnQuery {
    KnnQuery {
        field: "productEmbedding".to_string(),
        vector: vec![0.5, 0.5],
        k: 5,
        num_candidates: 50,
        boost: None,
    }
}

fn lexical_query() -> LexicalQuery {
    LexicalQuery {
        text: "red shoes".to_string(),
        fields: vec![("name".to_string(), 10.0), ("description".to_string(), 5.0)],
        boost: 2.5,
    }
}

#[test]
fn knn_body_excludes_vector_field() {
    let body = search_body(&SearchQuery {
        knn: Some(knn_query()),
        lexical: None,
        size: 5,
        exclude_fields: vec!["productEmbedding".to_string()],
    });

    assert_eq!(
        body,
        json!({
            "size": 5,
            "_source": { "excludes": ["productEmbedding"] },
            "knn": {
                "field": "productEmbedding",
                "query_vector": [0.5, 0.5],
                "k": 5,
                "num_candidates": 50
            }
        })
    );
}

#[test]
fn lexical_body_weights_fields() {
    let body = search_body(&SearchQuery {
        lexical: Some(lexical_query()),
        size: 3,
        ..SearchQuery::default()
    });

    assert_eq!(
        body["query"]["multi_match"]["fields"],
        json!(["name^10.0", "description^5.0"])
    );
    assert_eq!(body["query"]["multi_match"]["boost"], json!(2.5));
    assert!(body.get("knn").is_none());
}

#[test]
fn hybrid_body_combines_both_clauses() {
    let mut knn = knn_query();
    knn.boost = Some(2.0);
    let body = search_body(&SearchQuery {
        knn: Some(knn),
        lexical: Some(lexical_query()),
        size: 5,
        exclude_fields: Vec::new(),
    });

    let should = body["query"]["bool"]["should"]
        .as_array()
        .expect("should clause is an array");
    assert_eq!(should.len(), 2);
    assert!(should[0].get("multi_match").is_some());
    assert_eq!(should[1]["knn"]["boost"], json!(2.0));
    assert_eq!(body["query"]["bool"]["minimum_should_match"], json!(1));
}

#[test]
fn error_reason_prefers_structured_error() {
    let body = r#"{"error":{"type":"mapper_parsing_exception","reason":"bad dims"},"status":400}"#;
    assert_eq!(error_reason(body), "mapper_parsing_exception: bad dims");

    let long = "é".repeat(1000);
    assert_eq!(error_reason(&long).chars().count(), ERROR_SNIPPET_CHARS);
}

#[tokio::test]
async fn pages_with_point_in_time_and_search_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/products/_pit"))
        .and(query_param("keep_alive", "5m"))
        .and(header("Authorization", "ApiKey secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "pit-1" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/_search"))
        .and(body_partial_json(json!({
            "size": 2,
            "sort": [{ "id": "asc" }],
            "search_after": ["a2"],
            "pit": { "id": "pit-1" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "pit_id": "pit-2",
            "hits": { "hits": [
                { "_id": "a3", "_source": { "name": "boots" }, "sort": ["a3"] }
            ]}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let snapshot = client
        .open_snapshot("products")
        .await
        .expect("pit should open");
    assert_eq!(snapshot.as_deref(), Some("pit-1"));

    let after = Cursor::new(vec![json!("a2")]);
    let page = client
        .fetch_page(PageRequest {
            index: "products",
            snapshot: snapshot.as_deref(),
            after: Some(&after),
            size: 2,
        })
        .await
        .expect("page should load");

    assert_eq!(page.snapshot.as_deref(), Some("pit-2"));
    assert_eq!(page.documents.len(), 1);
    assert_eq!(page.documents[0].id, "a3");
    assert_eq!(page.documents[0].sort, Cursor::new(vec![json!("a3")]));
    assert_eq!(page.documents[0].fields["name"], json!("boots"));
}

#[tokio::test]
async fn pages_without_snapshot_hit_the_index() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/products/_search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "hits": { "hits": [] }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server).with_point_in_time(false);
    assert_eq!(client.open_snapshot("products").await.expect("no pit"), None);

    let page = client
        .fetch_page(PageRequest {
            index: "products",
            snapshot: None,
            after: None,
            size: 10,
        })
        .await
        .expect("page should load");
    assert!(page.documents.is_empty());
}

#[tokio::test]
async fn text_sort_field_falls_back_to_keyword() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/products/_mapping/field/id"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "products": {
                "mappings": {
                    "id": {
                        "full_name": "id",
                        "mapping": {
                            "id": {
                                "type": "text",
                                "fields": { "keyword": { "type": "keyword", "ignore_above": 256 } }
                            }
                        }
                    }
                }
            }
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/products/_search"))
        .and(body_partial_json(json!({ "sort": [{ "id.keyword": "asc" }] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "hits": { "hits": [] }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut client = client_for(&server).with_point_in_time(false);
    client
        .resolve_sort_field("products")
        .await
        .expect("mapping readable");
    assert_eq!(client.sort_field(), "id.keyword");

    client
        .fetch_page(PageRequest {
            index: "products",
            snapshot: None,
            after: None,
            size: 10,
        })
        .await
        .expect("page sorted on the keyword sub-field");
}

#[tokio::test]
async fn keyword_sort_field_is_kept() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/products/_mapping/field/sku"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "products": {
                "mappings": {
                    "sku": { "full_name": "sku", "mapping": { "sku": { "type": "keyword" } } }
                }
            }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/missing/_mapping/field/sku"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let mut client = client_for(&server).with_sort_field("sku");
    client
        .resolve_sort_field("products")
        .await
        .expect("mapping readable");
    assert_eq!(client.sort_field(), "sku");

    client
        .resolve_sort_field("missing")
        .await
        .expect("missing index is left to the reader");
    assert_eq!(client.sort_field(), "sku");
}

#[tokio::test]
async fn server_errors_are_retryable_but_bad_requests_are_not() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/flaky/_search"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/broken/_search"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "type": "parsing_exception", "reason": "unknown key" }
        })))
        .mount(&server)
        .await;

    let client = client_for(&server).with_point_in_time(false);
    let request = |index| PageRequest {
        index,
        snapshot: None,
        after: None,
        size: 1,
    };

    let flaky = client
        .fetch_page(request("flaky"))
        .await
        .expect_err("503 should fail");
    assert!(crate::retry::Retryable::is_retryable(&flaky));

    let broken = client
        .fetch_page(request("broken"))
        .await
        .expect_err("400 should fail");
    assert!(!crate::retry::Retryable::is_retryable(&broken));
    assert!(broken.to_string().contains("parsing_exception: unknown key"));
}

#[tokio::test]
async fn inspect_reads_vector_mapping() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dest/_mapping"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "dest-000001": { "mappings": { "properties": {
                "name": { "type": "text" },
                "productEmbedding": { "type": "dense_vector", "dims": 512 }
            }}}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/absent/_mapping"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": { "type": "index_not_found_exception", "reason": "no such index" }
        })))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let state = client
        .inspect("dest", "productEmbedding")
        .await
        .expect("mapping should load");
    assert_eq!(
        state,
        IndexState::Present {
            vector_field: Some(FieldMapping {
                field_type: "dense_vector".to_string(),
                dims: Some(512),
            })
        }
    );

    let unmapped = client
        .inspect("dest", "otherField")
        .await
        .expect("mapping should load");
    assert_eq!(unmapped, IndexState::Present { vector_field: None });

    let missing = client
        .inspect("absent", "productEmbedding")
        .await
        .expect("404 means missing");
    assert_eq!(missing, IndexState::Missing);
}

#[tokio::test]
async fn create_index_declares_cosine_dense_vector() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/dest"))
        .and(body_json(json!({
            "mappings": { "properties": { "productEmbedding": {
                "type": "dense_vector",
                "dims": 512,
                "index": true,
                "similarity": "cosine"
            }}}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "acknowledged": true })))
        .expect(1)
        .mount(&server)
        .await;

    client_for(&server)
        .create_index("dest", "productEmbedding", 512)
        .await
        .expect("index should be created");
}

#[tokio::test]
async fn bulk_upsert_reports_each_item() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .and(header("Content-Type", "application/x-ndjson"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errors": true,
            "items": [
                { "index": { "_id": "1", "status": 201 } },
                { "index": { "_id": "2", "status": 429,
                    "error": { "type": "es_rejected_execution_exception", "reason": "queue full" } } },
                { "index": { "_id": "3", "status": 400,
                    "error": { "type": "mapper_parsing_exception", "reason": "wrong dims" } } }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let documents: Vec<IndexRequest> = ["1", "2", "3"]
        .into_iter()
        .map(|id| IndexRequest {
            id: id.to_string(),
            source: Map::new(),
        })
        .collect();

    let outcomes = client_for(&server)
        .bulk_upsert("dest", &documents)
        .await
        .expect("bulk call should succeed");

    assert!(outcomes[0].is_success());
    assert!(outcomes[1].is_retryable());
    assert!(!outcomes[2].is_success());
    assert!(!outcomes[2].is_retryable());
    assert_eq!(
        outcomes[2].error.as_deref(),
        Some("mapper_parsing_exception: wrong dims")
    );

    let received = server
        .received_requests()
        .await
        .expect("request recording is enabled");
    let payload = String::from_utf8_lossy(&received[0].body).into_owned();
    let first_line: Value =
        serde_json::from_str(payload.lines().next().expect("payload has lines"))
            .expect("action line is json");
    assert_eq!(first_line, json!({ "index": { "_index": "dest", "_id": "1" } }));
    assert_eq!(payload.lines().count(), 6);
}

#[tokio::test]
async fn get_distinguishes_missing_document() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dest/_doc/known"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_id": "known", "found": true, "_source": { "name": "shoes" }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/dest/_doc/unknown"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "_id": "unknown", "found": false
        })))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let known = client
        .get("dest", "known")
        .await
        .expect("lookup should succeed")
        .expect("document exists");
    assert_eq!(known["name"], json!("shoes"));

    assert!(
        client
            .get("dest", "unknown")
            .await
            .expect("lookup should succeed")
            .is_none()
    );
}

#[tokio::test]
async fn search_returns_scored_hits() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/dest/_search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "hits": { "hits": [
                { "_id": "p1", "_score": 0.93, "_source": { "name": "red shoes" } },
                { "_id": "p2", "_score": 0.71, "_source": { "name": "red hat" } }
            ]}
        })))
        .mount(&server)
        .await;

    let hits = client_for(&server)
        .search(
            "dest",
            &SearchQuery {
                knn: Some(knn_query()),
                size: 5,
                ..SearchQuery::default()
            },
        )
        .await
        .expect("search should succeed");

    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].id, "p1");
    assert!((hits[0].score - 0.93).abs() < f32::EPSILON);
}
