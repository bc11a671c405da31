use super::*;
use crate::ann::AnnError;
use crate::ingest::{IngestReport, IngestSource, Stage};
use crate::query::{QueryEngine, QueryError, ResultMaterializer, SearchResult};
use crate::records::{NeighborMetadata, Owner};

const RED: [u8; 3] = [255, 0, 0];
const GREEN: [u8; 3] = [0, 255, 0];
const BLUE: [u8; 3] = [0, 0, 255];

fn ingest(
    h: &Harness,
    deployment: &Deployment,
    files: &[(&str, [u8; 3])],
    owner: &Owner,
) -> IngestReport {
    let uris = files
        .iter()
        .map(|(name, rgb)| write_png(&h.images, name, *rgb).display().to_string())
        .collect();
    h.pipeline(deployment, IngestOptions::default())
        .ingest(IngestSource::Uris(uris), owner)
        .unwrap()
}

fn engine(h: &Harness, deployment: &Deployment) -> QueryEngine {
    QueryEngine::new(h.embedder.clone(), h.service.clone(), deployment.clone())
}

#[test]
fn test_search_returns_closest_images_first() {
    let h = Harness::new();
    let deployment = h.deploy();
    let report = ingest(
        &h,
        &deployment,
        &[("red.png", RED), ("green.png", GREEN), ("blue.png", BLUE)],
        &Owner::Admin,
    );

    let query = write_file(h.tmp.path(), "query.png", &png([250, 10, 10]));
    let results = engine(&h, &deployment).search(&query, 2, None).unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].image_path(), Some("images/admin/red.png"));
    assert!(results[0].distance >= results[1].distance);

    // hits trace back to the persisted records
    let red = report
        .persisted
        .iter()
        .find(|p| p.image_uri.file_name() == "red.png")
        .unwrap();
    assert_eq!(results[0].id, red.id.to_string());
    assert_eq!(
        results[0].metadata.as_ref().and_then(|m| m.user_type.as_deref()),
        Some("admin")
    );
}

#[test]
fn test_search_returns_at_most_k() {
    let h = Harness::new();
    let deployment = h.deploy();
    ingest(&h, &deployment, &[("red.png", RED), ("green.png", GREEN)], &Owner::Admin);

    let results = engine(&h, &deployment)
        .search_bytes(&png(BLUE), 10, None)
        .unwrap();

    assert_eq!(results.len(), 2);
}

#[test]
fn test_zero_neighbors_skips_the_query() {
    let h = Harness::new();
    let deployment = h.deploy();
    ingest(&h, &deployment, &[("red.png", RED)], &Owner::Admin);

    let results = engine(&h, &deployment).search_bytes(&png(RED), 0, None).unwrap();

    assert!(results.is_empty());
    assert_eq!(h.service.state().count("query_neighbors"), 0);
}

#[test]
fn test_results_are_ordered_regardless_of_service_order() {
    let h = Harness::new();
    let deployment = h.deploy();
    ingest(
        &h,
        &deployment,
        &[("red.png", RED), ("green.png", GREEN), ("blue.png", BLUE)],
        &Owner::Admin,
    );
    h.service.state().reverse_results = true;

    let results = engine(&h, &deployment).search_bytes(&png(GREEN), 3, None).unwrap();

    assert_eq!(results[0].image_path(), Some("images/admin/green.png"));
    assert!(results
        .windows(2)
        .all(|pair| pair[0].distance >= pair[1].distance));
}

#[test]
fn test_filter_restricts_results() {
    let h = Harness::new();
    let deployment = h.deploy();
    ingest(&h, &deployment, &[("mine.png", RED)], &Owner::User("1".to_string()));
    ingest(&h, &deployment, &[("other.png", RED)], &Owner::User("2".to_string()));
    ingest(&h, &deployment, &[("shared.png", RED)], &Owner::Admin);

    let filter = r#"[{"namespace": "user_id", "allowList": ["1"]}]"#;
    let results = engine(&h, &deployment)
        .search_bytes(&png(RED), 5, Some(filter))
        .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].image_path(), Some("images/users/1/mine.png"));
}

#[test]
fn test_invalid_filter_is_rejected() {
    let h = Harness::new();
    let deployment = h.deploy();
    ingest(&h, &deployment, &[("red.png", RED)], &Owner::Admin);

    let result = engine(&h, &deployment).search_bytes(&png(RED), 5, Some("user_id = 1"));

    assert!(matches!(
        result,
        Err(QueryError::Remote(AnnError::InvalidFilter(_)))
    ));
}

#[test]
fn test_query_dimension_must_match_index() {
    let h = Harness::new();
    let deployment = h.deploy();

    let result = engine(&h, &deployment).search_embedding(vec![1.0, 0.0, 0.0], 5, None);

    assert!(matches!(
        result,
        Err(QueryError::DimensionMismatch { expected: 4, got: 3 })
    ));
    assert_eq!(h.service.state().count("query_neighbors"), 0);
}

#[test]
fn test_undecodable_query_image() {
    let h = Harness::new();
    let deployment = h.deploy();

    let result = engine(&h, &deployment).search_bytes(b"not an image", 5, None);

    assert!(matches!(result, Err(QueryError::Embedding(_))));
}

#[test]
fn test_materialize_writes_results_in_order() {
    let h = Harness::new();
    let deployment = h.deploy();
    ingest(&h, &deployment, &[("red.png", RED), ("blue.png", BLUE)], &Owner::Admin);

    let mut results = engine(&h, &deployment).search_bytes(&png(RED), 2, None).unwrap();
    results.insert(
        1,
        SearchResult {
            id: "gs://sisterly/images/admin/missing.png".to_string(),
            distance: 0.0,
            metadata: None,
        },
    );

    let out = h.tmp.path().join("results");
    let report = ResultMaterializer::new(h.store.clone())
        .materialize(&results, &out)
        .unwrap();

    let positions: Vec<_> = report.written.iter().map(|f| f.position).collect();
    assert_eq!(positions, vec![0, 2]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].stage, Stage::Download);
    assert_eq!(report.failures[0].item, "gs://sisterly/images/admin/missing.png");

    assert_eq!(std::fs::read(out.join("result_0.jpg")).unwrap(), png(RED));
    assert_eq!(std::fs::read(out.join("result_2.jpg")).unwrap(), png(BLUE));
    assert!(!out.join("result_1.jpg").exists());
}

#[test]
fn test_materialize_without_known_path() {
    let h = Harness::new();
    let results = vec![SearchResult {
        id: "01jc0000000000000000000000".to_string(),
        distance: 1.0,
        metadata: Some(NeighborMetadata {
            user_type: Some("admin".to_string()),
            ..Default::default()
        }),
    }];

    let report = ResultMaterializer::new(h.store.clone())
        .materialize(&results, &h.tmp.path().join("results"))
        .unwrap();

    assert!(report.written.is_empty());
    assert_eq!(report.failures.len(), 1);
}
