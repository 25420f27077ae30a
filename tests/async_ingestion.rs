//! Tokio wrapper tests.
//!
//! Run with: `cargo test --features async --test async_ingestion`

use std::sync::Arc;

use bus_cluster::{
    Action, AsyncIngestion, ClusterConfig, ClusterStore, GpsPoint, InMemoryClusterStore,
    IngestionCoordinator, IngestionRequest, Route, RouteCatalog,
};
use serde_json::json;

fn ingestion() -> (AsyncIngestion, Arc<InMemoryClusterStore>) {
    let route = Route::new(
        1,
        vec![GpsPoint::new(-34.9800, -71.2500), GpsPoint::new(-34.9800, -71.2400)],
    )
    .unwrap();
    let store = Arc::new(InMemoryClusterStore::new());
    let coordinator = IngestionCoordinator::new(
        Arc::new(RouteCatalog::new(vec![route])),
        store.clone(),
        ClusterConfig::default(),
    );
    (AsyncIngestion::new(Arc::new(coordinator)), store)
}

fn request(user: &str) -> IngestionRequest {
    serde_json::from_value(json!({
        "usuario_id": user,
        "latitud": -34.9800,
        "longitud": -71.2450,
        "direccion": 90.0,
        "velocidad": 7.5,
        "id_ruta": 1
    }))
    .unwrap()
}

#[tokio::test]
async fn test_single_request() {
    let (ingestion, _store) = ingestion();
    let response = ingestion.ingest(request("ana")).await.unwrap();
    assert!(response.success);
    assert_eq!(response.data.accion, Action::ClusterCreated);
    assert!(response.data.en_bus);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batch_forms_one_cluster() {
    let (ingestion, store) = ingestion();
    let requests = (0..10).map(|i| request(&format!("rider-{}", i))).collect();
    let responses = ingestion.ingest_batch(requests).await;

    assert_eq!(responses.len(), 10);
    let ok: Vec<_> = responses.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(
        ok.iter()
            .filter(|r| r.data.accion == Action::ClusterCreated)
            .count(),
        1
    );

    let stats = store.stats().unwrap();
    assert_eq!(stats.active_clusters, 1);
    assert_eq!(stats.memberships, 10);
}

#[tokio::test]
async fn test_unknown_route_error() {
    let (ingestion, _store) = ingestion();
    let mut bad = request("ana");
    bad.id_ruta = 9;
    let err = ingestion.ingest(bad).await.unwrap_err();
    assert_eq!(err.status_code(), 404);
}
