//! End-to-end ingestion over real HTTP against a local axum server.

use axum::{extract::State, http::StatusCode, routing::get, Router};
use parking_lot::Mutex;
use pointstream::{
    CycleOutcome, HttpTransport, IngestClient, IngestError, Pipeline, PipelineConfig,
    PipelineMetrics, TransportError,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

type Reply = Arc<Mutex<(StatusCode, String)>>;

async fn serve(initial: (StatusCode, &str)) -> (SocketAddr, Reply) {
    let reply: Reply = Arc::new(Mutex::new((initial.0, initial.1.to_owned())));
    let router = Router::new()
        .route(
            "/get_point_cloud",
            get(|State(reply): State<Reply>| async move { reply.lock().clone() }),
        )
        .with_state(reply.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router.into_make_service()).await.unwrap();
    });
    (addr, reply)
}

fn url(addr: SocketAddr) -> String {
    format!("http://{addr}/get_point_cloud")
}

const TWO_POINTS: &str =
    r#"{"status":"success","points":[[0,0,0],[1,1,1]],"colors":[[1,0,0],[0,1,0]]}"#;

#[tokio::test]
async fn http_fetch_decodes_payload() {
    let (addr, _) = serve((StatusCode::OK, TWO_POINTS)).await;
    let transport = HttpTransport::new(Duration::from_secs(1)).unwrap();
    let client = IngestClient::new(transport, url(addr), Duration::from_secs(2));

    let batch = client.fetch().await.unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(batch.colors()[1].y, 1.0);
}

#[tokio::test]
async fn http_error_status_is_transport_error() {
    let (addr, _) = serve((StatusCode::SERVICE_UNAVAILABLE, "busy")).await;
    let transport = HttpTransport::new(Duration::from_secs(1)).unwrap();
    let client = IngestClient::new(transport, url(addr), Duration::from_secs(2));

    let err = client.fetch().await.unwrap_err();
    assert!(matches!(err, IngestError::Transport(TransportError::HttpStatus(503))));
}

#[tokio::test]
async fn unreachable_server_is_transport_error() {
    // Bind then drop to get a port nobody listens on.
    let addr = {
        let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap()
    };
    let transport = HttpTransport::new(Duration::from_millis(500)).unwrap();
    let client = IngestClient::new(transport, url(addr), Duration::from_secs(2));

    let err = client.fetch().await.unwrap_err();
    assert!(matches!(err, IngestError::Transport(TransportError::Request(_))));
}

#[tokio::test]
async fn pipeline_keeps_frame_when_sensor_loses_data() {
    let (addr, reply) = serve((StatusCode::OK, TWO_POINTS)).await;
    let config = PipelineConfig {
        server_url: url(addr),
        max_entries: 16,
        worker_threads: 2,
        ..Default::default()
    };
    let transport = HttpTransport::new(Duration::from_secs(1)).unwrap();
    let metrics = Arc::new(PipelineMetrics::new().unwrap());
    let mut pipeline = Pipeline::new(config, transport, metrics.clone()).unwrap();

    assert!(matches!(pipeline.run_cycle().await, CycleOutcome::Committed { entries: 2, .. }));
    let good = pipeline.current_frame().clone();

    *reply.lock() = (StatusCode::OK, r#"{"status":"no data"}"#.into());
    assert!(matches!(pipeline.run_cycle().await, CycleOutcome::Skipped(IngestError::Status(_))));
    assert_eq!(*pipeline.current_frame(), good);
    assert_eq!(metrics.ingest_failures_total.with_label_values(&["status"]).get(), 1);

    pipeline.shutdown();
}
