mod cloud;
mod metrics;

use crate::cloud::{CloudShape, Payload};
use crate::metrics::EmulatorMetrics;
use anyhow::{anyhow, bail, Context};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Clone, Debug)]
struct Config {
    listen: String,
    metrics_listen_addr: String,
    points: usize,
    max_points: usize,
    radius: f32,
    noise: f32,
    spin: f32,
    latency_ms: u64,
    jitter_ms: u64,
    failure_chance_percent: u8,
    no_data_chance_percent: u8,
    warmup_ms: u64,
}

fn env_or<T: std::str::FromStr>(key: &str, default: &str) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    std::env::var(key)
        .unwrap_or_else(|_| default.into())
        .parse()
        .with_context(|| format!("invalid {key}"))
}

fn percent(key: &str) -> anyhow::Result<u8> {
    let value: u8 = env_or(key, "0")?;
    if value > 100 {
        bail!("{key} must be between 0 and 100");
    }
    Ok(value)
}

impl Config {
    fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            listen: std::env::var("EMULATOR_LISTEN_ADDR")
                .map_err(|_| anyhow!("EMULATOR_LISTEN_ADDR required"))?,
            metrics_listen_addr: std::env::var("EMULATOR_METRICS_LISTEN_ADDR")
                .map_err(|_| anyhow!("EMULATOR_METRICS_LISTEN_ADDR required"))?,
            points: env_or("EMULATOR_POINTS", "20000")?,
            max_points: env_or("EMULATOR_MAX_POINTS", "1000000")?,
            radius: env_or("EMULATOR_RADIUS", "1.0")?,
            noise: env_or("EMULATOR_NOISE", "0.0")?,
            spin: env_or("EMULATOR_SPIN", "0.5")?,
            latency_ms: env_or("EMULATOR_LATENCY_MS", "0")?,
            jitter_ms: env_or("EMULATOR_JITTER_MS", "0")?,
            failure_chance_percent: percent("EMULATOR_FAILURE_CHANCE_PERCENT")?,
            no_data_chance_percent: percent("EMULATOR_NO_DATA_CHANCE_PERCENT")?,
            warmup_ms: env_or("EMULATOR_WARMUP_MS", "0")?,
        })
    }

    fn shape(&self) -> CloudShape {
        CloudShape {
            points: self.points.min(self.max_points),
            radius: self.radius,
            noise: self.noise,
            spin: self.spin,
        }
    }
}

struct AppState {
    cfg: Config,
    metrics: Arc<EmulatorMetrics>,
    started: Instant,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let cfg = Config::from_env()?;
    tracing::info!(config = ?cfg, "Starting cloud emulator");

    let metrics = Arc::new(EmulatorMetrics::new().context("Failed to register metrics")?);

    // Start metrics server
    let router = metrics.router();
    let metrics_addr: std::net::SocketAddr = cfg.metrics_listen_addr.parse()?;
    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr).await?;
    tracing::info!(addr = %metrics_addr, "Metrics server started");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(metrics_listener, router.into_make_service()).await {
            tracing::error!(error = %e, "Metrics server failed");
        }
    });

    let listener = tokio::net::TcpListener::bind(&cfg.listen).await?;
    tracing::info!(addr = cfg.listen, points = cfg.shape().points, "Cloud emulator listening");

    let state = Arc::new(AppState {
        cfg,
        metrics,
        started: Instant::now(),
    });
    axum::serve(listener, app(state).into_make_service())
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    tracing::info!("Cloud emulator shut down.");
    Ok(())
}

fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/get_point_cloud", get(get_point_cloud))
        .with_state(state)
}

async fn get_point_cloud(State(state): State<Arc<AppState>>) -> Response {
    let cfg = &state.cfg;
    let metrics = &state.metrics;
    metrics.requests_total.inc();

    // Apply latency + jitter
    let jitter = if cfg.jitter_ms > 0 {
        rand::random::<u64>() % (cfg.jitter_ms + 1)
    } else {
        0
    };
    let total_delay = cfg.latency_ms + jitter;
    if total_delay > 0 {
        let delay_start = Instant::now();
        sleep(Duration::from_millis(total_delay)).await;
        metrics
            .latency_histogram
            .observe(delay_start.elapsed().as_secs_f64());
    }

    if roll(cfg.failure_chance_percent) {
        metrics
            .failures_injected_total
            .with_label_values(&["unavailable"])
            .inc();
        tracing::warn!(chance = cfg.failure_chance_percent, "Injecting sensor failure");
        return (StatusCode::SERVICE_UNAVAILABLE, "sensor unavailable").into_response();
    }

    let elapsed = state.started.elapsed();
    let payload = if elapsed < Duration::from_millis(cfg.warmup_ms) {
        Payload::no_data()
    } else if roll(cfg.no_data_chance_percent) {
        metrics
            .failures_injected_total
            .with_label_values(&["no_data"])
            .inc();
        Payload::no_data()
    } else {
        cloud::generate(&cfg.shape(), elapsed.as_secs_f32(), &mut rand::thread_rng())
    };

    match serde_json::to_vec(&payload) {
        Ok(body) => {
            let served = payload.points.as_ref().map_or(0, Vec::len);
            metrics.points_served_total.inc_by(served as u64);
            tracing::debug!(points = served, status = payload.status, "Served point cloud");
            ([(header::CONTENT_TYPE, "application/json")], body).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode point cloud");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

fn roll(chance_percent: u8) -> bool {
    chance_percent > 0 && rand::random::<u8>() % 100 < chance_percent
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            listen: "127.0.0.1:0".into(),
            metrics_listen_addr: "127.0.0.1:0".into(),
            points: 50,
            max_points: 10,
            radius: 1.0,
            noise: 0.0,
            spin: 0.0,
            latency_ms: 0,
            jitter_ms: 0,
            failure_chance_percent: 0,
            no_data_chance_percent: 0,
            warmup_ms: 0,
        }
    }

    async fn request(cfg: Config) -> (StatusCode, serde_json::Value, Arc<EmulatorMetrics>) {
        let metrics = Arc::new(EmulatorMetrics::new().unwrap());
        let state = Arc::new(AppState {
            cfg,
            metrics: metrics.clone(),
            started: Instant::now(),
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app(state).into_make_service()).await.unwrap();
        });

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        stream
            .write_all(b"GET /get_point_cloud HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();

        let status: u16 = raw[9..12].parse().unwrap();
        let body = raw.split("\r\n\r\n").nth(1).unwrap_or_default();
        let json = serde_json::from_str(body).unwrap_or(serde_json::Value::Null);
        (StatusCode::from_u16(status).unwrap(), json, metrics)
    }

    #[tokio::test]
    async fn serves_capped_cloud() {
        let (status, json, metrics) = request(config()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "success");
        assert_eq!(json["points"].as_array().unwrap().len(), 10);
        assert_eq!(metrics.points_served_total.get(), 10);
        assert_eq!(metrics.requests_total.get(), 1);
    }

    #[tokio::test]
    async fn certain_failure_returns_503() {
        let cfg = Config { failure_chance_percent: 100, ..config() };
        let (status, _, metrics) = request(cfg).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            metrics
                .failures_injected_total
                .with_label_values(&["unavailable"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn warmup_reports_no_data() {
        let cfg = Config { warmup_ms: 60_000, ..config() };
        let (status, json, metrics) = request(cfg).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "no data");
        assert!(json.get("points").is_none());
        assert_eq!(metrics.points_served_total.get(), 0);
    }

    #[test]
    fn zero_chance_never_rolls() {
        assert!((0..1000).all(|_| !roll(0)));
        assert!((0..1000).all(|_| roll(100)));
    }
}
