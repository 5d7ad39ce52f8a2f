use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

pub struct PipelineMetrics {
    pub registry: Registry,
    pub cycles_total: IntCounter,
    pub ingest_failures_total: IntCounterVec,
    pub overflow_dropped_total: IntCounter,
    pub faults_total: IntCounter,
    pub active_entries: IntGauge,
    pub batch_points: IntGauge,
    pub cycle_duration: Histogram,
}

impl PipelineMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("pointstream".into()), None)?;

        macro_rules! reg {
            ($m:expr) => {{
                let m = $m?;
                registry.register(Box::new(m.clone()))?;
                m
            }};
        }

        Ok(Self {
            cycles_total: reg!(IntCounter::new(
                "cycles_total",
                "Cycles that committed a new frame"
            )),
            ingest_failures_total: reg!(IntCounterVec::new(
                Opts::new("ingest_failures_total", "Failed fetch/decode attempts"),
                &["kind"]
            )),
            overflow_dropped_total: reg!(IntCounter::new(
                "overflow_dropped_total",
                "Points dropped because a batch exceeded pool capacity"
            )),
            faults_total: reg!(IntCounter::new(
                "faults_total",
                "Times the scheduler entered the faulted state"
            )),
            active_entries: reg!(IntGauge::new(
                "active_entries",
                "Valid entries in the committed frame"
            )),
            batch_points: reg!(IntGauge::new(
                "batch_points",
                "Points in the most recent decoded batch"
            )),
            cycle_duration: reg!(Histogram::with_opts(
                HistogramOpts::new("cycle_duration_seconds", "Fetch-to-commit latency")
                    .buckets(prometheus::exponential_buckets(0.001, 2.0, 14)?)
            )),
            registry,
        })
    }

    pub fn router(&self) -> Router {
        let reg = self.registry.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let reg = reg.clone();
                async move {
                    let mut buf = Vec::new();
                    match TextEncoder::new().encode(&reg.gather(), &mut buf) {
                        Ok(()) => String::from_utf8_lossy(&buf).into_owned().into_response(),
                        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
                    }
                }
            }),
        )
    }
}
