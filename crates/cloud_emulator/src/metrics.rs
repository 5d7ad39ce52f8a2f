use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

pub struct EmulatorMetrics {
    pub registry: Registry,
    pub requests_total: IntCounter,
    pub failures_injected_total: IntCounterVec,
    pub points_served_total: IntCounter,
    pub latency_histogram: Histogram,
}

impl EmulatorMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("cloud_emulator".into()), None)?;

        macro_rules! reg {
            ($m:expr) => {{
                let m = $m?;
                registry.register(Box::new(m.clone()))?;
                m
            }};
        }

        Ok(Self {
            requests_total: reg!(IntCounter::new(
                "requests_total",
                "Point-cloud requests received"
            )),
            failures_injected_total: reg!(IntCounterVec::new(
                Opts::new("failures_injected_total", "Injected failures by kind"),
                &["kind"]
            )),
            points_served_total: reg!(IntCounter::new(
                "points_served_total",
                "Points returned in successful responses"
            )),
            latency_histogram: reg!(Histogram::with_opts(
                HistogramOpts::new("latency_seconds", "Added latency distribution")
                    .buckets(prometheus::exponential_buckets(0.001, 2.0, 15)?)
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
