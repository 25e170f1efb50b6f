//! Prometheus metrics (Rust `prometheus` crate).
//!
//! One `MetricsContext` is intended per process. The pipelines expose
//! counters through their stats accessors; the embedding application owns
//! the registry and decides whether to serve it.

use anyhow::Result;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Configuration for the built-in Prometheus scrape endpoint.
#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    // ---
    /// Address to bind, e.g. `127.0.0.1:9100`.
    pub bind: SocketAddr,
}

impl MetricsServerConfig {
    // ---
    pub fn new(bind: SocketAddr) -> Self {
        // ---
        Self { bind }
    }
}

/// Prometheus metrics registry + handles.
///
/// A thin, explicit wrapper around the `prometheus` crate so hot-path
/// instrumentation is just counter increments.
#[derive(Clone)]
pub struct MetricsContext {
    // ---
    registry: Registry,

    // Packet counters
    pub packets_received_total: IntCounter,
    pub packets_dropped_total: IntCounter,
    pub packets_late_total: IntCounter,
    pub packets_recovered_total: IntCounter,

    // Session lifecycle
    pub sessions_created_total: IntCounter,
    pub sessions_removed_total: IntCounter,
    pub sessions_active: IntGauge,

    // Playout quality
    pub frames_incomplete_total: IntCounter,
    pub silence_samples_total: IntCounter,
}

impl MetricsContext {
    // ---
    /// Create a new registry and register the standard metrics.
    ///
    /// `process_name` is applied as a constant label (`process=<name>`).
    pub fn new(process_name: &str) -> Result<Self> {
        // ---
        let registry = Registry::new_custom(
            Some("rtp_pcm_streamer".into()),
            Some(prometheus::labels! { "process".to_string() => process_name.to_string() }),
        )?;

        let packets_received_total = IntCounter::with_opts(Opts::new(
            "packets_received_total",
            "Total packets admitted by a port",
        ))?;
        let packets_dropped_total = IntCounter::with_opts(Opts::new(
            "packets_dropped_total",
            "Total packets dropped as unparseable or unroutable",
        ))?;
        let packets_late_total = IntCounter::with_opts(Opts::new(
            "packets_late_total",
            "Total packets that arrived after their playout position",
        ))?;
        let packets_recovered_total = IntCounter::with_opts(Opts::new(
            "packets_recovered_total",
            "Total packets reconstructed by FEC",
        ))?;

        let sessions_created_total = IntCounter::with_opts(Opts::new(
            "sessions_created_total",
            "Total receiver sessions created",
        ))?;
        let sessions_removed_total = IntCounter::with_opts(Opts::new(
            "sessions_removed_total",
            "Total receiver sessions torn down",
        ))?;
        let sessions_active = IntGauge::with_opts(Opts::new(
            "sessions_active",
            "Receiver sessions currently alive",
        ))?;

        let frames_incomplete_total = IntCounter::with_opts(Opts::new(
            "frames_incomplete_total",
            "Total output frames containing gap samples",
        ))?;
        let silence_samples_total = IntCounter::with_opts(Opts::new(
            "silence_samples_total",
            "Total samples of silence inserted for lost packets",
        ))?;

        registry.register(Box::new(packets_received_total.clone()))?;
        registry.register(Box::new(packets_dropped_total.clone()))?;
        registry.register(Box::new(packets_late_total.clone()))?;
        registry.register(Box::new(packets_recovered_total.clone()))?;
        registry.register(Box::new(sessions_created_total.clone()))?;
        registry.register(Box::new(sessions_removed_total.clone()))?;
        registry.register(Box::new(sessions_active.clone()))?;
        registry.register(Box::new(frames_incomplete_total.clone()))?;
        registry.register(Box::new(silence_samples_total.clone()))?;

        Ok(Self {
            registry,
            packets_received_total,
            packets_dropped_total,
            packets_late_total,
            packets_recovered_total,
            sessions_created_total,
            sessions_removed_total,
            sessions_active,
            frames_incomplete_total,
            silence_samples_total,
        })
    }

    /// Gather metric families from this registry.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        // ---
        self.registry.gather()
    }

    /// Spawns a minimal HTTP server that serves `GET /metrics`.
    ///
    /// This is intentionally explicit (callers decide whether to run it).
    pub fn spawn_metrics_server(&self, cfg: MetricsServerConfig) -> JoinHandle<Result<()>> {
        // ---
        let registry = Arc::new(self.registry.clone());
        tokio::spawn(async move {
            // ---
            let make_svc = make_service_fn(move |_conn| {
                let registry = Arc::clone(&registry);
                async move {
                    Ok::<_, hyper::Error>(service_fn(move |req| {
                        let registry = Arc::clone(&registry);
                        async move { handle_metrics_request(req, registry).await }
                    }))
                }
            });

            let server = Server::bind(&cfg.bind).serve(make_svc);
            server.await.map_err(|e| anyhow::anyhow!(e))?;
            Ok(())
        })
    }
}

async fn handle_metrics_request(
    req: Request<Body>,
    registry: Arc<Registry>,
) -> Result<Response<Body>, hyper::Error> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let encoder = TextEncoder::new();
            let metric_families = registry.gather();
            let mut buffer = Vec::new();

            if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                let mut resp = Response::new(Body::from(format!("encode error: {e}")));
                *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                return Ok(resp);
            }

            let mut resp = Response::new(Body::from(buffer));
            resp.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            Ok(resp)
        }
        _ => {
            let mut resp = Response::new(Body::from("not found"));
            *resp.status_mut() = StatusCode::NOT_FOUND;
            Ok(resp)
        }
    }
}
