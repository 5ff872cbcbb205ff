//! Prometheus metrics (Rust `prometheus` crate).
//!
//! One `MetricsContext` per voice connection. Handles are cheap clones of
//! the same registry, so the pacing and receive tasks can each hold one.

use anyhow::Result;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};
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

/// Prometheus registry + handles for one voice connection.
///
/// Hot-path instrumentation is just counter increments, gauge sets and
/// histogram observations.
#[derive(Clone)]
pub struct MetricsContext {
    // ---
    registry: Registry,

    // Media counters
    pub packets_sent_total: IntCounter,
    pub packets_received_total: IntCounter,
    pub packets_lost_total: IntCounter,
    pub packets_dropped_total: IntCounter,
    pub decrypt_failures_total: IntCounter,

    pub bytes_sent_total: IntCounter,
    pub bytes_received_total: IntCounter,

    // Queue / session gauges
    pub transmit_queue_depth: IntGauge,
    pub ws_rtt_ms: IntGauge,
    pub udp_rtt_ms: IntGauge,

    // Codec latency histograms (seconds)
    pub encode_seconds: Histogram,
    pub decode_seconds: Histogram,
}

impl MetricsContext {
    // ---
    /// Create a new registry and register the voice metrics.
    ///
    /// `guild` is applied as a constant label (`guild=<id>`).
    pub fn new(guild: &str) -> Result<Self> {
        // ---
        let registry = Registry::new_custom(
            Some("voicenext".into()),
            Some(prometheus::labels! { "guild".to_string() => guild.to_string() }),
        )?;

        let packets_sent_total = IntCounter::with_opts(Opts::new(
            "rtp_packets_sent_total",
            "Total voice RTP packets sent",
        ))?;
        let packets_received_total = IntCounter::with_opts(Opts::new(
            "rtp_packets_received_total",
            "Total voice RTP packets accepted by the decode pipeline",
        ))?;
        let packets_lost_total = IntCounter::with_opts(Opts::new(
            "rtp_packets_lost_total",
            "Total voice RTP packets detected as lost via sequence gaps",
        ))?;
        let packets_dropped_total = IntCounter::with_opts(Opts::new(
            "rtp_packets_dropped_total",
            "Total inbound datagrams dropped as malformed or out of order",
        ))?;
        let decrypt_failures_total = IntCounter::with_opts(Opts::new(
            "rtp_decrypt_failures_total",
            "Total inbound voice payloads that failed authentication",
        ))?;

        let bytes_sent_total = IntCounter::with_opts(Opts::new(
            "udp_bytes_sent_total",
            "Total UDP bytes sent on the media path",
        ))?;
        let bytes_received_total = IntCounter::with_opts(Opts::new(
            "udp_bytes_received_total",
            "Total UDP bytes received on the media path",
        ))?;

        let transmit_queue_depth = IntGauge::with_opts(Opts::new(
            "transmit_queue_depth_frames",
            "PCM frames waiting in the outbound pacing queue",
        ))?;
        let ws_rtt_ms = IntGauge::with_opts(Opts::new(
            "gateway_rtt_milliseconds",
            "Last heartbeat round-trip time on the signaling socket",
        ))?;
        let udp_rtt_ms = IntGauge::with_opts(Opts::new(
            "udp_rtt_milliseconds",
            "Last keepalive round-trip time on the media socket",
        ))?;

        let encode_seconds = Histogram::with_opts(HistogramOpts::new(
            "opus_encode_seconds",
            "Opus encode duration in seconds",
        ))?;
        let decode_seconds = Histogram::with_opts(HistogramOpts::new(
            "opus_decode_seconds",
            "Opus decode duration in seconds",
        ))?;

        // Register all metrics
        registry.register(Box::new(packets_sent_total.clone()))?;
        registry.register(Box::new(packets_received_total.clone()))?;
        registry.register(Box::new(packets_lost_total.clone()))?;
        registry.register(Box::new(packets_dropped_total.clone()))?;
        registry.register(Box::new(decrypt_failures_total.clone()))?;
        registry.register(Box::new(bytes_sent_total.clone()))?;
        registry.register(Box::new(bytes_received_total.clone()))?;
        registry.register(Box::new(transmit_queue_depth.clone()))?;
        registry.register(Box::new(ws_rtt_ms.clone()))?;
        registry.register(Box::new(udp_rtt_ms.clone()))?;
        registry.register(Box::new(encode_seconds.clone()))?;
        registry.register(Box::new(decode_seconds.clone()))?;

        Ok(Self {
            registry,
            packets_sent_total,
            packets_received_total,
            packets_lost_total,
            packets_dropped_total,
            decrypt_failures_total,
            bytes_sent_total,
            bytes_received_total,
            transmit_queue_depth,
            ws_rtt_ms,
            udp_rtt_ms,
            encode_seconds,
            decode_seconds,
        })
    }

    /// Gather metric families from this registry.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        // ---
        self.registry.gather()
    }

    /// Spawns a minimal HTTP server that serves `GET /metrics`.
    ///
    /// Callers decide whether to run it; the library never does.
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

            Server::bind(&cfg.bind)
                .serve(make_svc)
                .await
                .map_err(|e| anyhow::anyhow!(e))
        })
    }
}

async fn handle_metrics_request(
    req: Request<Body>,
    registry: Arc<Registry>,
) -> Result<Response<Body>, hyper::Error> {
    if req.method() != Method::GET || req.uri().path() != "/metrics" {
        let mut resp = Response::new(Body::from("not found"));
        *resp.status_mut() = StatusCode::NOT_FOUND;
        return Ok(resp);
    }

    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&registry.gather(), &mut buffer) {
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

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn metrics_context_gathers_voice_families() {
        // ---
        let ctx = MetricsContext::new("1234").expect("MetricsContext should init");
        ctx.packets_sent_total.inc();
        ctx.udp_rtt_ms.set(12);

        let names: Vec<String> = ctx.gather().iter().map(|f| f.get_name().to_string()).collect();
        assert!(names.contains(&"voicenext_rtp_packets_sent_total".to_string()));
        assert!(names.contains(&"voicenext_udp_rtt_milliseconds".to_string()));
    }

    #[test]
    fn clones_share_registry() {
        // ---
        let ctx = MetricsContext::new("1").unwrap();
        let other = ctx.clone();
        other.packets_lost_total.inc_by(3);

        assert_eq!(ctx.packets_lost_total.get(), 3);
    }
}
