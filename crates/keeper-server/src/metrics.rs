//! Prometheus metrics, exposed on the dedicated metrics listener.

use std::sync::LazyLock;

use actix_web::{App, HttpResponse, HttpServer, get};
use prometheus::{
    Encoder, IntCounterVec, IntGaugeVec, TextEncoder, register_int_counter_vec,
    register_int_gauge_vec,
};

use keeper_core::NodeMetrics;

static NODE_ALIVE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec!(
        "keeper_node_alive",
        "Liveness of registered nodes",
        &["node_id", "domain", "hostname"]
    )
    .expect("register keeper_node_alive")
});

static NODE_EVENT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "keeper_node_event_total",
        "Sync events processed per node",
        &["kind", "event", "node_id", "domain", "hostname"]
    )
    .expect("register keeper_node_event_total")
});

pub struct PromMetrics;

impl NodeMetrics for PromMetrics {
    fn node_alive(&self, node_id: &str, domain: &str, hostname: &str) {
        NODE_ALIVE
            .with_label_values(&[node_id, domain, hostname])
            .set(1);
    }

    fn node_event(&self, kind: &str, event: &str, node_id: &str, domain: &str, hostname: &str) {
        NODE_EVENT
            .with_label_values(&[kind, event, node_id, domain, hostname])
            .inc();
    }
}

#[get("/metrics")]
async fn metrics_endpoint() -> HttpResponse {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return HttpResponse::InternalServerError().finish();
    }
    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}

pub fn serve(prom_listen: std::net::SocketAddr) -> std::io::Result<actix_web::dev::Server> {
    Ok(HttpServer::new(|| App::new().service(metrics_endpoint))
        .bind(prom_listen)?
        .run())
}
