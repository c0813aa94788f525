//! Prometheus metrics definitions and HTTP server

use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Reconciliation attempts by outcome (success, deferred, error)
    pub static ref RECONCILIATIONS: CounterVec = register_counter_vec!(
        "database_operator_reconciliations_total",
        "Total number of reconciliations",
        &["outcome"]
    ).unwrap();

    /// Reconciliation errors by class
    pub static ref RECONCILIATION_ERRORS: CounterVec = register_counter_vec!(
        "database_operator_reconciliation_errors_total",
        "Total number of reconciliation errors",
        &["class"]
    ).unwrap();

    /// Reconciliation duration histogram
    pub static ref RECONCILE_DURATION: HistogramVec = register_histogram_vec!(
        "database_operator_reconcile_duration_seconds",
        "Duration of reconciliations in seconds",
        &["engine"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).unwrap();

    /// Deferred steps by reason (closed window, running unit, ...)
    pub static ref DEFERRALS: CounterVec = register_counter_vec!(
        "database_operator_deferrals_total",
        "Total number of deferred reconciliation steps",
        &["reason"]
    ).unwrap();

    /// Database phase transitions
    pub static ref PHASE_TRANSITIONS: CounterVec = register_counter_vec!(
        "database_operator_phase_transitions_total",
        "Total number of Database phase transitions",
        &["from", "to"]
    ).unwrap();

    /// Credential rotation phase transitions
    pub static ref ROTATION_TRANSITIONS: CounterVec = register_counter_vec!(
        "database_operator_rotation_transitions_total",
        "Total number of credential rotation phase transitions",
        &["to"]
    ).unwrap();

    /// Backup schedule synchronisations by outcome
    pub static ref BACKUP_SCHEDULE_SYNCS: CounterVec = register_counter_vec!(
        "database_operator_backup_schedule_syncs_total",
        "Total number of backup schedule synchronisations",
        &["outcome"]
    ).unwrap();

    /// Operator health (1 = healthy, 0 = unhealthy)
    pub static ref OPERATOR_HEALTH: prometheus::Gauge = prometheus::register_gauge!(
        "database_operator_health",
        "Operator health status (1 = healthy, 0 = unhealthy)"
    ).unwrap();
}

/// Start the metrics HTTP server
pub async fn serve(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    // Set initial health
    OPERATOR_HEALTH.set(1.0);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!("Error serving connection: {}", e);
            }
        });
    }
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => metrics_response(),
        "/healthz" | "/health" => text_response(StatusCode::OK, "ok"),
        "/readyz" | "/ready" if OPERATOR_HEALTH.get() > 0.0 => text_response(StatusCode::OK, "ok"),
        "/readyz" | "/ready" => text_response(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(response)
}

/// Generate metrics response
fn metrics_response() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics");
    }

    let mut response = Response::new(Full::new(Bytes::from(buffer)));
    if let Ok(content_type) = encoder.format_type().parse() {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, content_type);
    }
    response
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}

/// Record a finished reconciliation attempt
pub fn record_outcome(outcome: &str) {
    RECONCILIATIONS.with_label_values(&[outcome]).inc();
}

/// Record a reconciliation error by class
pub fn record_error(class: &str) {
    RECONCILIATION_ERRORS.with_label_values(&[class]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_registered() {
        record_outcome("success");
        record_error("transient");
        DEFERRALS.with_label_values(&["MaintenanceWindowClosed"]).inc();
        let names: Vec<String> = prometheus::gather()
            .iter()
            .map(|f| f.get_name().to_string())
            .collect();
        assert!(names.contains(&"database_operator_reconciliations_total".to_string()));
        assert!(names.contains(&"database_operator_deferrals_total".to_string()));
    }

    #[test]
    fn test_unknown_path_is_not_found() {
        let response = text_response(StatusCode::NOT_FOUND, "Not Found");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
