//! Prometheus metrics for the connection hub.
//!
//! Each `HubMetrics` owns its registry so several hubs (one per test) never
//! collide on metric names.

use actix_web::{http::header, web, HttpResponse};
use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};

use crate::state::AppState;

#[derive(Clone)]
pub struct HubMetrics {
    registry: Registry,
    pub connected_users: IntGauge,
    pub live_connections: IntGauge,
    pub events_pushed: IntCounter,
    pub events_dropped: IntCounter,
}

impl HubMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let connected_users = IntGauge::with_opts(Opts::new(
            "chat_connected_users",
            "Users with at least one live WebSocket connection",
        ))?;
        let live_connections = IntGauge::with_opts(Opts::new(
            "chat_live_connections",
            "Open WebSocket connections",
        ))?;
        let events_pushed = IntCounter::with_opts(Opts::new(
            "chat_events_pushed_total",
            "Events handed to a connection's send buffer",
        ))?;
        let events_dropped = IntCounter::with_opts(Opts::new(
            "chat_events_dropped_total",
            "Events dropped because the connection was closed or its buffer was full",
        ))?;

        registry.register(Box::new(connected_users.clone()))?;
        registry.register(Box::new(live_connections.clone()))?;
        registry.register(Box::new(events_pushed.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;

        Ok(Self {
            registry,
            connected_users,
            live_connections,
            events_pushed,
            events_dropped,
        })
    }

    /// Text exposition format.
    pub fn render(&self) -> Result<(String, Vec<u8>), prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

/// GET /metrics
pub async fn metrics_handler(state: web::Data<AppState>) -> HttpResponse {
    let Some(metrics) = state.registry.metrics() else {
        return HttpResponse::NotFound().finish();
    };
    match metrics.render() {
        Ok((content_type, body)) => HttpResponse::Ok()
            .insert_header((header::CONTENT_TYPE, content_type))
            .body(body),
        Err(err) => {
            tracing::error!(error = %err, "failed to encode metrics");
            HttpResponse::InternalServerError().body(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_registered_series() {
        let metrics = HubMetrics::new().unwrap();
        metrics.live_connections.set(3);
        metrics.events_dropped.inc();

        let (content_type, body) = metrics.render().unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(content_type.starts_with("text/plain"));
        assert!(text.contains("chat_live_connections 3"));
        assert!(text.contains("chat_events_dropped_total 1"));
    }
}
