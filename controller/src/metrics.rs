//! Prometheus gauges for the heater bridge and the `/metrics` route serving them.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use heater_common::Decision;
use metrics::{describe_gauge, gauge, with_local_recorder};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

pub const CURRENT_TEMPERATURE: &str = "heater_current_temperature_fahrenheit";
pub const DESIRED_TEMPERATURE: &str = "heater_desired_temperature_fahrenheit";
pub const SWITCH_STATE: &str = "heater_switch_state";

const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Owns its own recorder rather than installing a global one, so several
/// instances can coexist in tests.
#[derive(Clone)]
pub struct BridgeMetrics {
    recorder: Arc<PrometheusRecorder>,
    handle: PrometheusHandle,
}

impl BridgeMetrics {
    pub fn new(setpoint_f: f64) -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let metrics = Self {
            recorder: Arc::new(recorder),
            handle,
        };

        metrics.with_recorder(|| {
            describe_gauge!(
                CURRENT_TEMPERATURE,
                "Most recent indoor temperature reading in degrees Fahrenheit"
            );
            describe_gauge!(
                DESIRED_TEMPERATURE,
                "Configured set-point in degrees Fahrenheit"
            );
            describe_gauge!(
                SWITCH_STATE,
                "Last command sent to the heater switch (1 = on, 0 = off)"
            );

            gauge!(CURRENT_TEMPERATURE).set(0.0);
            gauge!(DESIRED_TEMPERATURE).set(setpoint_f);
            gauge!(SWITCH_STATE).set(0.0);
        });

        metrics
    }

    pub fn record(&self, decision: &Decision) {
        self.with_recorder(|| {
            gauge!(CURRENT_TEMPERATURE).set(decision.reading.temperature_f);
            gauge!(DESIRED_TEMPERATURE).set(decision.setpoint_f);
            gauge!(SWITCH_STATE).set(f64::from(decision.command.binary_value()));
        });
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }

    fn with_recorder<T>(&self, f: impl FnOnce() -> T) -> T {
        with_local_recorder(self.recorder.as_ref(), f)
    }
}

pub fn router(metrics: BridgeMetrics) -> Router {
    Router::new()
        .route("/metrics", get(handle_get_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(metrics)
}

pub async fn serve(port: u16, metrics: BridgeMetrics) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics server at {addr}"))?;

    info!("metrics listening on http://{addr}/metrics");
    axum::serve(listener, router(metrics)).await?;
    Ok(())
}

async fn handle_get_metrics(State(metrics): State<BridgeMetrics>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)],
        metrics.render(),
    )
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use heater_common::{Reading, ReadingSource, ThermostatEngine};
    use tower::ServiceExt;

    use super::*;

    fn sample(body: &str, name: &str) -> Option<f64> {
        body.lines()
            .find(|line| line.split_whitespace().next() == Some(name))
            .and_then(|line| line.split_whitespace().last())
            .and_then(|value| value.parse().ok())
    }

    fn decision(temperature_f: f64) -> Decision {
        ThermostatEngine::new(68.0).evaluate(Reading {
            timestamp: "2024-01-05 06:30:00".to_string(),
            temperature_f,
            source: ReadingSource::Mqtt,
        })
    }

    #[test]
    fn gauges_exist_before_first_reading() {
        let metrics = BridgeMetrics::new(68.0);
        let body = metrics.render();

        assert_eq!(sample(&body, DESIRED_TEMPERATURE), Some(68.0));
        assert_eq!(sample(&body, CURRENT_TEMPERATURE), Some(0.0));
        assert_eq!(sample(&body, SWITCH_STATE), Some(0.0));
    }

    #[test]
    fn gauges_track_latest_decision() {
        let metrics = BridgeMetrics::new(68.0);

        metrics.record(&decision(66.5));
        let body = metrics.render();
        assert_eq!(sample(&body, CURRENT_TEMPERATURE), Some(66.5));
        assert_eq!(sample(&body, SWITCH_STATE), Some(1.0));

        metrics.record(&decision(68.0));
        let body = metrics.render();
        assert_eq!(sample(&body, CURRENT_TEMPERATURE), Some(68.0));
        assert_eq!(sample(&body, SWITCH_STATE), Some(0.0));
        assert_eq!(sample(&body, DESIRED_TEMPERATURE), Some(68.0));
    }

    #[tokio::test]
    async fn metrics_route_serves_all_gauges() {
        let metrics = BridgeMetrics::new(70.0);
        metrics.record(&decision(71.0));

        let response = router(metrics)
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            EXPOSITION_CONTENT_TYPE
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        for name in [CURRENT_TEMPERATURE, DESIRED_TEMPERATURE, SWITCH_STATE] {
            assert!(body.contains(name), "missing {name} in {body}");
        }
    }

    #[tokio::test]
    async fn other_paths_are_not_found() {
        let metrics = BridgeMetrics::new(70.0);

        for path in ["/", "/status", "/metrics/extra"] {
            let response = router(metrics.clone())
                .oneshot(Request::get(path).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{path}");
        }
    }
}
