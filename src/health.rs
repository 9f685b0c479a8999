use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.metrics.snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "model": {
            "name": state.model.name(),
            "timeout_ms": config.streaming.model_timeout_ms
        },
        "metrics": metrics,
        "streaming": {
            "failure_rate": if metrics.chunks_received > 0 {
                metrics.chunks_failed as f64 / metrics.chunks_received as f64
            } else {
                0.0
            },
            "job_queue_capacity": config.streaming.job_queue_capacity,
            "outbound_capacity": config.streaming.outbound_capacity,
            "max_frame_bytes": config.streaming.max_frame_bytes
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::DspModel;
    use crate::config::AppConfig;
    use actix_web::{test, App};
    use std::sync::Arc;

    #[actix_web::test]
    async fn test_health_reports_model_and_counters() {
        let state = AppState::new(AppConfig::default(), Arc::new(DspModel::new()));
        state.metrics.connection_opened();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["model"]["name"], "dsp");
        assert_eq!(body["metrics"]["active_connections"], 1);
        assert_eq!(body["streaming"]["failure_rate"], 0.0);
    }
}
