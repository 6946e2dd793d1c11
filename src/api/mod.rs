#[cfg(feature = "swagger")]
pub mod openapi;
pub mod command;
pub mod error;
pub mod health;
pub mod response;
pub mod v1;

use axum::{routing::get, Router};
use tower_http::{compression::CompressionLayer, cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

use crate::app_state::AppState;
use crate::config::Config;

pub fn router(state: AppState, cfg: &Config) -> Router {
    let mut app = Router::new()
        .route("/health", get(health::health_check))
        .route("/health/ready", get(health::readiness_check))
        .route("/health/live", get(health::liveness_check))
        .nest("/api/v1", v1::router(state.clone()))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(std::time::Duration::from_secs(cfg.server.request_timeout_secs)));

    if cfg.server.enable_cors {
        app = app.layer(CorsLayer::permissive());
    }
    if cfg.server.enable_compression {
        app = app.layer(CompressionLayer::new());
    }
    app
}

#[cfg(feature = "swagger")]
pub fn with_swagger(app: Router) -> Router {
    use crate::api::openapi::ApiDoc;
    use utoipa::OpenApi;
    use utoipa_swagger_ui::SwaggerUi;
    app.merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
}

#[cfg(feature = "metrics")]
pub fn with_metrics(app: Router) -> Router {
    use axum_prometheus::PrometheusMetricLayer;
    let (layer, handle) = PrometheusMetricLayer::pair();
    app.layer(layer).route("/metrics", axum::routing::get(move || async move { handle.render() }))
}
