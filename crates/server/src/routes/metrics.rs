//! `GET /metrics`: Prometheus text exposition.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use iavatar_types::JobState;

use crate::metrics::{record_job_gauges, render_metrics};
use crate::state::AppState;

/// Job-table gauges are sampled here rather than on every transition, so a
/// scrape always sees the registry as it is right now.
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    record_job_gauges(
        state.registry.count_in(JobState::Queued),
        state.registry.count_in(JobState::Processing),
        state.scheduler.gate().available(),
    );

    let Some(body) = render_metrics() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "Metrics not initialized").into_response();
    };
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/metrics", get(metrics_handler))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_scrape_reports_job_gauges() {
        crate::metrics::init_metrics();
        let (app, _dir) = crate::test_support::app();

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers().get("content-type").unwrap();
        assert!(content_type.to_str().unwrap().contains("text/plain"));

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains(r#"iavatar_jobs_in_state{state="queued"}"#), "{text}");
        assert!(text.contains(r#"iavatar_jobs_in_state{state="processing"}"#), "{text}");
        assert!(text.contains("iavatar_admission_slots_available"), "{text}");
    }
}
