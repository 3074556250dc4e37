pub mod health;

use axum::{
    routing::{get, post},
    Router,
};

use crate::screening::handlers;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Screening tasks
        .route(
            "/api/v1/screening/tasks",
            post(handlers::handle_create_task).get(handlers::handle_list_tasks),
        )
        .route(
            "/api/v1/screening/tasks/:id",
            get(handlers::handle_get_task).delete(handlers::handle_delete_task),
        )
        .route(
            "/api/v1/screening/tasks/:id/start",
            post(handlers::handle_start_task),
        )
        .route(
            "/api/v1/screening/tasks/:id/cancel",
            post(handlers::handle_cancel_task),
        )
        // Progress and outcomes
        .route(
            "/api/v1/screening/tasks/:id/progress",
            get(handlers::handle_task_progress),
        )
        .route(
            "/api/v1/screening/tasks/:id/resumes",
            get(handlers::handle_resume_progress),
        )
        .route(
            "/api/v1/screening/tasks/:id/resumes/:resume_id/nodes",
            get(handlers::handle_node_status),
        )
        .route(
            "/api/v1/screening/tasks/:id/results",
            get(handlers::handle_list_results),
        )
        .route(
            "/api/v1/screening/tasks/:id/metrics",
            get(handlers::handle_task_metrics),
        )
        .route(
            "/api/v1/screening/results/:id",
            get(handlers::handle_get_result),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::models::profile::{JobProfile, ResumeDetail};
    use crate::screening::audit::AuditRecorder;
    use crate::screening::matching::{BackendConfig, DefaultPipelineFactory, MatchingService};
    use crate::screening::service::ScreeningService;
    use crate::screening::store::{MemoryProfileRepository, MemoryScreeningStore};

    struct TestApp {
        router: Router,
        job_id: Uuid,
        resume_id: Uuid,
    }

    async fn app() -> TestApp {
        let store = Arc::new(MemoryScreeningStore::new());
        let profiles = Arc::new(MemoryProfileRepository::new());
        let (audit, _writer) = AuditRecorder::spawn(store.clone());

        let job_id = Uuid::new_v4();
        let resume_id = Uuid::new_v4();
        profiles
            .insert_job(JobProfile {
                id: job_id,
                title: "Platform Engineer".to_string(),
                required_skills: vec!["Rust".to_string()],
                ..Default::default()
            })
            .await;
        profiles
            .insert_resume(ResumeDetail {
                id: resume_id,
                candidate_name: "Lee".to_string(),
                skills: vec!["Rust".to_string()],
                ..Default::default()
            })
            .await;

        let matcher = Arc::new(MatchingService::new(
            Arc::new(DefaultPipelineFactory::new(None)),
            BackendConfig::Keyword,
            "screener-test",
        ));
        let screening = ScreeningService::new(store, profiles, matcher, audit, 2);

        TestApp {
            router: build_router(AppState { screening }),
            job_id,
            resume_id,
        }
    }

    async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(v) => Body::from(v.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let app = app().await;
        let (status, body) = send(&app.router, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["service"], "screener");
    }

    #[tokio::test]
    async fn test_task_lifecycle_over_http() {
        let app = app().await;

        let (status, body) = send(
            &app.router,
            "POST",
            "/api/v1/screening/tasks",
            Some(json!({
                "job_id": app.job_id,
                "creator": "recruiter@example.com",
                "resume_ids": [app.resume_id],
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"], "pending");
        let task_id = body["task_id"].as_str().unwrap().to_string();

        let (status, _) = send(
            &app.router,
            "POST",
            &format!("/api/v1/screening/tasks/{task_id}/start"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let mut metrics = (StatusCode::NOT_FOUND, Value::Null);
        for _ in 0..200 {
            metrics = send(
                &app.router,
                "GET",
                &format!("/api/v1/screening/tasks/{task_id}/metrics"),
                None,
            )
            .await;
            if metrics.0 == StatusCode::OK {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(metrics.0, StatusCode::OK);
        assert_eq!(metrics.1["succeeded"], 1);

        let (_, task) = send(
            &app.router,
            "GET",
            &format!("/api/v1/screening/tasks/{task_id}"),
            None,
        )
        .await;
        assert_eq!(task["status"], "completed");

        let (_, results) = send(
            &app.router,
            "GET",
            &format!("/api/v1/screening/tasks/{task_id}/results"),
            None,
        )
        .await;
        assert_eq!(results[0]["rank"], 1);

        let (status, _) = send(
            &app.router,
            "DELETE",
            &format!("/api/v1/screening/tasks/{task_id}"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_error_bodies() {
        let app = app().await;

        let (status, body) = send(
            &app.router,
            "POST",
            "/api/v1/screening/tasks",
            Some(json!({ "job_id": app.job_id, "creator": "ana", "resume_ids": [] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

        let (status, body) = send(
            &app.router,
            "GET",
            &format!("/api/v1/screening/tasks/{}", Uuid::new_v4()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");

        let (_, created) = send(
            &app.router,
            "POST",
            "/api/v1/screening/tasks",
            Some(json!({
                "job_id": app.job_id,
                "creator": "ana",
                "resume_ids": [app.resume_id],
            })),
        )
        .await;
        let task_id = created["task_id"].as_str().unwrap();
        let (status, body) = send(
            &app.router,
            "POST",
            &format!("/api/v1/screening/tasks/{task_id}/cancel"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "INVALID_STATE");
    }
}
