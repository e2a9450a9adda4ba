use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    api::ApiState,
    controller::{CreateVmRequest, registry::VmSummary},
    error::VmError,
};

#[derive(Debug, Deserialize)]
pub struct DeleteVmRequest {
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct DeleteVmResponse {
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct ListVmsResponse {
    pub vms: Vec<VmSummary>,
}

pub fn router() -> Router<Arc<ApiState>> {
    Router::new()
        .route("/create", post(create_vm))
        .route("/delete", post(delete_vm))
        .route("/vms", get(list_vms))
}

async fn create_vm(
    State(state): State<Arc<ApiState>>,
    request: Result<Json<CreateVmRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match request {
        Ok(request) => request,
        Err(rejection) => return VmError::from(rejection).into_response(),
    };

    info!("create requested for image {}", request.root_image_path);

    match state.controller.create(request).await {
        Ok(created) => (StatusCode::OK, Json(created)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn delete_vm(
    State(state): State<Arc<ApiState>>,
    request: Result<Json<DeleteVmRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match request {
        Ok(request) => request,
        Err(rejection) => return VmError::from(rejection).into_response(),
    };

    match state.controller.delete(&request.id).await {
        Ok(()) => (StatusCode::OK, Json(DeleteVmResponse { id: request.id })).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn list_vms(State(state): State<Arc<ApiState>>) -> Response {
    let vms = state.controller.list();
    (StatusCode::OK, Json(ListVmsResponse { vms })).into_response()
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Method, Request, header::CONTENT_TYPE},
    };
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::{api::app, controller::tests::TestEnv};

    async fn call(env: &TestEnv, method: Method, uri: &str, body: &str) -> (StatusCode, Value) {
        let app = app(Arc::new(ApiState {
            controller: env.controller.clone(),
        }));

        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);

        (status, body)
    }

    fn create_body(env: &TestEnv) -> String {
        json!({
            "root_image_path": env.request().root_image_path,
            "kernel_path": "/boot/vmlinux",
            "hostname": "guest-1",
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_create_list_delete() {
        let env = TestEnv::new().await;

        let (status, body) = call(&env, Method::POST, "/create", &create_body(&env)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ip_address"], "172.17.0.4");
        assert!(body.get("metadata_error").is_none());

        let id = body["id"].as_str().unwrap().to_string();
        assert_eq!(id.len(), 36);

        let (status, body) = call(&env, Method::GET, "/vms", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["vms"][0]["id"], id.as_str());
        assert_eq!(body["vms"][0]["tap_name"], "fc-tap-4");
        assert_eq!(body["vms"][0]["state"], "running");

        let delete = json!({ "id": id }).to_string();
        let (status, body) = call(&env, Method::POST, "/delete", &delete).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "id": id }));

        let (status, body) = call(&env, Method::POST, "/delete", &delete).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn test_malformed_json_is_bad_request() {
        let env = TestEnv::new().await;

        let (status, body) = call(&env, Method::POST, "/create", "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation_error");

        let (status, _) = call(&env, Method::POST, "/create", r#"{"kernel_path": "/k"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&env, Method::POST, "/delete", "{}").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        assert!(env.controller.registry().is_empty());
    }

    #[tokio::test]
    async fn test_empty_path_is_rejected() {
        let env = TestEnv::new().await;

        let body = json!({ "root_image_path": "", "kernel_path": "/boot/vmlinux" }).to_string();
        let (status, body) = call(&env, Method::POST, "/create", &body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation_error");
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let env = TestEnv::with_ordinals(4, 4).await;

        let (status, _) = call(&env, Method::POST, "/create", &create_body(&env)).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&env, Method::POST, "/create", &create_body(&env)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "resource_exhausted");

        let missing = json!({
            "root_image_path": env.dir.path().join("missing.img"),
            "kernel_path": "/boot/vmlinux",
        })
        .to_string();
        env.controller.stop_all_forced().await;

        let (status, body) = call(&env, Method::POST, "/create", &missing).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "provisioning_error");
    }

    #[tokio::test]
    async fn test_metadata_error_is_reported() {
        let env = TestEnv::new().await;
        env.hypervisor
            .fail_metadata
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let (status, body) = call(&env, Method::POST, "/create", &create_body(&env)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["metadata_error"].is_string());
        assert_eq!(env.controller.registry().len(), 1);
    }
}
