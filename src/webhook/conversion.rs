//! ConversionReview handler

use axum::Json;
use kube::core::conversion::{ConversionRequest, ConversionResponse, ConversionReview};
use kube::core::response::Status;
use tracing::{debug, error, warn};

use crate::conversion::convert_object;

/// Handle a ConversionReview from the API server
pub async fn convert_handler(Json(review): Json<ConversionReview>) -> Json<ConversionReview> {
    let request = match ConversionRequest::from_review(review) {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "Failed to parse conversion review");
            return Json(
                ConversionResponse::invalid(Status::failure(&e.to_string(), "InvalidRequest"))
                    .into_review(),
            );
        }
    };

    Json(convert_request(request).into_review())
}

/// Convert every object of a request to the desired version
///
/// The whole request fails if any object cannot be converted; the API
/// server requires a response entry for every object.
pub fn convert_request(request: ConversionRequest) -> ConversionResponse {
    let desired = request.desired_api_version.clone();
    let mut converted = Vec::with_capacity(request.objects.len());

    for object in &request.objects {
        match convert_object(object.clone(), &desired) {
            Ok(value) => converted.push(value),
            Err(e) => {
                warn!(
                    uid = %request.uid,
                    desired = %desired,
                    error = %e,
                    "Conversion failed"
                );
                return ConversionResponse::for_request(request)
                    .failure(Status::failure(&e.to_string(), "ConversionFailed"));
            }
        }
    }

    debug!(uid = %request.uid, desired = %desired, count = converted.len(), "Converted objects");
    ConversionResponse::for_request(request).success(converted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{v1beta1, v1beta3};
    use crate::webhook::webhook_router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn review(desired: &str, objects: Vec<Value>) -> Value {
        json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "ConversionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "desiredAPIVersion": desired,
                "objects": objects
            }
        })
    }

    fn v1beta1_machine() -> Value {
        json!({
            "apiVersion": v1beta1::API_VERSION,
            "kind": "CloudStackMachine",
            "metadata": {"name": "cp-0", "namespace": "default"},
            "spec": {
                "offering": {"name": "Large"},
                "template": {"name": "ubuntu"},
                "zoneName": "zone1"
            }
        })
    }

    async fn post_review(body: Value) -> Value {
        let request = Request::builder()
            .method("POST")
            .uri("/convert")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();

        let response = webhook_router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    // ==========================================================================
    // Integration Tests: HTTP Handler
    // ==========================================================================

    /// The API server asks for a stored v1beta1 machine at the hub version
    #[tokio::test]
    async fn integration_converts_machine_to_hub() {
        let out = post_review(review(v1beta3::API_VERSION, vec![v1beta1_machine()])).await;

        let response = &out["response"];
        assert_eq!(response["uid"], "705ab4f5-6393-11e8-b7cc-42010a800002");
        assert_eq!(response["result"]["status"], "Success");
        let converted = response["convertedObjects"].as_array().unwrap();
        assert_eq!(converted.len(), 1);
        assert_eq!(converted[0]["apiVersion"], v1beta3::API_VERSION);
        assert_eq!(converted[0]["spec"]["offering"]["name"], "Large");
        assert!(converted[0]["spec"].get("zoneName").is_none());
    }

    /// One unconvertible object fails the whole review
    #[tokio::test]
    async fn integration_unknown_kind_fails_review() {
        let unknown = json!({
            "apiVersion": v1beta1::API_VERSION,
            "kind": "CloudStackZone",
            "metadata": {"name": "z"}
        });
        let out = post_review(review(
            v1beta3::API_VERSION,
            vec![v1beta1_machine(), unknown],
        ))
        .await;

        let response = &out["response"];
        assert_eq!(response["result"]["status"], "Failure");
        assert!(response["result"]["message"]
            .as_str()
            .unwrap()
            .contains("CloudStackZone"));
    }

    #[tokio::test]
    async fn integration_healthz() {
        let request = Request::builder()
            .uri("/healthz")
            .body(Body::empty())
            .unwrap();
        let response = webhook_router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
