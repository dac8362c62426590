use hyper::{Body, Response, StatusCode};
use serde::Serialize;

/// REST error envelope: `{"success":false,"error":{"code","message"}}`.
/// Codes are stable machine strings; messages are for humans and never carry
/// implementation detail.
#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiErrorBody>,
}

pub fn json_response(status: StatusCode, value: &impl Serialize) -> Response<Body> {
    let body = serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .unwrap()
}

/// Success envelope used by endpoints that wrap their payload.
pub fn success_response(data: impl Serialize) -> Response<Body> {
    json_response(
        StatusCode::OK,
        &ApiResponse {
            success: true,
            data: Some(data),
            error: None,
        },
    )
}

pub fn error_response(status: StatusCode, code: &str, message: &str) -> Response<Body> {
    json_response(
        status,
        &ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(ApiErrorBody {
                code: code.to_string(),
                message: message.to_string(),
            }),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    async fn body_json(response: Response<Body>) -> Value {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn error_envelope_shape() {
        let response = error_response(StatusCode::FORBIDDEN, "DEVICE_NOT_ENROLLED", "Device not enrolled");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            response.headers()["Content-Type"],
            "application/json"
        );

        let json = body_json(response).await;
        assert_eq!(json["success"], Value::Bool(false));
        assert_eq!(json["error"]["code"], "DEVICE_NOT_ENROLLED");
        assert_eq!(json["error"]["message"], "Device not enrolled");
        assert!(json.get("data").is_none());
    }

    #[tokio::test]
    async fn success_envelope_shape() {
        let response = success_response(serde_json::json!({"online": 2, "required": 2}));
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["success"], Value::Bool(true));
        assert_eq!(json["data"]["online"], 2);
        assert!(json.get("error").is_none());
    }
}
