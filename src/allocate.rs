//! Call allocation against the external backend.
//!
//! `POST {base}/customer/initiate` hands back the identity triple the whole
//! session runs on. Failures distinguish "the backend never answered" from
//! "the backend answered with an error" because the two lead to different
//! user guidance.

use crate::net::{HttpClient, HttpRequest};
use crate::permissions::Coordinates;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

const ALLOCATE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum AllocateError {
    #[error("no response from allocator: {0}")]
    NoResponse(String),
    #[error("allocator rejected the request: {message}")]
    ErrorResponse {
        status: Option<u16>,
        message: String,
    },
    #[error("malformed allocator response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub user_agent: String,
    pub platform: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateRequest {
    pub customer_name: String,
    pub client_name: String,
    pub mobile_number: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub device_info: DeviceInfo,
}

impl InitiateRequest {
    pub fn with_location(mut self, coords: Coordinates) -> Self {
        self.latitude = Some(coords.latitude);
        self.longitude = Some(coords.longitude);
        self
    }
}

/// The identity triple a successful allocation grants.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionGrant {
    pub vcip_id: String,
    pub connection_id: String,
    pub session_token: String,
}

#[derive(Debug, Deserialize)]
struct InitiateResponse {
    success: bool,
    #[serde(default)]
    data: Option<SessionGrant>,
    #[serde(default)]
    message: Option<String>,
}

pub struct SessionAllocator {
    http: Arc<dyn HttpClient>,
    base_url: String,
}

impl SessionAllocator {
    pub fn new(http: Arc<dyn HttpClient>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub async fn initiate(&self, request: &InitiateRequest) -> Result<SessionGrant, AllocateError> {
        let url = format!("{}/customer/initiate", self.base_url.trim_end_matches('/'));
        let body = serde_json::to_vec(request)
            .map_err(|e| AllocateError::InvalidResponse(e.to_string()))?;

        let response = timeout(
            ALLOCATE_TIMEOUT,
            self.http.execute(HttpRequest::post(&url).with_json_body(body)),
        )
        .await
        .map_err(|_| {
            AllocateError::NoResponse(format!("timed out after {ALLOCATE_TIMEOUT:?}"))
        })?
        .map_err(|e| AllocateError::NoResponse(e.to_string()))?;

        let parsed: InitiateResponse = serde_json::from_slice(&response.body).map_err(|e| {
            if response.is_success() {
                AllocateError::InvalidResponse(e.to_string())
            } else {
                AllocateError::ErrorResponse {
                    status: Some(response.status_code),
                    message: format!("HTTP {}", response.status_code),
                }
            }
        })?;

        if !response.is_success() || !parsed.success {
            let message = parsed
                .message
                .unwrap_or_else(|| format!("HTTP {}", response.status_code));
            warn!(target: "Allocate", "Allocation rejected: {message}");
            return Err(AllocateError::ErrorResponse {
                status: (!response.is_success()).then_some(response.status_code),
                message,
            });
        }

        let grant = parsed.data.ok_or_else(|| {
            AllocateError::InvalidResponse("success response without data".to_string())
        })?;
        info!(
            target: "Allocate",
            "Session allocated: vcip {} connection {}", grant.vcip_id, grant.connection_id
        );
        Ok(grant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::HttpResponse;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct CannedHttp {
        response: StdMutex<Option<anyhow::Result<HttpResponse>>>,
    }

    impl CannedHttp {
        fn ok(body: &str) -> Self {
            Self {
                response: StdMutex::new(Some(Ok(HttpResponse {
                    status_code: 200,
                    body: body.as_bytes().to_vec(),
                }))),
            }
        }

        fn status(code: u16, body: &str) -> Self {
            Self {
                response: StdMutex::new(Some(Ok(HttpResponse {
                    status_code: code,
                    body: body.as_bytes().to_vec(),
                }))),
            }
        }

        fn unreachable() -> Self {
            Self {
                response: StdMutex::new(Some(Err(anyhow::anyhow!("connection refused")))),
            }
        }
    }

    #[async_trait]
    impl HttpClient for CannedHttp {
        async fn execute(&self, _request: HttpRequest) -> anyhow::Result<HttpResponse> {
            self.response
                .lock()
                .unwrap()
                .take()
                .expect("response already consumed")
        }
    }

    fn request() -> InitiateRequest {
        InitiateRequest {
            customer_name: "Mobile User".to_string(),
            client_name: "DigiKhata".to_string(),
            mobile_number: "9999999999".to_string(),
            latitude: None,
            longitude: None,
            device_info: DeviceInfo {
                user_agent: "test".to_string(),
                platform: "test".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_successful_allocation() {
        let http = Arc::new(CannedHttp::ok(
            r#"{"success":true,"data":{"vcipId":"V1","connectionId":"CONN-1","sessionToken":"T1"}}"#,
        ));
        let allocator = SessionAllocator::new(http, "http://backend");
        let grant = allocator.initiate(&request()).await.unwrap();
        assert_eq!(grant.vcip_id, "V1");
        assert_eq!(grant.connection_id, "CONN-1");
        assert_eq!(grant.session_token, "T1");
    }

    #[tokio::test]
    async fn test_error_response_carries_backend_message() {
        let http = Arc::new(CannedHttp::status(
            503,
            r#"{"success":false,"message":"Cannot connect to backend server."}"#,
        ));
        let allocator = SessionAllocator::new(http, "http://backend");
        let err = allocator.initiate(&request()).await.unwrap_err();
        match err {
            AllocateError::ErrorResponse { status, message } => {
                assert_eq!(status, Some(503));
                assert!(message.contains("Cannot connect"));
            }
            other => panic!("expected ErrorResponse, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_logical_failure_on_2xx() {
        let http = Arc::new(CannedHttp::ok(r#"{"success":false,"message":"no agents"}"#));
        let allocator = SessionAllocator::new(http, "http://backend");
        let err = allocator.initiate(&request()).await.unwrap_err();
        assert!(matches!(err, AllocateError::ErrorResponse { status: None, .. }));
    }

    #[tokio::test]
    async fn test_network_failure_is_no_response() {
        let http = Arc::new(CannedHttp::unreachable());
        let allocator = SessionAllocator::new(http, "http://backend");
        let err = allocator.initiate(&request()).await.unwrap_err();
        assert!(matches!(err, AllocateError::NoResponse(_)));
    }

    #[tokio::test]
    async fn test_success_without_data_is_invalid() {
        let http = Arc::new(CannedHttp::ok(r#"{"success":true}"#));
        let allocator = SessionAllocator::new(http, "http://backend");
        let err = allocator.initiate(&request()).await.unwrap_err();
        assert!(matches!(err, AllocateError::InvalidResponse(_)));
    }
}
