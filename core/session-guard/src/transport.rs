//! Transport seam and the response interceptor that feeds the session gate.
//!
//! The HTTP client is a black box behind [`Transport`]. [`GuardedTransport`]
//! wraps it: successful responses reset the gate's failure count, 401-class
//! failures are reported to the gate and still returned to the caller, and
//! everything else passes through untouched.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::coordinator::SessionCoordinator;
use crate::error::{OperationError, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: u16,
    #[serde(default)]
    pub body: Value,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError>;
}

pub struct GuardedTransport<T> {
    inner: Arc<T>,
    coordinator: SessionCoordinator,
}

impl<T> Clone for GuardedTransport<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            coordinator: self.coordinator.clone(),
        }
    }
}

impl<T: Transport + 'static> GuardedTransport<T> {
    pub fn new(inner: T, coordinator: SessionCoordinator) -> Self {
        Self {
            inner: Arc::new(inner),
            coordinator,
        }
    }

    pub fn coordinator(&self) -> &SessionCoordinator {
        &self.coordinator
    }

    /// Sends a mutating request under the coordinator's per-key lock.
    pub async fn send_exclusive(
        &self,
        key: &str,
        request: ApiRequest,
    ) -> Result<ApiResponse, OperationError> {
        let transport = self.clone();
        self.coordinator
            .execute_exclusive(key, move || {
                let transport = transport.clone();
                let request = request.clone();
                async move { transport.send(request).await }
            })
            .await
    }
}

#[async_trait]
impl<T: Transport + 'static> Transport for GuardedTransport<T> {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let path = request.path.clone();
        match self.inner.send(request).await {
            Ok(response) => {
                self.coordinator.on_success();
                Ok(response)
            }
            Err(err) if err.is_auth() => {
                let decision = self.coordinator.on_auth_failure().await;
                debug!(path = %path, ?decision, "Authentication failure routed to gate");
                Err(err)
            }
            Err(err) => Err(err),
        }
    }
}
