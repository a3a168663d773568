//! REST client for a remote compute-sandbox provider.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    ComputeProvider, ExecOutput, ExecRequest, RemoteSandbox, SandboxSpec, VolumeRef,
    STREAM_CAPTURE_BYTES,
};
use crate::error::ProviderError;

/// Timeout for control-plane calls (volumes, create, terminate, tunnels).
const API_TIMEOUT: Duration = Duration::from_secs(90);

/// Added on top of a command's own timeout for the HTTP round trip.
const EXEC_SLACK: Duration = Duration::from_secs(10);

const ERROR_BODY_LIMIT: usize = 64 * 1024;

/// Largest control-plane response body accepted.
const API_BODY_LIMIT: usize = 4 * 1024 * 1024;

/// Largest exec response body accepted: both streams at capture size with
/// room for JSON escaping.
pub const EXEC_BODY_LIMIT: usize = 8 * STREAM_CAPTURE_BYTES;

#[derive(Serialize)]
struct CreateSandboxBody<'a> {
    image: &'a str,
    volume_id: &'a str,
    mount_path: &'a str,
    cpu: f64,
    memory_mb: u64,
    timeout_secs: u64,
    encrypted_ports: &'a [u16],
    labels: HashMap<&'static str, &'a str>,
}

#[derive(Deserialize)]
struct SandboxResponse {
    #[serde(alias = "id")]
    sandbox_id: String,
}

#[derive(Serialize)]
struct ExecBody<'a> {
    command: &'a [String],
    timeout_secs: u64,
}

#[derive(Deserialize)]
struct ExecResponse {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    exit_code: Option<i32>,
}

#[derive(Deserialize)]
struct TunnelsResponse {
    #[serde(default)]
    tunnels: HashMap<String, String>,
}

#[derive(Clone)]
struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    fn request(&self, method: Method, path: &str, timeout: Duration) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let builder = self.http.request(method, url).timeout(timeout);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Send a request and decode a JSON body. A 404 becomes `Gone` when the
    /// call targets an existing sandbox.
    async fn send<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        sandbox_id: Option<&str>,
    ) -> Result<T, ProviderError> {
        self.send_limited(builder, sandbox_id, API_BODY_LIMIT).await
    }

    /// Like [`ApiClient::send`], refusing bodies larger than `limit` bytes
    /// without buffering them.
    async fn send_limited<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        sandbox_id: Option<&str>,
        limit: usize,
    ) -> Result<T, ProviderError> {
        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            if let Some(id) = sandbox_id {
                return Err(ProviderError::Gone(id.to_string()));
            }
        }
        if !status.is_success() {
            let message = error_message(response).await;
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }
        let body = read_body(response, limit).await?;
        serde_json::from_slice(&body).map_err(|e| ProviderError::Decode(e.to_string()))
    }

    async fn send_empty(
        &self,
        builder: RequestBuilder,
        sandbox_id: &str,
    ) -> Result<(), ProviderError> {
        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ProviderError::Gone(sandbox_id.to_string()));
        }
        if !status.is_success() {
            let message = error_message(response).await;
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }
}

async fn read_body(mut response: reqwest::Response, limit: usize) -> Result<Vec<u8>, ProviderError> {
    let too_large = || ProviderError::Decode(format!("response body exceeds {} bytes", limit));
    if response.content_length().is_some_and(|len| len > limit as u64) {
        return Err(too_large());
    }
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(transport_error)? {
        if body.len() + chunk.len() > limit {
            return Err(too_large());
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

/// Error body text; empty when unreadable or over [`ERROR_BODY_LIMIT`].
async fn error_message(response: reqwest::Response) -> String {
    read_body(response, ERROR_BODY_LIMIT)
        .await
        .map(|body| String::from_utf8_lossy(&body).into_owned())
        .unwrap_or_default()
}

fn transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Transport(err.to_string())
    }
}

/// Provider speaking the `/v1/volumes` and `/v1/sandboxes` REST API.
pub struct HttpProvider {
    api: ApiClient,
    workspace_root: String,
}

impl HttpProvider {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        workspace_root: String,
    ) -> Result<Self, ProviderError> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ProviderError::Transport(format!(
                "provider url must be http(s): {}",
                base_url
            )));
        }
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(Self {
            api: ApiClient {
                http,
                base_url,
                token: token.filter(|t| !t.trim().is_empty()),
            },
            workspace_root,
        })
    }

    fn sandbox(&self, id: String) -> Arc<dyn RemoteSandbox> {
        Arc::new(HttpSandbox {
            id,
            workspace_root: self.workspace_root.clone(),
            api: self.api.clone(),
        })
    }
}

#[async_trait]
impl ComputeProvider for HttpProvider {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn ensure_volume(&self, name: &str) -> Result<VolumeRef, ProviderError> {
        let builder = self
            .api
            .request(Method::PUT, &format!("/v1/volumes/{}", name), API_TIMEOUT);
        self.api.send(builder, None).await
    }

    async fn create_sandbox(
        &self,
        spec: &SandboxSpec,
    ) -> Result<Arc<dyn RemoteSandbox>, ProviderError> {
        let mut labels = HashMap::new();
        labels.insert("session_id", spec.session_id.as_str());
        let body = CreateSandboxBody {
            image: &spec.image,
            volume_id: &spec.volume.id,
            mount_path: &spec.mount_path,
            cpu: spec.cpu,
            memory_mb: spec.memory_mb,
            timeout_secs: spec.timeout_secs,
            encrypted_ports: &spec.ports,
            labels,
        };
        let builder = self
            .api
            .request(Method::POST, "/v1/sandboxes", API_TIMEOUT)
            .json(&body);
        let created: SandboxResponse = self.api.send(builder, None).await?;
        debug!(sandbox_id = %created.sandbox_id, image = %spec.image, "provider created sandbox");
        Ok(self.sandbox(created.sandbox_id))
    }

    async fn connect(&self, sandbox_id: &str) -> Result<Arc<dyn RemoteSandbox>, ProviderError> {
        let builder = self.api.request(
            Method::GET,
            &format!("/v1/sandboxes/{}", sandbox_id),
            API_TIMEOUT,
        );
        let found: SandboxResponse = self.api.send(builder, Some(sandbox_id)).await?;
        Ok(self.sandbox(found.sandbox_id))
    }

    async fn terminate(&self, sandbox_id: &str) -> Result<(), ProviderError> {
        let builder = self.api.request(
            Method::DELETE,
            &format!("/v1/sandboxes/{}", sandbox_id),
            API_TIMEOUT,
        );
        self.api.send_empty(builder, sandbox_id).await
    }
}

#[derive(Clone)]
struct HttpSandbox {
    id: String,
    workspace_root: String,
    api: ApiClient,
}

impl std::fmt::Debug for HttpSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSandbox").field("id", &self.id).finish()
    }
}

#[async_trait]
impl RemoteSandbox for HttpSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn workspace_root(&self) -> &str {
        &self.workspace_root
    }

    async fn exec(&self, request: &ExecRequest) -> Result<ExecOutput, ProviderError> {
        let body = ExecBody {
            command: &request.argv,
            timeout_secs: request.timeout.as_secs().max(1),
        };
        let builder = self
            .api
            .request(
                Method::POST,
                &format!("/v1/sandboxes/{}/exec", self.id),
                request.timeout + EXEC_SLACK,
            )
            .json(&body);
        let response: ExecResponse = self
            .api
            .send_limited(builder, Some(&self.id), EXEC_BODY_LIMIT)
            .await?;
        Ok(ExecOutput {
            stdout: response.stdout,
            stderr: response.stderr,
            exit_code: response.exit_code,
        })
    }

    async fn terminate(&self) -> Result<(), ProviderError> {
        let builder = self.api.request(
            Method::DELETE,
            &format!("/v1/sandboxes/{}", self.id),
            API_TIMEOUT,
        );
        self.api.send_empty(builder, &self.id).await
    }

    async fn tunnel_url(&self, port: u16) -> Result<Option<String>, ProviderError> {
        let builder = self.api.request(
            Method::GET,
            &format!("/v1/sandboxes/{}/tunnels", self.id),
            API_TIMEOUT,
        );
        let response: TunnelsResponse = self.api.send(builder, Some(&self.id)).await?;
        Ok(response.tunnels.get(&port.to_string()).cloned())
    }
}
