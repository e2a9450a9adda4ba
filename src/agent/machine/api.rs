use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{
    Method, Request, StatusCode,
    header::{ACCEPT, CONTENT_TYPE, HOST},
};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct FaultResponse {
    fault_message: String,
}

/// HTTP/1.1 client for a hypervisor control socket. Calls abort once the VM's lifecycle scope
/// is cancelled.
#[derive(Debug, Clone)]
pub struct ApiClient {
    socket_path: PathBuf,
    token: CancellationToken,
}

impl ApiClient {
    pub fn new(socket_path: impl AsRef<Path>, token: CancellationToken) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            token,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub async fn is_ready(&self) -> bool {
        UnixStream::connect(&self.socket_path).await.is_ok()
    }

    pub async fn put<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<()> {
        let body = serde_json::to_vec(body)?;

        tokio::select! {
            biased;
            _ = self.token.cancelled() => bail!("request {} cancelled", path),
            result = self.send(Method::PUT, path, Bytes::from(body)) => result,
        }
    }

    async fn send(&self, method: Method, path: &str, body: Bytes) -> Result<()> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| format!("failed to connect to {}", self.socket_path.display()))?;

        let (mut sender, connection) =
            hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;

        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("control socket connection closed: {}", e);
            }
        });

        let request = Request::builder()
            .method(method.clone())
            .uri(path)
            .header(HOST, "localhost")
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(body))?;

        let response = sender.send_request(request).await;
        drop(sender);
        let response = response?;

        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();
        connection_task.abort();

        debug!("{} {} -> {}", method, path, status);

        if status.is_success() {
            return Ok(());
        }

        bail!("{} {} returned {}: {}", method, path, status, fault_message(status, &body));
    }
}

fn fault_message(status: StatusCode, body: &[u8]) -> String {
    match serde_json::from_slice::<FaultResponse>(body) {
        Ok(fault) => fault.fault_message,
        Err(_) if body.is_empty() => status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_string(),
        Err(_) => String::from_utf8_lossy(body).to_string(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        convert::Infallible,
        sync::{Arc, Mutex},
    };

    use hyper::{Response, body::Incoming, server::conn::http1, service::service_fn};
    use serde_json::{Value, json};
    use tokio::{net::UnixListener, task::JoinHandle};

    use super::*;

    pub type RecordedRequests = Arc<Mutex<Vec<(String, String, Value)>>>;

    /// Minimal stand-in for a hypervisor control socket. Records every request and answers
    /// 204, or 400 with a fault message for paths listed in `reject`.
    pub fn spawn_fake_api(
        socket_path: &Path,
        reject: Vec<String>,
    ) -> (RecordedRequests, JoinHandle<()>) {
        let listener = UnixListener::bind(socket_path).unwrap();
        let recorded: RecordedRequests = Arc::new(Mutex::new(Vec::new()));
        let reject = Arc::new(reject);

        let requests = recorded.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };

                let requests = requests.clone();
                let reject = reject.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let requests = requests.clone();
                        let reject = reject.clone();
                        async move {
                            let method = req.method().to_string();
                            let path = req.uri().path().to_string();
                            let body = req.into_body().collect().await.unwrap().to_bytes();
                            let body = serde_json::from_slice(&body).unwrap_or(Value::Null);
                            requests.lock().unwrap().push((method, path.clone(), body));

                            let response = if reject.contains(&path) {
                                Response::builder()
                                    .status(StatusCode::BAD_REQUEST)
                                    .body(Full::new(Bytes::from(
                                        json!({ "fault_message": "rejected" }).to_string(),
                                    )))
                                    .unwrap()
                            } else {
                                Response::builder()
                                    .status(StatusCode::NO_CONTENT)
                                    .body(Full::new(Bytes::new()))
                                    .unwrap()
                            };

                            Ok::<_, Infallible>(response)
                        }
                    });

                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        (recorded, task)
    }

    #[tokio::test]
    async fn test_put_sends_json() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("api.sock");
        let (requests, server) = spawn_fake_api(&socket, vec![]);

        let client = ApiClient::new(&socket, CancellationToken::new());
        assert!(client.is_ready().await);

        client
            .put("/machine-config", &json!({ "vcpu_count": 1 }))
            .await
            .unwrap();

        let requests = requests.lock().unwrap().clone();
        assert_eq!(
            requests,
            vec![(
                "PUT".to_string(),
                "/machine-config".to_string(),
                json!({ "vcpu_count": 1 })
            )]
        );

        server.abort();
    }

    #[tokio::test]
    async fn test_put_surfaces_fault_message() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("api.sock");
        let (_, server) = spawn_fake_api(&socket, vec!["/boot-source".to_string()]);

        let client = ApiClient::new(&socket, CancellationToken::new());
        let err = client
            .put("/boot-source", &json!({}))
            .await
            .unwrap_err()
            .to_string();

        assert!(err.contains("400"), "{err}");
        assert!(err.contains("rejected"), "{err}");

        server.abort();
    }

    #[tokio::test]
    async fn test_put_to_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let client = ApiClient::new(dir.path().join("missing.sock"), CancellationToken::new());

        assert!(!client.is_ready().await);
        assert!(client.put("/mmds", &json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_cancelled_client_refuses_requests() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("api.sock");
        let (_, server) = spawn_fake_api(&socket, vec![]);

        let token = CancellationToken::new();
        token.cancel();
        let client = ApiClient::new(&socket, token);

        let err = client.put("/mmds", &json!({})).await.unwrap_err();
        assert!(err.to_string().contains("cancelled"));

        server.abort();
    }
}
