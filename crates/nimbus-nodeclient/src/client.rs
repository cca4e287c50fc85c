//! HTTP implementation of the node agent client.
//!
//! Plain hyper h1 connections, one per call. Agents sit on the node's
//! own address; connection reuse buys little and a stuck pooled
//! connection would outlive the instance it belonged to.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{NodeClientError, NodeClientResult};
use crate::types::{InstanceHealthReport, StartInstanceRequest, StartOutcome, StopInstanceRequest};
use crate::NodeAgentApi;

/// Default port node agents listen on.
pub const DEFAULT_AGENT_PORT: u16 = 8081;

/// Node agent client over HTTP/1.
#[derive(Debug, Clone)]
pub struct HttpNodeClient {
    timeout: Duration,
    agent_port: u16,
}

impl HttpNodeClient {
    /// Create a client with the given per-call deadline.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            agent_port: DEFAULT_AGENT_PORT,
        }
    }

    /// Override the agent port (for tests against local listeners).
    pub fn with_port(mut self, port: u16) -> Self {
        self.agent_port = port;
        self
    }

    /// One HTTP exchange against a node agent, bounded by the deadline.
    async fn exchange(
        &self,
        node_ip: &str,
        method: &str,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> NodeClientResult<(u16, Bytes)> {
        let addr = authority(node_ip, self.agent_port);
        let uri = format!("http://{addr}{path}");

        let result = tokio::time::timeout(self.timeout, async {
            let stream = TcpStream::connect(&addr).await.map_err(|e| {
                NodeClientError::Unreachable {
                    addr: addr.clone(),
                    reason: e.to_string(),
                }
            })?;

            let io = TokioIo::new(stream);
            let (mut sender, conn) =
                hyper::client::conn::http1::handshake(io)
                    .await
                    .map_err(|e| NodeClientError::Unreachable {
                        addr: addr.clone(),
                        reason: e.to_string(),
                    })?;

            // Drive the connection in the background.
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let mut builder = http::Request::builder()
                .method(method)
                .uri(&uri)
                .header("host", addr.as_str())
                .header("user-agent", "nimbus-operator/0.1");
            if body.is_some() {
                builder = builder.header("content-type", "application/json");
            }
            let req = builder
                .body(Full::new(Bytes::from(body.unwrap_or_default())))
                .map_err(|e| NodeClientError::Serialize(e.to_string()))?;

            let resp = sender.send_request(req).await.map_err(|e| {
                NodeClientError::Unreachable {
                    addr: addr.clone(),
                    reason: e.to_string(),
                }
            })?;

            let status = resp.status().as_u16();
            let body = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| NodeClientError::Deserialize(e.to_string()))?
                .to_bytes();
            Ok((status, body))
        })
        .await;

        match result {
            Ok(inner) => {
                if let Ok((status, _)) = &inner {
                    debug!(%uri, method, status, "node agent call");
                }
                inner
            }
            Err(_) => Err(NodeClientError::Timeout(self.timeout)),
        }
    }
}

impl NodeAgentApi for HttpNodeClient {
    fn start_instance(
        &self,
        node_ip: &str,
        req: &StartInstanceRequest,
    ) -> impl Future<Output = NodeClientResult<StartOutcome>> + Send {
        let client = self.clone();
        let node_ip = node_ip.to_string();
        let req = req.clone();
        async move {
            let body =
                serde_json::to_vec(&req).map_err(|e| NodeClientError::Serialize(e.to_string()))?;
            let (status, resp_body) = client
                .exchange(&node_ip, "POST", "/api/v1/instances", Some(body))
                .await?;
            classify_start(status, &resp_body)
        }
    }

    fn stop_instance(
        &self,
        node_ip: &str,
        instance_id: &str,
        grace_period_sec: u64,
    ) -> impl Future<Output = NodeClientResult<()>> + Send {
        let client = self.clone();
        let node_ip = node_ip.to_string();
        let path = format!("/api/v1/instances/{instance_id}");
        async move {
            let body = serde_json::to_vec(&StopInstanceRequest { grace_period_sec })
                .map_err(|e| NodeClientError::Serialize(e.to_string()))?;
            let (status, resp_body) = client
                .exchange(&node_ip, "DELETE", &path, Some(body))
                .await?;
            if (200..300).contains(&status) {
                Ok(())
            } else {
                Err(NodeClientError::Agent {
                    status,
                    body: String::from_utf8_lossy(&resp_body).into_owned(),
                })
            }
        }
    }

    fn instance_health(
        &self,
        node_ip: &str,
        instance_id: &str,
    ) -> impl Future<Output = NodeClientResult<InstanceHealthReport>> + Send {
        let client = self.clone();
        let node_ip = node_ip.to_string();
        let path = format!("/api/v1/instances/{instance_id}/health");
        async move {
            let (status, body) = client.exchange(&node_ip, "GET", &path, None).await?;
            if !(200..300).contains(&status) {
                return Err(NodeClientError::Agent {
                    status,
                    body: String::from_utf8_lossy(&body).into_owned(),
                });
            }
            serde_json::from_slice(&body).map_err(|e| NodeClientError::Deserialize(e.to_string()))
        }
    }

    fn node_health(&self, node_ip: &str) -> impl Future<Output = NodeClientResult<()>> + Send {
        let client = self.clone();
        let node_ip = node_ip.to_string();
        async move {
            let (status, body) = client.exchange(&node_ip, "GET", "/health", None).await?;
            if (200..300).contains(&status) {
                Ok(())
            } else {
                Err(NodeClientError::Agent {
                    status,
                    body: String::from_utf8_lossy(&body).into_owned(),
                })
            }
        }
    }
}

/// Map the agent's create-or-match status codes onto [`StartOutcome`].
fn classify_start(status: u16, body: &[u8]) -> NodeClientResult<StartOutcome> {
    match status {
        201 => Ok(StartOutcome::Created),
        200 => Ok(StartOutcome::AlreadyRunning),
        409 => Err(NodeClientError::Conflict(
            String::from_utf8_lossy(body).into_owned(),
        )),
        _ => Err(NodeClientError::Agent {
            status,
            body: String::from_utf8_lossy(body).into_owned(),
        }),
    }
}

/// Bracket IPv6 addresses for use in a host:port authority.
fn authority(node_ip: &str, port: u16) -> String {
    if node_ip.contains(':') {
        format!("[{node_ip}]:{port}")
    } else {
        format!("{node_ip}:{port}")
    }
}
