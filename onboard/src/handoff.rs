//! Local handoff client
//!
//! After the device has joined the target network it is reachable over plain
//! HTTP on the local network. We POST the owner's identity and it answers
//! with its durable identifier. This client does not wait or poll for the
//! device to appear; the caller only invokes it once the device is believed
//! to have joined.

use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::TokioExecutor;
use onboard_proto::{HandoffBody, HandoffReply};

use crate::{HandoffError, HandoffRequest, HandoffResponse};

#[async_trait::async_trait]
pub trait Handoff: Send + Sync {
    async fn send(
        &self,
        address: &str,
        request: &HandoffRequest,
    ) -> Result<HandoffResponse, HandoffError>;
}

/// [`Handoff`] over HTTP/1.1 with a fixed ceiling on the whole exchange
pub struct HttpHandoff {
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl HttpHandoff {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self { client, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait::async_trait]
impl Handoff for HttpHandoff {
    async fn send(
        &self,
        address: &str,
        request: &HandoffRequest,
    ) -> Result<HandoffResponse, HandoffError> {
        let uri: hyper::Uri = address
            .parse()
            .map_err(|e| HandoffError::Unreachable(format!("invalid address {address}: {e}")))?;

        let body = serde_json::to_vec(&HandoffBody { uid: request.owner_identity.clone() })
            .map_err(|e| HandoffError::Unreachable(format!("failed to encode request: {e}")))?;

        let req = hyper::Request::post(uri)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| HandoffError::Unreachable(format!("failed to build request: {e}")))?;

        let exchange = async {
            let resp = self.client.request(req).await.map_err(|e| e.to_string())?;
            let status = resp.status();
            let bytes = resp.into_body().collect().await.map_err(|e| e.to_string())?.to_bytes();
            Ok::<_, String>((status, bytes))
        };

        let (status, bytes) = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => return Err(HandoffError::Unreachable(e)),
            Err(_) => {
                return Err(HandoffError::Unreachable(format!(
                    "no answer from {address} within {:?}",
                    self.timeout
                )));
            }
        };

        let text = String::from_utf8_lossy(&bytes);
        tracing::debug!(%address, status = status.as_u16(), body = %text, "handoff response");

        if !status.is_success() {
            return Err(HandoffError::Rejected { status: status.as_u16(), body: text.into_owned() });
        }

        parse_reply(&bytes)
    }
}

/// A success body must decode into a non-empty `deviceId`
pub fn parse_reply(bytes: &[u8]) -> Result<HandoffResponse, HandoffError> {
    let reply: HandoffReply = serde_json::from_slice(bytes)
        .map_err(|e| HandoffError::Malformed(format!("not a JSON object: {e}")))?;

    match reply.device_id() {
        Some(id) => Ok(HandoffResponse { device_identifier: id.to_string() }),
        None => Err(HandoffError::Malformed("missing or empty deviceId".to_string())),
    }
}
