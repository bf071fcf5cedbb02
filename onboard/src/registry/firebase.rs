//! Firebase Realtime Database over its REST interface
//!
//! - register: `PATCH <url>/users/<owner>/devices/<id>.json`, then a `GET`
//!   of the same path so the merged entry is returned
//! - lookup:   `GET   <url>/users/<owner>/devices/<id>.json`
//! - subscribe: `GET <url>/users/<owner>/devices.json` with
//!   `Accept: text/event-stream`; `put`/`patch` events update a local mirror
//!   and every update yields a full snapshot.

use std::pin::Pin;

use futures::{Stream, StreamExt};
use hyper::body::Bytes;
use serde::Deserialize;
use serde_json::Value;

use super::sse::{SseDecoder, SseEvent};
use super::{DeviceStream, Registry, check_key, tree};
use crate::{Attributes, DeviceListSnapshot, RegisteredDevice, RegistryError};

pub struct FirebaseRegistry {
    client: reqwest::Client,
    database_url: String,
    auth_token: Option<String>,
}

impl FirebaseRegistry {
    pub fn new(database_url: &str, auth_token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            database_url: database_url.trim_end_matches('/').to_string(),
            auth_token,
        }
    }

    fn url(&self, path: &str) -> String {
        match &self.auth_token {
            Some(token) => format!("{}/{path}.json?auth={token}", self.database_url),
            None => format!("{}/{path}.json", self.database_url),
        }
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, RegistryError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(RegistryError::Status { status: status.as_u16(), body })
}

fn network(e: reqwest::Error) -> RegistryError {
    // the url carries the auth token
    RegistryError::Network(e.without_url().to_string())
}

#[async_trait::async_trait]
impl Registry for FirebaseRegistry {
    async fn register(
        &self,
        owner: &str,
        device_identifier: &str,
        attributes: Attributes,
    ) -> Result<RegisteredDevice, RegistryError> {
        check_key(owner)?;
        check_key(device_identifier)?;

        let path = onboard_proto::device_path(owner, device_identifier);
        tracing::debug!(%path, "registry write");

        let resp = self.client.patch(self.url(&path)).json(&attributes).send().await.map_err(network)?;
        check_status(resp).await?;

        // PATCH answers with the written fields only; read back the merged entry
        match self.lookup(owner, device_identifier).await? {
            Some(device) => Ok(device),
            None => Err(RegistryError::Decode(format!("{path} missing right after the write"))),
        }
    }

    async fn lookup(
        &self,
        owner: &str,
        device_identifier: &str,
    ) -> Result<Option<RegisteredDevice>, RegistryError> {
        check_key(owner)?;
        check_key(device_identifier)?;

        let path = onboard_proto::device_path(owner, device_identifier);
        let resp = self.client.get(self.url(&path)).send().await.map_err(network)?;
        let value: Value = check_status(resp).await?.json().await.map_err(network)?;

        Ok(match value {
            Value::Null => None,
            v => Some(RegisteredDevice {
                id: device_identifier.to_string(),
                attributes: v.as_object().cloned().unwrap_or_default(),
            }),
        })
    }

    async fn subscribe(&self, owner: &str) -> Result<DeviceStream, RegistryError> {
        check_key(owner)?;

        let path = onboard_proto::devices_path(owner);
        let resp = self
            .client
            .get(self.url(&path))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(network)?;
        let resp = check_status(resp).await?;
        tracing::info!(%path, "registry subscription open");

        let mirror = Mirror {
            owner: owner.to_string(),
            body: resp.bytes_stream().boxed(),
            decoder: SseDecoder::new(),
            tree: Value::Null,
            finished: false,
        };

        Ok(futures::stream::unfold(mirror, |mut m| async move {
            let item = m.next_snapshot().await?;
            Some((item, m))
        })
        .boxed())
    }
}

#[derive(Deserialize)]
struct ChangeEvent {
    path: String,
    data: Value,
}

struct Mirror {
    owner: String,
    body: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    decoder: SseDecoder,
    tree: Value,
    finished: bool,
}

impl Mirror {
    async fn next_snapshot(&mut self) -> Option<Result<DeviceListSnapshot, RegistryError>> {
        loop {
            if self.finished {
                return None;
            }

            while let Some(event) = self.decoder.next_event() {
                match self.apply(event) {
                    Ok(Some(snapshot)) => return Some(Ok(snapshot)),
                    Ok(None) => continue,
                    Err(e) => {
                        self.finished = true;
                        return Some(Err(e));
                    }
                }
            }

            match self.body.next().await {
                Some(Ok(chunk)) => self.decoder.push(&chunk),
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(network(e)));
                }
                None => {
                    self.finished = true;
                    return Some(Err(RegistryError::Closed("server closed the stream".into())));
                }
            }
        }
    }

    fn apply(&mut self, event: SseEvent) -> Result<Option<DeviceListSnapshot>, RegistryError> {
        match event.event.as_str() {
            "put" | "patch" => {
                let change: ChangeEvent = serde_json::from_str(&event.data)
                    .map_err(|e| RegistryError::Decode(e.to_string()))?;
                if event.event == "put" {
                    tree::put(&mut self.tree, &change.path, change.data);
                } else {
                    tree::patch(&mut self.tree, &change.path, change.data);
                }
                Ok(Some(DeviceListSnapshot::from_value(&self.owner, &self.tree)))
            }
            "keep-alive" => Ok(None),
            "cancel" => Err(RegistryError::Closed("subscription cancelled by server".into())),
            "auth_revoked" => Err(RegistryError::Closed("auth token revoked".into())),
            other => {
                tracing::debug!(event = other, "ignoring registry event");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mirror() -> Mirror {
        Mirror {
            owner: "user-1".into(),
            body: futures::stream::empty().boxed(),
            decoder: SseDecoder::new(),
            tree: Value::Null,
            finished: false,
        }
    }

    fn event(kind: &str, data: &str) -> SseEvent {
        SseEvent { event: kind.into(), data: data.into() }
    }

    #[test]
    fn url_carries_auth_token() {
        let r = FirebaseRegistry::new("https://db.example.com/", Some("t0k".into()));
        assert_eq!(
            r.url("users/user-1/devices"),
            "https://db.example.com/users/user-1/devices.json?auth=t0k"
        );
    }

    #[test]
    fn initial_put_then_device_update() {
        let mut m = mirror();
        let first = m
            .apply(event("put", r#"{"path":"/","data":{"esp32-A":{"name":"Kitchen"}}}"#))
            .unwrap()
            .unwrap();
        assert_eq!(first.devices.len(), 1);

        let second = m
            .apply(event("put", r#"{"path":"/esp32-9F3A","data":{"network":"Home"}}"#))
            .unwrap()
            .unwrap();
        let ids: Vec<_> = second.devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["esp32-9F3A", "esp32-A"]);
    }

    #[test]
    fn empty_collection_yields_empty_snapshot() {
        let mut m = mirror();
        let s = m.apply(event("put", r#"{"path":"/","data":null}"#)).unwrap().unwrap();
        assert!(s.devices.is_empty());
    }

    #[test]
    fn keep_alive_is_silent_and_cancel_ends() {
        let mut m = mirror();
        assert!(m.apply(event("keep-alive", "null")).unwrap().is_none());
        assert!(matches!(m.apply(event("cancel", "null")), Err(RegistryError::Closed(_))));
    }

    #[tokio::test]
    async fn stream_end_is_reported_once() {
        let mut m = mirror();
        m.decoder.push(b"event: put\ndata: {\"path\":\"/\",\"data\":{\"esp32-A\":{}}}\n\n");

        let first = m.next_snapshot().await.unwrap().unwrap();
        assert_eq!(first.devices.len(), 1);
        assert!(matches!(m.next_snapshot().await, Some(Err(RegistryError::Closed(_)))));
        assert!(m.next_snapshot().await.is_none());
    }
}
