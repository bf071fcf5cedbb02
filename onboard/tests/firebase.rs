use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use onboard::{Attributes, FirebaseRegistry, Registry};
use serde_json::{Map, Value};

type Store = Arc<Mutex<HashMap<String, Map<String, Value>>>>;

/// Answers PATCH with the written fields only and GET with the stored
/// object, the way the realtime database REST interface does.
async fn database() -> (String, Store, Arc<Mutex<Vec<String>>>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let store: Store = Arc::default();
    let log = Arc::new(Mutex::new(Vec::new()));

    let (shared, seen) = (store.clone(), log.clone());
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { return };
            let (store, seen) = (shared.clone(), seen.clone());
            tokio::spawn(async move {
                let io = hyper_util::rt::TokioIo::new(stream);
                let service = hyper::service::service_fn(move |r: hyper::Request<hyper::body::Incoming>| {
                    let (store, seen) = (store.clone(), seen.clone());
                    async move {
                        let method = r.method().clone();
                        let path = r.uri().path().trim_end_matches(".json").to_string();
                        let body = r.into_body().collect().await?.to_bytes();
                        seen.lock().unwrap().push(format!("{method} {path}"));

                        let reply = if method == hyper::Method::PATCH {
                            let fields: Map<String, Value> = serde_json::from_slice(&body).unwrap();
                            store.lock().unwrap().entry(path).or_default().extend(fields.clone());
                            Value::Object(fields)
                        } else {
                            store.lock().unwrap().get(&path).cloned().map(Value::Object).unwrap_or(Value::Null)
                        };
                        let resp = hyper::Response::builder()
                            .header("content-type", "application/json")
                            .body(Full::new(Bytes::from(reply.to_string())))
                            .unwrap();
                        Ok::<_, hyper::Error>(resp)
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });

    (format!("http://{addr}"), store, log)
}

fn attributes(pairs: &[(&str, &str)]) -> Attributes {
    pairs.iter().map(|(k, v)| (k.to_string(), Value::from(*v))).collect()
}

#[tokio::test]
async fn register_returns_the_merged_entry() {
    let (url, store, log) = database().await;
    let registry = FirebaseRegistry::new(&url, None);

    registry
        .register("user-1", "esp32-9F3A", attributes(&[("name", "Sensor A"), ("network", "Home")]))
        .await
        .unwrap();
    let second = registry
        .register("user-1", "esp32-9F3A", attributes(&[("network", "Office")]))
        .await
        .unwrap();

    assert_eq!(second.id, "esp32-9F3A");
    assert_eq!(second.attributes.get("name"), Some(&Value::from("Sensor A")));
    assert_eq!(second.attributes.get("network"), Some(&Value::from("Office")));
    assert_eq!(store.lock().unwrap().len(), 1);
    assert_eq!(
        log.lock().unwrap()[2..],
        ["PATCH /users/user-1/devices/esp32-9F3A", "GET /users/user-1/devices/esp32-9F3A"]
    );
}

#[tokio::test]
async fn lookup_of_unknown_device_is_none() {
    let (url, _, _) = database().await;
    let registry = FirebaseRegistry::new(&url, None);
    assert!(registry.lookup("user-1", "esp32-77B0").await.unwrap().is_none());
}
