//! Test doubles for the network and the store.
//!
//! Enabled for this crate's own tests and, through the `testing` feature, for
//! dependent crates' tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{StatusCode, Url};
use shelf_core::{CacheEntry, Error, Generation, RequestKey, ResponseSnapshot, ResponseType, Store};
use tokio::sync::Mutex;

use crate::fetch::{Network, NetworkResponse, ResourceRequest, same_origin};

#[derive(Debug, Clone)]
enum Scripted {
    Respond { status: u16, content_type: &'static str, body: Bytes, response_type: Option<ResponseType> },
    Fail,
}

/// In-memory [`Network`] with canned responses and a request log.
///
/// Unknown URLs answer 404. Paths are resolved against the origin given to
/// [`ScriptedNetwork::new`].
#[derive(Debug)]
pub struct ScriptedNetwork {
    origin: Url,
    routes: HashMap<String, Scripted>,
    offline: AtomicBool,
    log: Mutex<Vec<(String, String)>>,
}

impl ScriptedNetwork {
    pub fn new(origin: &str) -> Self {
        Self {
            origin: Url::parse(origin).expect("valid origin"),
            routes: HashMap::new(),
            offline: AtomicBool::new(false),
            log: Mutex::new(Vec::new()),
        }
    }

    fn absolute(&self, target: &str) -> String {
        self.origin.join(target).expect("valid target").to_string()
    }

    fn script(mut self, target: &str, scripted: Scripted) -> Self {
        let url = self.absolute(target);
        self.routes.insert(url, scripted);
        self
    }

    /// Answer `target` with 200 and the given body.
    pub fn ok(self, target: &str, content_type: &'static str, body: &'static str) -> Self {
        self.script(
            target,
            Scripted::Respond { status: 200, content_type, body: Bytes::from_static(body.as_bytes()), response_type: None },
        )
    }

    /// Answer `target` with an arbitrary status.
    pub fn status(self, target: &str, status: u16, body: &'static str) -> Self {
        self.script(
            target,
            Scripted::Respond {
                status,
                content_type: "text/plain",
                body: Bytes::from_static(body.as_bytes()),
                response_type: None,
            },
        )
    }

    /// Answer `target` with 200 and a forced response type.
    pub fn typed(self, target: &str, response_type: ResponseType) -> Self {
        self.script(
            target,
            Scripted::Respond {
                status: 200,
                content_type: "application/octet-stream",
                body: Bytes::new(),
                response_type: Some(response_type),
            },
        )
    }

    /// Fail every request for `target` with a network error.
    pub fn fail(self, target: &str) -> Self {
        self.script(target, Scripted::Fail)
    }

    /// Start with the network down.
    pub fn offline(self) -> Self {
        self.offline.store(true, Ordering::SeqCst);
        self
    }

    pub fn go_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }

    pub fn go_online(&self) {
        self.offline.store(false, Ordering::SeqCst);
    }

    /// Number of fetches attempted since creation or the last reset.
    pub async fn fetch_count(&self) -> usize {
        self.log.lock().await.len()
    }

    /// Number of fetches attempted for one target.
    pub async fn fetches_of(&self, target: &str) -> usize {
        let url = self.absolute(target);
        self.log.lock().await.iter().filter(|(_, u)| *u == url).count()
    }

    /// `(method, url)` of every fetch attempted, in order.
    pub async fn requests(&self) -> Vec<(String, String)> {
        self.log.lock().await.clone()
    }

    pub async fn reset_count(&self) {
        self.log.lock().await.clear();
    }
}

#[async_trait]
impl Network for ScriptedNetwork {
    async fn fetch(&self, request: &ResourceRequest) -> Result<NetworkResponse, Error> {
        let url = request.url.to_string();
        self.log.lock().await.push((request.method.to_string(), url.clone()));

        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Network(format!("{url}: network unreachable")));
        }

        let (status, content_type, body, response_type) = match self.routes.get(&url) {
            Some(Scripted::Fail) => return Err(Error::Network(format!("{url}: connection reset"))),
            Some(Scripted::Respond { status, content_type, body, response_type }) => {
                (*status, *content_type, body.clone(), *response_type)
            }
            None => (404, "text/plain", Bytes::from_static(b"not found"), None),
        };

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));

        let response_type = response_type.unwrap_or(if same_origin(&request.url, &self.origin) {
            ResponseType::Basic
        } else {
            ResponseType::Cors
        });

        Ok(NetworkResponse {
            url: request.url.clone(),
            status: StatusCode::from_u16(status).expect("valid status"),
            headers,
            body,
            response_type,
            fetch_ms: 1,
        })
    }
}

/// [`Store`] whose every operation fails.
#[derive(Debug)]
pub struct FailingStore {
    generation: Generation,
}

impl FailingStore {
    pub fn new(id: &str) -> Self {
        Self { generation: Generation { id: id.to_string(), created_at: Utc::now() } }
    }
}

#[async_trait]
impl Store for FailingStore {
    fn generation(&self) -> &Generation {
        &self.generation
    }

    async fn get(&self, _key: &RequestKey) -> Result<Option<CacheEntry>, Error> {
        Err(Error::StoreOpen("store unavailable".into()))
    }

    async fn put(&self, _key: RequestKey, _payload: ResponseSnapshot) -> Result<(), Error> {
        Err(Error::StoreOpen("store unavailable".into()))
    }

    async fn delete(&self, _key: &RequestKey) -> Result<bool, Error> {
        Err(Error::StoreOpen("store unavailable".into()))
    }

    async fn keys(&self) -> Result<Vec<RequestKey>, Error> {
        Err(Error::StoreOpen("store unavailable".into()))
    }
}

/// A 200 `text/html` snapshot.
pub fn html_snapshot(body: &'static str) -> ResponseSnapshot {
    ResponseSnapshot {
        status: 200,
        status_text: "OK".into(),
        headers: vec![("content-type".into(), b"text/html".to_vec())],
        body: Bytes::from_static(body.as_bytes()),
        response_type: ResponseType::Basic,
    }
}
