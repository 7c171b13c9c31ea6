//! Outcome delivery to the Home Assistant hub.

use doorwatch_core::config::HomeAssistantConfig;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// What the hub is told about a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    NoFace { reason: String },
    Known { names: BTreeSet<String> },
    Unknown { video_path: Option<PathBuf> },
    SetText { text: String },
}

impl HubEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            HubEvent::NoFace { .. } => "no_face",
            HubEvent::Known { .. } => "known",
            HubEvent::Unknown { .. } => "unknown",
            HubEvent::SetText { .. } => "set_text",
        }
    }
}

/// Receives cycle outcomes. Never fails: returns whether delivery succeeded.
pub trait NotificationSink: Send + Sync + 'static {
    fn deliver(&self, event: HubEvent) -> impl Future<Output = bool> + Send;
}

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("hub answered {0}")]
    Status(reqwest::StatusCode),
    #[error("hub base URL not configured")]
    NotConfigured,
}

/// One Home Assistant service invocation.
#[derive(Debug, Clone, PartialEq)]
struct ServiceCall {
    service: &'static str,
    body: Value,
}

impl ServiceCall {
    fn turn_on(entity: &str) -> Self {
        Self {
            service: "input_boolean/turn_on",
            body: json!({ "entity_id": entity }),
        }
    }

    fn set_text(entity: &str, value: &str) -> Self {
        Self {
            service: "input_text/set_value",
            body: json!({ "entity_id": entity, "value": value }),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Entities {
    no_face: Option<String>,
    known_face: Option<String>,
    unknown_face: Option<String>,
    label_text: Option<String>,
    video_path: Option<String>,
}

/// REST client for the Home Assistant services API.
pub struct HomeAssistantSink {
    client: reqwest::Client,
    base_url: Option<String>,
    token: Option<String>,
    entities: Entities,
    attempts: u32,
    retry_delay: Duration,
}

impl HomeAssistantSink {
    pub fn from_config(config: &HomeAssistantConfig) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            client,
            base_url: config.base_url.as_ref().map(|u| u.trim_end_matches('/').to_string()),
            token: config.token.clone(),
            entities: Entities {
                no_face: config.no_face_entity.clone(),
                known_face: config.known_face_entity.clone(),
                unknown_face: config.unknown_face_entity.clone(),
                label_text: config.label_text_entity.clone(),
                video_path: config.video_path_entity.clone(),
            },
            attempts: config.attempts.max(1),
            retry_delay: config.retry_delay(),
        })
    }

    fn service_calls(&self, event: &HubEvent) -> Vec<ServiceCall> {
        let e = &self.entities;
        let mut calls = Vec::new();
        let mut push = |call: Option<ServiceCall>, what: &str| match call {
            Some(c) => calls.push(c),
            None => tracing::info!(event = event.kind(), entity = what, "entity not configured, skipping"),
        };

        match event {
            HubEvent::NoFace { reason } => {
                push(e.no_face.as_deref().map(ServiceCall::turn_on), "no_face_entity");
                push(e.label_text.as_deref().map(|t| ServiceCall::set_text(t, reason)), "label_text_entity");
            }
            HubEvent::Known { names } => {
                push(e.known_face.as_deref().map(ServiceCall::turn_on), "known_face_entity");
                if let Some(label) = doorwatch_core::compose_label(names, 0) {
                    push(e.label_text.as_deref().map(|t| ServiceCall::set_text(t, &label)), "label_text_entity");
                }
            }
            HubEvent::Unknown { video_path } => {
                push(e.unknown_face.as_deref().map(ServiceCall::turn_on), "unknown_face_entity");
                if let Some(path) = video_path {
                    let path = path.to_string_lossy();
                    push(
                        e.video_path.as_deref().map(|t| ServiceCall::set_text(t, &path)),
                        "video_path_entity",
                    );
                }
            }
            HubEvent::SetText { text } => {
                push(e.label_text.as_deref().map(|t| ServiceCall::set_text(t, text)), "label_text_entity");
            }
        }
        calls
    }

    async fn post_once(&self, call: &ServiceCall) -> Result<(), DeliveryError> {
        let base = self.base_url.as_deref().ok_or(DeliveryError::NotConfigured)?;
        let mut request = self
            .client
            .post(format!("{base}/api/services/{}", call.service))
            .json(&call.body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Status(response.status()))
        }
    }

    async fn post_with_retry(&self, call: &ServiceCall) -> Result<(), DeliveryError> {
        let mut attempt = 1;
        loop {
            match self.post_once(call).await {
                Ok(()) => return Ok(()),
                Err(DeliveryError::NotConfigured) => return Err(DeliveryError::NotConfigured),
                Err(e) if attempt >= self.attempts => return Err(e),
                Err(e) => {
                    tracing::warn!(service = call.service, attempt, error = %e, "hub call failed, retrying");
                    tokio::time::sleep(self.retry_delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl NotificationSink for HomeAssistantSink {
    async fn deliver(&self, event: HubEvent) -> bool {
        let mut delivered = true;
        for call in self.service_calls(&event) {
            match self.post_with_retry(&call).await {
                Ok(()) => tracing::info!(event = event.kind(), service = call.service, "hub updated"),
                Err(e) => {
                    tracing::error!(event = event.kind(), service = call.service, error = %e, "hub notification failed");
                    delivered = false;
                }
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[derive(Debug, Clone)]
    struct Recorded {
        request_line: String,
        authorization: Option<String>,
        body: Value,
    }

    /// Minimal HTTP server answering with the scripted status codes, then 200.
    async fn stub_hub(statuses: Vec<u16>) -> (String, Arc<Mutex<Vec<Recorded>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();

        tokio::spawn(async move {
            let mut statuses = statuses.into_iter();
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                let header_end = loop {
                    let n = socket.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        break None;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        break Some(pos + 4);
                    }
                };
                let Some(header_end) = header_end else { continue };

                let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
                let header = |name: &str| {
                    head.lines().find_map(|l| {
                        let (k, v) = l.split_once(':')?;
                        k.eq_ignore_ascii_case(name).then(|| v.trim().to_string())
                    })
                };
                let length: usize = header("content-length").and_then(|v| v.parse().ok()).unwrap_or(0);
                while buf.len() < header_end + length {
                    let n = socket.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }

                log.lock().unwrap().push(Recorded {
                    request_line: head.lines().next().unwrap_or_default().to_string(),
                    authorization: header("authorization"),
                    body: serde_json::from_slice(&buf[header_end..]).unwrap_or(Value::Null),
                });

                let status = statuses.next().unwrap_or(200);
                let response = format!("HTTP/1.1 {status} X\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        (base, seen)
    }

    fn config(base: &str) -> HomeAssistantConfig {
        HomeAssistantConfig {
            base_url: Some(format!("{base}/")),
            token: Some("tok".into()),
            no_face_entity: Some("input_boolean.no_face".into()),
            known_face_entity: Some("input_boolean.known_face".into()),
            unknown_face_entity: Some("input_boolean.unknown_face".into()),
            label_text_entity: Some("input_text.door_label".into()),
            video_path_entity: Some("input_text.door_video".into()),
            timeout_secs: 5,
            attempts: 3,
            retry_delay_secs: 0,
        }
    }

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_known_turns_on_entity_and_sets_names() {
        let (base, seen) = stub_hub(vec![]).await;
        let sink = HomeAssistantSink::from_config(&config(&base)).unwrap();

        assert!(sink.deliver(HubEvent::Known { names: names(&["Bob", "Alice"]) }).await);

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].request_line, "POST /api/services/input_boolean/turn_on HTTP/1.1");
        assert_eq!(seen[0].authorization.as_deref(), Some("Bearer tok"));
        assert_eq!(seen[0].body, json!({ "entity_id": "input_boolean.known_face" }));
        assert_eq!(seen[1].request_line, "POST /api/services/input_text/set_value HTTP/1.1");
        assert_eq!(seen[1].body, json!({ "entity_id": "input_text.door_label", "value": "Alice and Bob" }));
    }

    #[tokio::test]
    async fn test_unknown_sends_video_path() {
        let (base, seen) = stub_hub(vec![]).await;
        let sink = HomeAssistantSink::from_config(&config(&base)).unwrap();
        let event = HubEvent::Unknown {
            video_path: Some(PathBuf::from("/data/clips/unknown_latest.mp4")),
        };
        assert!(sink.deliver(event).await);

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(
            seen[1].body,
            json!({ "entity_id": "input_text.door_video", "value": "/data/clips/unknown_latest.mp4" })
        );
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let (base, seen) = stub_hub(vec![500, 503]).await;
        let sink = HomeAssistantSink::from_config(&config(&base)).unwrap();

        assert!(sink.deliver(HubEvent::SetText { text: "Alice".into() }).await);
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_attempts() {
        let (base, seen) = stub_hub(vec![500, 500, 500, 500]).await;
        let sink = HomeAssistantSink::from_config(&config(&base)).unwrap();

        assert!(!sink.deliver(HubEvent::SetText { text: "x".into() }).await);
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_unreachable_hub_reports_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let sink = HomeAssistantSink::from_config(&config(&format!("http://{addr}"))).unwrap();
        assert!(!sink.deliver(HubEvent::NoFace { reason: "no frames captured".into() }).await);
    }

    #[tokio::test]
    async fn test_unset_entities_are_skipped() {
        let (base, seen) = stub_hub(vec![]).await;
        let cfg = HomeAssistantConfig {
            base_url: Some(base),
            ..HomeAssistantConfig::default()
        };
        let sink = HomeAssistantSink::from_config(&cfg).unwrap();

        assert!(sink.deliver(HubEvent::Unknown { video_path: None }).await);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_base_url_fails() {
        let cfg = HomeAssistantConfig {
            no_face_entity: Some("input_boolean.no_face".into()),
            ..HomeAssistantConfig::default()
        };
        let sink = HomeAssistantSink::from_config(&cfg).unwrap();
        assert!(!sink.deliver(HubEvent::NoFace { reason: "x".into() }).await);
    }
}
