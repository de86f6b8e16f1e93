use std::collections::BTreeMap;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::StreamExt;
use reqwest::{Client, Url};
use tracing::debug;

use relay_core::config::{AppConfig, HttpConfig};
use relay_core::error::{RelayError, Result};
use relay_core::security::UrlPolicy;
use relay_core::traits::Adapter;
use relay_core::types::{Output, RequestConfig, Response, STREAM_BODY};

use crate::guard::UrlGuard;

/// Adapter that issues calls over HTTP(S) with a shared `reqwest` client.
///
/// Recognised config extras: `query` (object of query parameters) and
/// `stream` (return the body as a byte stream instead of reading it).
pub struct HttpAdapter {
    http: Client,
    guard: UrlGuard,
    default_headers: BTreeMap<String, String>,
}

impl HttpAdapter {
    pub fn new(config: &HttpConfig, policy: UrlPolicy) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| RelayError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self {
            http,
            guard: UrlGuard::new(policy),
            default_headers: config.default_headers.clone(),
        })
    }

    pub fn from_app_config(config: &AppConfig) -> Result<Self> {
        Self::new(&config.http, config.security.clone())
    }

    pub fn guard(&self) -> &UrlGuard {
        &self.guard
    }

    async fn send(&self, config: &RequestConfig) -> Result<Response> {
        let mut url = self.guard.check(&config.target)?;
        apply_query(&mut url, config.extra.get("query"));

        let method = reqwest::Method::from_bytes(config.verb.as_str().to_uppercase().as_bytes())
            .map_err(|e| RelayError::Config(format!("Invalid method: {}", e)))?;
        debug!(method = %config.verb, url = %url, "Sending request");

        let mut req = self.http.request(method, url);
        for (k, v) in self.default_headers.iter().chain(config.headers.iter()) {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Some(payload) = &config.payload {
            req = req.json(payload);
        }

        let resp = req.send().await.map_err(map_reqwest_error)?;
        let status = resp.status();
        let headers: BTreeMap<String, String> = resp
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("?").to_string()))
            .collect();

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let body = serde_json::from_str(&body).unwrap_or(serde_json::Value::String(body));
            return Err(RelayError::Transport {
                message: format!(
                    "HTTP {} {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("")
                ),
                status: Some(status.as_u16()),
                details: Some(serde_json::json!({
                    "status": status.as_u16(),
                    "body": body,
                })),
            });
        }

        let mut response = if config.extra_flag(STREAM_BODY) {
            let stream = resp.bytes_stream().map(|r| r.map_err(map_stream_error));
            Response::streaming(Box::pin(stream))
        } else {
            let content_type = headers.get("content-type").map(String::as_str);
            let body = resp.bytes().await.map_err(map_reqwest_error)?;
            Response::complete(decode_body(content_type, &body))
        };
        response.status = Some(status.as_u16());
        response.headers = headers;
        Ok(response)
    }
}

impl Adapter for HttpAdapter {
    fn name(&self) -> &str {
        "http"
    }

    fn execute_request<'a>(&'a self, config: &'a RequestConfig) -> BoxFuture<'a, Result<Response>> {
        Box::pin(self.send(config))
    }
}

fn apply_query(url: &mut Url, query: Option<&serde_json::Value>) {
    let Some(serde_json::Value::Object(params)) = query else {
        return;
    };
    let mut pairs = url.query_pairs_mut();
    for (k, v) in params {
        match v {
            serde_json::Value::String(s) => pairs.append_pair(k, s),
            serde_json::Value::Null => continue,
            other => pairs.append_pair(k, &other.to_string()),
        };
    }
}

/// JSON content types parse to `Output::Json`; everything else is text.
fn decode_body(content_type: Option<&str>, body: &[u8]) -> Output {
    let is_json = content_type.is_some_and(|ct| ct.contains("json"));
    if is_json {
        if let Ok(value) = serde_json::from_slice(body) {
            return Output::Json(value);
        }
    }
    Output::Text(String::from_utf8_lossy(body).into_owned())
}

fn map_reqwest_error(e: reqwest::Error) -> RelayError {
    if e.is_timeout() {
        RelayError::Timeout(e.to_string())
    } else if e.is_connect() || e.is_request() || e.is_body() {
        RelayError::Network(e.to_string())
    } else {
        RelayError::transport(e.to_string())
    }
}

/// Failures after the body started streaming are not retried by default.
fn map_stream_error(e: reqwest::Error) -> RelayError {
    if e.is_timeout() {
        RelayError::Timeout(e.to_string())
    } else {
        RelayError::Stream(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::error::UrlViolation;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn local_adapter() -> HttpAdapter {
        let policy = UrlPolicy {
            allow_localhost: true,
            ..UrlPolicy::default()
        };
        HttpAdapter::new(&HttpConfig::default(), policy).unwrap()
    }

    /// Serve one canned HTTP response on an ephemeral port.
    async fn serve_once(status_line: &'static str, content_type: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = sock.read(&mut buf).await;
            let reply = format!(
                "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status_line,
                content_type,
                body.len(),
                body
            );
            sock.write_all(reply.as_bytes()).await.unwrap();
            sock.shutdown().await.ok();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn guard_runs_before_network() {
        let adapter = HttpAdapter::new(&HttpConfig::default(), UrlPolicy::default()).unwrap();
        let err = adapter
            .execute_request(&RequestConfig::get("http://localhost:1/never"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::UrlPolicy(UrlViolation::LocalhostBlocked(_))));
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn json_body_is_parsed() {
        let base = serve_once("200 OK", "application/json", r#"{"id":1,"name":"A"}"#).await;
        let adapter = local_adapter();
        let config = RequestConfig::get(format!("{}/items/1", base));
        let response = adapter.execute_request(&config).await.unwrap();
        assert_eq!(response.status, Some(200));
        let out = adapter.get_result(response).await.unwrap();
        assert_eq!(out, Output::Json(serde_json::json!({"id": 1, "name": "A"})));
    }

    #[tokio::test]
    async fn error_status_becomes_transport_error() {
        let base = serve_once("503 Service Unavailable", "text/plain", "down").await;
        let err = local_adapter()
            .execute_request(&RequestConfig::get(base))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(503));
        assert!(!err.is_network_class());
    }

    #[tokio::test]
    async fn stream_flag_returns_byte_stream() {
        let base = serve_once("200 OK", "text/plain", "chunked body").await;
        let adapter = local_adapter();
        let config = RequestConfig::get(base).with_extra("stream", serde_json::Value::Bool(true));
        let response = adapter.execute_request(&config).await.unwrap();
        assert!(response.is_stream());
        let out = adapter.get_result(response).await.unwrap();
        assert_eq!(out, Output::Bytes("chunked body".into()));
    }

    #[test]
    fn query_params_are_appended() {
        let mut url = Url::parse("https://api.test/search?q=a").unwrap();
        let query = serde_json::json!({"page": 2, "tag": "x y", "skip": null});
        apply_query(&mut url, Some(&query));
        assert_eq!(url.as_str(), "https://api.test/search?q=a&page=2&tag=x+y");
    }

    #[test]
    fn non_json_body_is_text() {
        assert_eq!(decode_body(Some("text/html"), b"<p>"), Output::Text("<p>".into()));
        assert_eq!(
            decode_body(Some("application/json; charset=utf-8"), b"[1]"),
            Output::Json(serde_json::json!([1]))
        );
        assert_eq!(decode_body(Some("application/json"), b"nope"), Output::Text("nope".into()));
    }
}
