//! Privileged calls made by the broker on a worker's behalf.
//!
//! The broker never hands a secret to a worker. It maps `(service,
//! operation, target, params)` onto a configured HTTP request, attaches the
//! freshly fetched secret itself and returns only the upstream status and
//! body.
//!
//! Error classification:
//! - connect failures, transport timeouts, `429` and `5xx` are transient
//!   [`CredentialError::UpstreamError`]s and may be retried
//! - every other response (including `3xx` and `4xx`) is returned as a
//!   [`ForwardedResult`] carrying its status
//!
//! Redirects are never followed: a custom auth header would be replayed to
//! whatever host the `Location` names.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{
    Method,
    header::{HeaderMap, HeaderName, HeaderValue},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use zeroize::Zeroizing;

use crate::{
    config::{ServiceConfig, TARGET_PLACEHOLDER},
    error::{CredentialError, Result},
    secrets::Secret,
};

/// Maximum upstream response body accepted (10 MiB).
pub const MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

/// Connect timeout for upstream HTTP connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upstream response relayed to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardedResult {
    /// Upstream status code.
    pub status: u16,
    /// Parsed JSON body, or the raw body as a string.
    pub body: Value,
}

/// What the broker is asked to do upstream.
#[derive(Debug, Clone, Copy)]
pub struct UpstreamCall<'a> {
    /// Configured service name.
    pub service: &'a str,
    /// Operation name within the service.
    pub operation: &'a str,
    /// Operation target, substituted into the path.
    pub target: &'a str,
    /// Query parameters (GET/DELETE) or JSON body (other methods).
    pub params: Option<&'a Value>,
}

/// Performs privileged calls.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Checks that the call names a known service and operation and has
    /// well-formed arguments. Runs before policy, budget and approval.
    ///
    /// # Errors
    ///
    /// - [`CredentialError::UnknownService`] for an unconfigured service
    /// - [`CredentialError::InvalidRequest`] for an unknown operation or a bad target
    fn validate(&self, call: &UpstreamCall<'_>) -> Result<()>;

    /// Per-operation timeout overriding the broker default.
    fn timeout_for(&self, _call: &UpstreamCall<'_>) -> Option<Duration> {
        None
    }

    /// Performs one attempt of the call with `secret`.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::UpstreamError`] on transport failure or a
    /// retryable status.
    async fn call(&self, call: &UpstreamCall<'_>, secret: &Secret) -> Result<ForwardedResult>;
}

#[async_trait]
impl<U: Upstream + ?Sized> Upstream for Arc<U> {
    fn validate(&self, call: &UpstreamCall<'_>) -> Result<()> {
        (**self).validate(call)
    }

    fn timeout_for(&self, call: &UpstreamCall<'_>) -> Option<Duration> {
        (**self).timeout_for(call)
    }

    async fn call(&self, call: &UpstreamCall<'_>, secret: &Secret) -> Result<ForwardedResult> {
        (**self).call(call, secret).await
    }
}

#[derive(Debug)]
struct Operation {
    method: Method,
    path: String,
    timeout: Option<Duration>,
}

impl Operation {
    fn uses_target(&self) -> bool {
        self.path.contains(TARGET_PLACEHOLDER)
    }

    fn sends_query(&self) -> bool {
        self.method == Method::GET || self.method == Method::DELETE
    }
}

#[derive(Debug)]
struct HttpService {
    base_url: String,
    auth_header: HeaderName,
    auth_scheme: Option<String>,
    headers: HeaderMap,
    operations: BTreeMap<String, Operation>,
}

/// [`Upstream`] backed by `reqwest`, configured from
/// [`BrokerConfig::services`](crate::config::BrokerConfig::services).
#[derive(Debug)]
pub struct HttpUpstream {
    client: reqwest::Client,
    services: BTreeMap<String, HttpService>,
}

impl HttpUpstream {
    /// Builds the HTTP client and the per-service request templates.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::InvalidConfig`] for invalid methods or
    /// header names/values, and [`CredentialError::Internal`] if the HTTP
    /// client cannot be built.
    pub fn new(services: &BTreeMap<String, ServiceConfig>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("sentra-broker/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CredentialError::internal(format!("building HTTP client: {e}")))?;

        let services = services
            .iter()
            .map(|(name, service)| Ok((name.clone(), HttpService::from_config(name, service)?)))
            .collect::<Result<_>>()?;
        Ok(Self { client, services })
    }

    fn lookup(&self, call: &UpstreamCall<'_>) -> Result<(&HttpService, &Operation)> {
        let service = self
            .services
            .get(call.service)
            .ok_or_else(|| CredentialError::UnknownService(call.service.to_owned()))?;
        let operation = service.operations.get(call.operation).ok_or_else(|| {
            CredentialError::invalid_request(format!("unsupported operation {}", call.operation))
        })?;
        Ok((service, operation))
    }
}

impl HttpService {
    fn from_config(name: &str, config: &ServiceConfig) -> Result<Self> {
        let invalid = |what: String| CredentialError::invalid_config(format!("service {name}: {what}"));

        let auth_header = HeaderName::from_bytes(config.auth_header.as_bytes())
            .map_err(|e| invalid(format!("auth_header: {e}")))?;

        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            let key = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| invalid(format!("header {key}: {e}")))?;
            let value =
                HeaderValue::from_str(value).map_err(|e| invalid(format!("header {key}: {e}")))?;
            headers.insert(key, value);
        }

        let mut operations = BTreeMap::new();
        for (op_name, op) in &config.operations {
            let method = Method::from_bytes(op.method.as_bytes())
                .map_err(|e| invalid(format!("operation {op_name}: {e}")))?;
            operations.insert(
                op_name.clone(),
                Operation { method, path: op.path.clone(), timeout: op.timeout },
            );
        }

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            auth_header,
            auth_scheme: config.auth_scheme.clone(),
            headers,
            operations,
        })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    fn validate(&self, call: &UpstreamCall<'_>) -> Result<()> {
        let (_, operation) = self.lookup(call)?;
        if operation.uses_target() {
            validate_target(call.target)?;
        }
        match call.params {
            None | Some(Value::Null) => Ok(()),
            Some(Value::Object(map)) if operation.sends_query() => {
                if map.values().any(|v| v.is_object() || v.is_array()) {
                    Err(CredentialError::invalid_request("query params must be scalar values"))
                } else {
                    Ok(())
                }
            },
            Some(_) if operation.sends_query() => {
                Err(CredentialError::invalid_request("query params must be an object"))
            },
            Some(_) => Ok(()),
        }
    }

    fn timeout_for(&self, call: &UpstreamCall<'_>) -> Option<Duration> {
        self.lookup(call).ok().and_then(|(_, op)| op.timeout)
    }

    #[tracing::instrument(skip(self, call, secret), fields(service = call.service, operation = call.operation))]
    async fn call(&self, call: &UpstreamCall<'_>, secret: &Secret) -> Result<ForwardedResult> {
        let (service, operation) = self.lookup(call)?;
        let url = format!(
            "{}{}",
            service.base_url,
            operation.path.replace(TARGET_PLACEHOLDER, call.target)
        );

        let credential = Zeroizing::new(match &service.auth_scheme {
            Some(scheme) => format!("{scheme} {}", secret.expose()),
            None => secret.expose().to_owned(),
        });
        let mut auth_value = HeaderValue::from_str(&credential).map_err(|_| {
            CredentialError::secret_unavailable(call.service, "secret is not a valid header value")
        })?;
        auth_value.set_sensitive(true);

        let mut request = self
            .client
            .request(operation.method.clone(), &url)
            .headers(service.headers.clone())
            .header(service.auth_header.clone(), auth_value);

        match call.params {
            Some(Value::Object(map)) if operation.sends_query() => {
                let pairs: Vec<(&str, String)> = map
                    .iter()
                    .map(|(k, v)| match v {
                        Value::String(s) => (k.as_str(), s.clone()),
                        other => (k.as_str(), other.to_string()),
                    })
                    .collect();
                request = request.query(&pairs);
            },
            Some(body) if !operation.sends_query() && !body.is_null() => {
                request = request.json(body);
            },
            _ => {},
        }

        let mut response = request.send().await.map_err(classify_transport_error)?;
        let status = response.status();

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(classify_transport_error)? {
            if body.len() + chunk.len() > MAX_RESPONSE_BYTES {
                return Err(CredentialError::upstream_permanent("response body exceeds size limit"));
            }
            body.extend_from_slice(&chunk);
        }

        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(CredentialError::upstream_transient(format!(
                "{} {} returned {status}",
                call.service, call.operation
            )));
        }

        tracing::debug!(status = status.as_u16(), bytes = body.len(), "upstream call finished");
        Ok(ForwardedResult { status: status.as_u16(), body: parse_body(&body) })
    }
}

/// Accepts `[A-Za-z0-9._/-]+` without `..` or a leading `/`.
fn validate_target(target: &str) -> Result<()> {
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-');
    if target.is_empty() {
        return Err(CredentialError::invalid_request("target must not be empty"));
    }
    if !target.chars().all(allowed) || target.contains("..") || target.starts_with('/') {
        return Err(CredentialError::invalid_request("target contains disallowed characters"));
    }
    Ok(())
}

fn parse_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

fn classify_transport_error(err: reqwest::Error) -> CredentialError {
    let err = err.without_url();
    if err.is_connect() || err.is_timeout() {
        CredentialError::upstream_transient(err.to_string())
    } else {
        CredentialError::upstream_permanent(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use rstest::rstest;
    use serde_json::json;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        task::JoinHandle,
    };

    use super::*;
    use crate::config::BrokerConfig;

    /// Serves one canned HTTP response and returns the raw request.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        serve_once_with(status, String::new(), body).await
    }

    /// Like [`serve_once`], adding `extra_headers` (each ending in `\r\n`).
    async fn serve_once_with(
        status: &'static str,
        extra_headers: String,
        body: &'static str,
    ) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = stream.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf);
                if let Some(end) = text.find("\r\n\r\n") {
                    let content_length = text[..end]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length").then(|| v.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if buf.len() >= end + 4 + content_length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\n{extra_headers}content-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.ok();
            String::from_utf8_lossy(&buf).into_owned()
        });
        (format!("http://{addr}"), handle)
    }

    fn upstream_for(base_url: &str) -> HttpUpstream {
        let yaml = format!(
            r"
services:
  github:
    base_url: {base_url}
    secret:
      env: GITHUB_TOKEN
    headers:
      accept: application/vnd.github+json
    operations:
      read:
        method: GET
        path: /repos/{{target}}/pulls
      create_pr:
        method: POST
        path: /repos/{{target}}/pulls
  anthropic:
    base_url: {base_url}
    secret:
      env: ANTHROPIC_API_KEY
    auth_header: x-api-key
    auth_scheme: null
    operations:
      api_call:
        method: POST
        path: /v1/messages
"
        );
        let config = BrokerConfig::from_yaml(&yaml).unwrap();
        config.validate().unwrap();
        HttpUpstream::new(&config.services).unwrap()
    }

    fn call<'a>(
        service: &'a str,
        operation: &'a str,
        target: &'a str,
        params: Option<&'a Value>,
    ) -> UpstreamCall<'a> {
        UpstreamCall { service, operation, target, params }
    }

    #[tokio::test]
    async fn test_get_sends_secret_and_query() {
        let (base, server) = serve_once("200 OK", r#"[{"number":1}]"#).await;
        let upstream = upstream_for(&base);
        let params = json!({"state": "open", "per_page": 5});
        let secret = Secret::new("ghp_testtoken");

        let result = upstream
            .call(&call("github", "read", "acme/widgets", Some(&params)), &secret)
            .await
            .unwrap();
        assert_eq!(result.status, 200);
        assert_eq!(result.body, json!([{"number": 1}]));

        let request = server.await.unwrap().to_ascii_lowercase();
        assert!(request.starts_with("get /repos/acme/widgets/pulls?"), "{request}");
        assert!(request.contains("state=open"));
        assert!(request.contains("per_page=5"));
        assert!(request.contains("authorization: bearer ghp_testtoken"));
        assert!(request.contains("accept: application/vnd.github+json"));
    }

    #[tokio::test]
    async fn test_post_sends_json_body_with_bare_key() {
        let (base, server) = serve_once("200 OK", r#"{"id":"msg_1"}"#).await;
        let upstream = upstream_for(&base);
        let params = json!({"model": "m", "max_tokens": 10});
        let secret = Secret::new("sk-ant-abc");

        let result =
            upstream.call(&call("anthropic", "api_call", "", Some(&params)), &secret).await.unwrap();
        assert_eq!(result.body["id"], "msg_1");

        let request = server.await.unwrap();
        let lower = request.to_ascii_lowercase();
        assert!(lower.starts_with("post /v1/messages "));
        assert!(lower.contains("x-api-key: sk-ant-abc"));
        assert!(!lower.contains("authorization:"));
        assert!(request.contains(r#""max_tokens":10"#));
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let (base, _server) = serve_once("503 Service Unavailable", "{}").await;
        let upstream = upstream_for(&base);
        let err = upstream
            .call(&call("github", "read", "acme/widgets", None), &Secret::new("ghp_x"))
            .await
            .unwrap_err();
        assert!(err.is_transient(), "{err:?}");
    }

    #[tokio::test]
    async fn test_client_error_is_forwarded() {
        let (base, _server) = serve_once("404 Not Found", r#"{"message":"Not Found"}"#).await;
        let upstream = upstream_for(&base);
        let result = upstream
            .call(&call("github", "read", "acme/missing", None), &Secret::new("ghp_x"))
            .await
            .unwrap();
        assert_eq!(result.status, 404);
        assert_eq!(result.body["message"], "Not Found");
    }

    #[tokio::test]
    async fn test_redirect_is_forwarded_not_followed() {
        let elsewhere = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let location = format!("location: http://{}/steal\r\n", elsewhere.local_addr().unwrap());
        let (base, server) = serve_once_with("302 Found", location, r#"{"moved":true}"#).await;
        let upstream = upstream_for(&base);

        let result = upstream
            .call(&call("anthropic", "api_call", "", None), &Secret::new("sk-ant-abc"))
            .await
            .unwrap();
        assert_eq!(result.status, 302);
        assert_eq!(result.body["moved"], true);
        server.await.unwrap();

        let followed =
            tokio::time::timeout(std::time::Duration::from_millis(200), elsewhere.accept()).await;
        assert!(followed.is_err(), "redirect target was contacted");
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let upstream = upstream_for(&format!("http://{addr}"));
        let err = upstream
            .call(&call("github", "read", "acme/widgets", None), &Secret::new("ghp_x"))
            .await
            .unwrap_err();
        assert!(err.is_transient(), "{err:?}");
    }

    #[rstest]
    #[case("gitlab", "read", "a/b", "unknown_service")]
    #[case("github", "delete_repo", "a/b", "invalid_request")]
    #[case("github", "read", "../etc/passwd", "invalid_request")]
    #[case("github", "read", "/abs", "invalid_request")]
    #[case("github", "read", "acme/w?x=1", "invalid_request")]
    #[case("github", "read", "", "invalid_request")]
    fn test_validate_rejects(
        #[case] service: &str,
        #[case] operation: &str,
        #[case] target: &str,
        #[case] code: &str,
    ) {
        let upstream = upstream_for("http://127.0.0.1:9");
        let err = upstream.validate(&call(service, operation, target, None)).unwrap_err();
        assert_eq!(err.code(), code);
    }

    #[test]
    fn test_validate_params_shape() {
        let upstream = upstream_for("http://127.0.0.1:9");
        let nested = json!({"filter": {"a": 1}});
        assert!(upstream.validate(&call("github", "read", "a/b", Some(&nested))).is_err());
        let list = json!([1, 2]);
        assert!(upstream.validate(&call("github", "read", "a/b", Some(&list))).is_err());
        assert!(upstream.validate(&call("github", "create_pr", "a/b", Some(&nested))).is_ok());
        assert!(upstream.validate(&call("anthropic", "api_call", "", None)).is_ok());
    }

    #[test]
    fn test_parse_body_falls_back_to_text() {
        assert_eq!(parse_body(b""), Value::Null);
        assert_eq!(parse_body(b"plain text"), json!("plain text"));
        assert_eq!(parse_body(br#"{"a":1}"#), json!({"a": 1}));
    }
}
