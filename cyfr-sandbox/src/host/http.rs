//! Policy-checked outbound HTTP host functions.
//!
//! All guest HTTP goes through here - native WASI HTTP is never linked -
//! so the policy checks, DNS screening, size caps, base64 body handling,
//! and multipart building live in exactly one code path.
//!
//! # Request pipeline
//!
//! 1. Parse the request JSON (`invalid_json`)
//! 2. Require `method` and `url` (`invalid_request`)
//! 3. Policy: method (`method_blocked`), then host (`domain_blocked`)
//! 4. Decode the body and enforce `max_request_size` (`request_too_large`)
//! 5. Resolve the hostname and screen every address
//!    (`private_ip_blocked`, `dns_error`)
//! 6. Consume one rate token from the bucket shared with the executor's
//!    pre-flight path (`rate_limited`)
//! 7. Issue the upstream request with the policy timeout as deadline
//! 8. Stream the response, halting at `max_response_size`
//!    (`response_too_large`)
//! 9. Return `{status, headers, body, body_encoding?}`; binary content
//!    round-trips as base64, and granted-secret substrings are redacted
//!    before the payload reaches the guest
//!
//! The streaming variant shares steps 1-7 and registers the response in
//! the per-execution [`StreamRegistry`](crate::host::stream::StreamRegistry)
//! instead of buffering it.

// Layer 1: Standard library imports
use std::collections::HashMap;
use std::sync::Arc;

// Layer 2: Third-party crate imports
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::multipart::{Form, Part};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

// Layer 3: Internal module imports
use crate::core::error::{SandboxError, SandboxResult};
use crate::core::policy::Policy;
use crate::core::reference::ComponentReference;
use crate::host::stream::StreamRegistry;
use crate::security::enforcer::PolicyEnforcer;
use crate::security::masking::SecretMasker;
use crate::security::netguard;
use crate::security::rate_limit::RateLimiter;

/// Wire shape of one guest HTTP request.
#[derive(Debug, Deserialize)]
struct HttpRequestSpec {
    method: Option<String>,
    url: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    body: Option<String>,
    body_encoding: Option<String>,
    multipart: Option<Vec<MultipartPartSpec>>,
}

/// One multipart entry: either a text field (`value`) or a file part
/// (`filename`, `content_type`, base64 `data`).
#[derive(Debug, Deserialize)]
struct MultipartPartSpec {
    name: String,
    value: Option<String>,
    filename: Option<String>,
    content_type: Option<String>,
    data: Option<String>,
}

enum RequestBody {
    Empty,
    Bytes(Vec<u8>),
    Multipart(Vec<PreparedPart>),
}

struct PreparedPart {
    name: String,
    content: PartContent,
}

enum PartContent {
    Text(String),
    File {
        filename: String,
        content_type: String,
        bytes: Vec<u8>,
    },
}

struct PreparedRequest {
    method: Method,
    url: Url,
    headers: HashMap<String, String>,
    body: RequestBody,
}

/// Host-side HTTP executor for one execution.
///
/// Closes over the execution's policy snapshot, identity, masker, and the
/// process-wide rate limiter. Instances are cheap; one is built per
/// execution by the capability installer.
pub struct HttpHandler {
    policy: Policy,
    execution_id: String,
    user_id: String,
    reference: ComponentReference,
    masker: Arc<SecretMasker>,
    rate: Arc<RateLimiter>,
    client: reqwest::Client,
    allow_reserved_addresses: bool,
}

impl HttpHandler {
    /// Create a handler bound to one execution's context.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        policy: Policy,
        execution_id: String,
        user_id: String,
        reference: ComponentReference,
        masker: Arc<SecretMasker>,
        rate: Arc<RateLimiter>,
        allow_reserved_addresses: bool,
    ) -> Self {
        Self {
            policy,
            execution_id,
            user_id,
            reference,
            masker,
            rate,
            client: reqwest::Client::new(),
            allow_reserved_addresses,
        }
    }

    /// Unary `request` host function body: JSON in, JSON out, errors as
    /// envelopes. Never panics the executor.
    pub async fn handle(&self, request_json: String) -> String {
        match self.execute(&request_json).await {
            Ok(response) => response.to_string(),
            Err(err) => self.envelope(&err),
        }
    }

    /// Streaming `request` host function body: registers the response and
    /// returns `{"handle": n}`.
    pub async fn handle_stream_open(
        &self,
        registry: &StreamRegistry,
        request_json: String,
    ) -> String {
        match self.open_stream(registry, &request_json).await {
            Ok(handle) => json!({"handle": handle}).to_string(),
            Err(err) => self.envelope(&err),
        }
    }

    async fn execute(&self, request_json: &str) -> SandboxResult<Value> {
        let prepared = self.prepare(request_json)?;
        let response = self.send(prepared).await?;
        self.buffer_response(response).await
    }

    async fn open_stream(
        &self,
        registry: &StreamRegistry,
        request_json: &str,
    ) -> SandboxResult<u64> {
        let prepared = self.prepare(request_json)?;
        let response = self.send(prepared).await?;
        registry
            .open(response, self.policy.max_response_size)
            .await
    }

    /// Steps 1-4 of the pipeline: parse, validate, policy-check, size-check.
    fn prepare(&self, request_json: &str) -> SandboxResult<PreparedRequest> {
        let spec: HttpRequestSpec = serde_json::from_str(request_json)
            .map_err(|e| SandboxError::invalid_json(e.to_string()))?;

        let method_name = spec
            .method
            .ok_or_else(|| SandboxError::invalid_request("missing required field 'method'"))?;
        let raw_url = spec
            .url
            .ok_or_else(|| SandboxError::invalid_request("missing required field 'url'"))?;

        PolicyEnforcer::check_method(&self.policy, &method_name)?;

        let url = Url::parse(&raw_url)
            .map_err(|e| SandboxError::invalid_request(format!("invalid url '{raw_url}': {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SandboxError::invalid_request(format!(
                "unsupported url scheme '{}'",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| SandboxError::invalid_request("url has no host"))?
            .to_owned();

        PolicyEnforcer::check_domain(&self.policy, &host)?;

        let method = Method::from_bytes(method_name.to_ascii_uppercase().as_bytes())
            .map_err(|_| SandboxError::invalid_request(format!("invalid method '{method_name}'")))?;

        if spec.body.is_some() && spec.multipart.is_some() {
            return Err(SandboxError::invalid_request(
                "exactly one of 'body' and 'multipart' may be present",
            ));
        }

        let body = if let Some(parts) = spec.multipart {
            RequestBody::Multipart(self.prepare_multipart(parts)?)
        } else if let Some(raw) = spec.body {
            let bytes = if spec.body_encoding.as_deref() == Some("base64") {
                STANDARD.decode(raw.as_bytes()).map_err(|e| {
                    SandboxError::invalid_request(format!("body is not valid base64: {e}"))
                })?
            } else {
                raw.into_bytes()
            };
            if bytes.len() > self.policy.max_request_size {
                return Err(SandboxError::request_too_large(
                    "Request body",
                    bytes.len(),
                    self.policy.max_request_size,
                ));
            }
            RequestBody::Bytes(bytes)
        } else {
            RequestBody::Empty
        };

        Ok(PreparedRequest {
            method,
            url,
            headers: spec.headers,
            body,
        })
    }

    fn prepare_multipart(
        &self,
        parts: Vec<MultipartPartSpec>,
    ) -> SandboxResult<Vec<PreparedPart>> {
        let mut prepared = Vec::with_capacity(parts.len());
        let mut total = 0usize;
        for part in parts {
            let content = match (part.value, part.filename, part.data) {
                (Some(value), None, None) => {
                    total += value.len();
                    PartContent::Text(value)
                }
                (None, Some(filename), Some(data)) => {
                    let bytes = STANDARD.decode(data.as_bytes()).map_err(|e| {
                        SandboxError::invalid_request(format!(
                            "multipart part '{}' is not valid base64: {e}",
                            part.name
                        ))
                    })?;
                    total += bytes.len();
                    PartContent::File {
                        filename,
                        content_type: part
                            .content_type
                            .unwrap_or_else(|| "application/octet-stream".to_owned()),
                        bytes,
                    }
                }
                _ => {
                    return Err(SandboxError::invalid_request(format!(
                        "multipart part '{}' needs either 'value' or 'filename' + 'data'",
                        part.name
                    )));
                }
            };
            prepared.push(PreparedPart {
                name: part.name,
                content,
            });
        }
        if total > self.policy.max_request_size {
            return Err(SandboxError::request_too_large(
                "Multipart body",
                total,
                self.policy.max_request_size,
            ));
        }
        Ok(prepared)
    }

    /// Steps 5-7: screen the resolved address, consume a rate token, send.
    async fn send(&self, prepared: PreparedRequest) -> SandboxResult<reqwest::Response> {
        let host = prepared
            .url
            .host_str()
            .ok_or_else(|| SandboxError::invalid_request("url has no host"))?
            .to_owned();
        let port = prepared.url.port_or_known_default().unwrap_or(443);

        if self.allow_reserved_addresses {
            tracing::warn!(
                execution_id = %self.execution_id,
                %host,
                "reserved-address screening disabled by configuration"
            );
        } else {
            netguard::resolve_and_screen(&host, port).await?;
        }

        self.rate.check(&self.user_id, &self.reference, &self.policy)?;

        let mut request = self
            .client
            .request(prepared.method, prepared.url)
            .timeout(self.policy.timeout());
        for (name, value) in &prepared.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request = match prepared.body {
            RequestBody::Empty => request,
            RequestBody::Bytes(bytes) => request.body(bytes),
            RequestBody::Multipart(parts) => {
                let mut form = Form::new();
                for part in parts {
                    form = match part.content {
                        PartContent::Text(value) => form.text(part.name, value),
                        PartContent::File {
                            filename,
                            content_type,
                            bytes,
                        } => {
                            let file = Part::bytes(bytes)
                                .file_name(filename)
                                .mime_str(&content_type)
                                .map_err(|e| {
                                    SandboxError::invalid_request(format!(
                                        "invalid content type '{content_type}': {e}"
                                    ))
                                })?;
                            form.part(part.name, file)
                        }
                    };
                }
                request.multipart(form)
            }
        };

        request.send().await.map_err(|e| {
            if e.is_timeout() {
                SandboxError::execution_failed(format!("upstream request timed out: {e}"))
            } else {
                SandboxError::execution_failed(format!("upstream request failed: {e}"))
            }
        })
    }

    /// Steps 8-9: stream the body under the response cap, then encode.
    async fn buffer_response(&self, mut response: reqwest::Response) -> SandboxResult<Value> {
        let status = response.status().as_u16();
        let mut headers = serde_json::Map::new();
        for (name, value) in response.headers() {
            headers.insert(
                name.as_str().to_owned(),
                Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
            );
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_owned();

        let limit = self.policy.max_response_size;
        let mut body = Vec::new();
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    if body.len() + chunk.len() > limit {
                        return Err(SandboxError::ResponseTooLarge { limit });
                    }
                    body.extend_from_slice(&chunk);
                }
                Ok(None) => break,
                Err(e) => {
                    return Err(SandboxError::execution_failed(format!(
                        "failed to read response body: {e}"
                    )));
                }
            }
        }

        let mut payload = json!({
            "status": status,
            "headers": Value::Object(headers),
        });
        match decode_text_body(&content_type, &body) {
            Some(text) => {
                payload["body"] = Value::String(self.masker.mask_str(&text));
            }
            None => {
                payload["body"] = Value::String(STANDARD.encode(&body));
                payload["body_encoding"] = Value::String("base64".to_owned());
            }
        }
        Ok(payload)
    }

    fn envelope(&self, err: &SandboxError) -> String {
        tracing::debug!(
            execution_id = %self.execution_id,
            kind = err.kind(),
            "http host function denied"
        );
        let envelope = err.to_envelope();
        self.masker.mask_value(&envelope).to_string()
    }
}

impl std::fmt::Debug for HttpHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpHandler")
            .field("execution_id", &self.execution_id)
            .field("reference", &self.reference.to_string())
            .finish_non_exhaustive()
    }
}

/// Decode a response body as text when the content type and the bytes
/// both allow it; binary bodies return `None` and round-trip as base64.
fn decode_text_body(content_type: &str, body: &[u8]) -> Option<String> {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    let textual = essence.starts_with("text/")
        || essence.ends_with("+json")
        || essence.ends_with("+xml")
        || matches!(
            essence.as_str(),
            "application/json"
                | "application/xml"
                | "application/javascript"
                | "application/x-www-form-urlencoded"
                | ""
        );
    if !textual {
        return None;
    }
    String::from_utf8(body.to_vec()).ok()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;

    fn handler(policy: Policy) -> HttpHandler {
        HttpHandler::new(
            policy,
            "exec_test".to_owned(),
            "user-1".to_owned(),
            ComponentReference::parse("catalyst:weather.fetcher:1.0.0").unwrap(),
            Arc::new(SecretMasker::default()),
            Arc::new(RateLimiter::new()),
            false,
        )
    }

    fn open_policy() -> Policy {
        Policy {
            allowed_domains: vec!["api.example.com".to_owned()],
            ..Policy::default()
        }
    }

    #[tokio::test]
    async fn test_invalid_json_envelope() {
        let out = handler(open_policy()).handle("{not json".to_owned()).await;
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["error"]["type"], "invalid_json");
    }

    #[tokio::test]
    async fn test_missing_fields_are_invalid_request() {
        let out = handler(open_policy())
            .handle(r#"{"url": "https://api.example.com/"}"#.to_owned())
            .await;
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["error"]["type"], "invalid_request");
        assert!(value["error"]["message"]
            .as_str()
            .unwrap()
            .contains("method"));
    }

    #[tokio::test]
    async fn test_blocked_method_envelope() {
        let policy = Policy {
            allowed_methods: vec!["GET".to_owned()],
            ..open_policy()
        };
        let out = handler(policy)
            .handle(r#"{"method": "DELETE", "url": "https://api.example.com/"}"#.to_owned())
            .await;
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["error"]["type"], "method_blocked");
        assert!(value["error"]["message"].as_str().unwrap().contains("GET"));
    }

    #[tokio::test]
    async fn test_blocked_domain_envelope() {
        let out = handler(open_policy())
            .handle(r#"{"method": "POST", "url": "https://evil.com/"}"#.to_owned())
            .await;
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["error"]["type"], "domain_blocked");
        assert!(value["error"]["message"]
            .as_str()
            .unwrap()
            .contains("api.example.com"));
    }

    #[tokio::test]
    async fn test_empty_domains_reject_every_host() {
        let policy = Policy::default();
        let out = handler(policy)
            .handle(r#"{"method": "GET", "url": "https://anything.example.com/"}"#.to_owned())
            .await;
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["error"]["type"], "domain_blocked");
    }

    #[tokio::test]
    async fn test_oversized_body_envelope() {
        let policy = Policy {
            max_request_size: 8,
            ..open_policy()
        };
        let request = json!({
            "method": "POST",
            "url": "https://api.example.com/",
            "body": "way more than eight bytes",
        });
        let out = handler(policy).handle(request.to_string()).await;
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["error"]["type"], "request_too_large");
    }

    #[tokio::test]
    async fn test_oversized_multipart_names_multipart() {
        let policy = Policy {
            max_request_size: 4,
            ..open_policy()
        };
        let request = json!({
            "method": "POST",
            "url": "https://api.example.com/",
            "multipart": [{"name": "field", "value": "longer than four"}],
        });
        let out = handler(policy).handle(request.to_string()).await;
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["error"]["type"], "request_too_large");
        assert!(value["error"]["message"]
            .as_str()
            .unwrap()
            .contains("Multipart body"));
    }

    #[tokio::test]
    async fn test_body_and_multipart_are_mutually_exclusive() {
        let request = json!({
            "method": "POST",
            "url": "https://api.example.com/",
            "body": "x",
            "multipart": [{"name": "f", "value": "y"}],
        });
        let out = handler(open_policy()).handle(request.to_string()).await;
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["error"]["type"], "invalid_request");
    }

    #[tokio::test]
    async fn test_invalid_base64_body_is_rejected() {
        let request = json!({
            "method": "POST",
            "url": "https://api.example.com/",
            "body": "!!not-base64!!",
            "body_encoding": "base64",
        });
        let out = handler(open_policy()).handle(request.to_string()).await;
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["error"]["type"], "invalid_request");
    }

    #[tokio::test]
    async fn test_loopback_literal_is_screened() {
        let policy = Policy {
            allowed_domains: vec!["*".to_owned()],
            ..Policy::default()
        };
        let out = handler(policy)
            .handle(r#"{"method": "GET", "url": "http://127.0.0.1:9/"}"#.to_owned())
            .await;
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["error"]["type"], "private_ip_blocked");
    }

    #[test]
    fn test_text_bodies_are_detected_by_content_type() {
        assert!(decode_text_body("application/json; charset=utf-8", b"{}").is_some());
        assert!(decode_text_body("text/plain", b"hello").is_some());
        assert!(decode_text_body("application/problem+json", b"{}").is_some());
        assert!(decode_text_body("image/png", b"\x89PNG").is_none());
        // Textual content type with invalid UTF-8 falls back to base64
        assert!(decode_text_body("text/plain", &[0xff, 0xfe]).is_none());
    }
}
