//! httpCall capability
//!
//! Outbound HTTP from scripts: `httpCall(method, url, { headers?, body? })`.
//! Only http and https URLs are allowed and response bodies are capped.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method};
use serde_json::{json, Map, Value};

use super::traits::{string_arg, Capability, CapabilityId};
use crate::config::HttpCallConfig;
use crate::error::{Error, Result};

/// `httpCall(method, url, options?)` performs an HTTP request on the host
pub struct HttpCallCapability {
    client: Client,
    config: HttpCallConfig,
}

impl HttpCallCapability {
    /// Create a new httpCall capability
    pub fn new(config: HttpCallConfig) -> Result<Self> {
        let client = Client::builder().user_agent(config.user_agent.clone()).build()?;
        Ok(Self { client, config })
    }

    fn parse_method(raw: &str) -> Result<Method> {
        Method::from_bytes(raw.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| Error::InvalidInput(format!("Invalid HTTP method: {}", raw)))
    }

    fn parse_url(raw: &str) -> Result<url::Url> {
        let url = url::Url::parse(raw).map_err(|e| Error::InvalidInput(format!("Invalid URL '{}': {}", raw, e)))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(Error::InvalidInput(format!(
                "Unsupported URL scheme '{}': only http and https are allowed",
                other
            ))),
        }
    }

    fn build_headers(options: &Map<String, Value>) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let Some(raw) = options.get("headers") else {
            return Ok(headers);
        };
        let Value::Object(raw) = raw else {
            return Err(Error::InvalidInput("options.headers must be an object".to_string()));
        };

        for (name, value) in raw {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| Error::InvalidInput(format!("Invalid header name: {}", name)))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|_| Error::InvalidInput(format!("Invalid value for header {}", name)))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    async fn read_body(&self, mut response: reqwest::Response) -> Result<Vec<u8>> {
        let limit = self.config.max_response_bytes;
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > limit {
                return Err(Error::Capability(format!(
                    "Response body exceeds {} bytes",
                    limit
                )));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

#[async_trait]
impl Capability for HttpCallCapability {
    fn id(&self) -> CapabilityId {
        CapabilityId::HttpCall
    }

    fn description(&self) -> &str {
        "Perform an HTTP request: httpCall(method, url, { headers?, body? })"
    }

    async fn invoke(&self, args: Vec<Value>) -> Result<Value> {
        let method = Self::parse_method(string_arg(&args, 0, "method")?)?;
        let url = Self::parse_url(string_arg(&args, 1, "url")?)?;
        let options = match args.get(2) {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => return Err(Error::InvalidInput("options must be an object".to_string())),
        };

        let mut request = self
            .client
            .request(method.clone(), url.clone())
            .headers(Self::build_headers(&options)?);
        request = match options.get("body") {
            None | Some(Value::Null) => request,
            Some(Value::String(text)) => request.body(text.clone()),
            Some(other) => request.json(other),
        };

        tracing::debug!(method = %method, url = %url, "httpCall");
        let response = request
            .send()
            .await
            .map_err(|e| Error::Capability(format!("Request to {} failed: {}", url, e)))?;

        let status = response.status();
        let status_text = status.canonical_reason().unwrap_or("").to_string();
        if !status.is_success() {
            return Err(Error::Capability(
                format!("HTTP {} {}", status.as_u16(), status_text).trim_end().to_string(),
            ));
        }

        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map_or(false, |ct| ct.contains("json"));
        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), Value::String(v.to_string())))
            })
            .collect();

        let bytes = self.read_body(response).await?;
        let body = if is_json {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        } else {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        };

        Ok(json!({
            "status": status.as_u16(),
            "statusText": status_text,
            "headers": headers,
            "body": body,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn capability() -> HttpCallCapability {
        HttpCallCapability::new(HttpCallConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_get_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .and(header("accept", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": [1, 2]})))
            .mount(&server)
            .await;

        let result = capability()
            .invoke(vec![
                json!("get"),
                json!(format!("{}/items", server.uri())),
                json!({"headers": {"Accept": "application/json"}}),
            ])
            .await
            .unwrap();

        assert_eq!(result["status"], 200);
        assert_eq!(result["statusText"], "OK");
        assert_eq!(result["body"]["items"], json!([1, 2]));
    }

    #[tokio::test]
    async fn test_post_json_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/echo"))
            .and(body_json(json!({"name": "x"})))
            .respond_with(ResponseTemplate::new(201).set_body_string("created"))
            .mount(&server)
            .await;

        let result = capability()
            .invoke(vec![
                json!("POST"),
                json!(format!("{}/echo", server.uri())),
                json!({"body": {"name": "x"}}),
            ])
            .await
            .unwrap();

        assert_eq!(result["status"], 201);
        assert_eq!(result["body"], "created");
    }

    #[tokio::test]
    async fn test_non_success_status_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = capability()
            .invoke(vec![json!("GET"), json!(format!("{}/missing", server.uri()))])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Capability error: HTTP 404 Not Found");
    }

    #[tokio::test]
    async fn test_response_size_cap() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(64)))
            .mount(&server)
            .await;

        let capability = HttpCallCapability::new(HttpCallConfig {
            max_response_bytes: 16,
            ..HttpCallConfig::default()
        })
        .unwrap();
        let err = capability
            .invoke(vec![json!("GET"), json!(server.uri())])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exceeds 16 bytes"));
    }

    #[tokio::test]
    async fn test_rejects_other_schemes() {
        let err = capability()
            .invoke(vec![json!("GET"), json!("file:///etc/passwd")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("only http and https"));
    }
}
