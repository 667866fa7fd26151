//! Request payloads and the HTTP transport that sends them.
//!
//! The resilience core never talks to the network itself. A [`Transport`] sends one
//! JSON payload and returns the decoded JSON body; a [`RequestBuilder`] turns an
//! operation and its inputs into that payload.

use crate::operation::OperationKind;
use crate::rate_limit::RateLimitInfo;
use crate::{Error, Result};
use base64::Engine;
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use url::Url;

/// Base URL of the public generative language API.
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/";

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "x-goog-api-key";

/// Sends a JSON payload to an endpoint and returns the JSON body.
pub trait Transport: Send + Sync {
    /// Sends `payload` to `endpoint`, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Implementations report transport failures as [`Error::Timeout`],
    /// [`Error::Network`] or [`Error::HttpError`], and undecodable bodies as
    /// [`Error::DeserializationFailed`], so that the default classifier can sort them.
    fn send(
        &self,
        endpoint: &str,
        payload: &Value,
        timeout: Duration,
    ) -> impl Future<Output = Result<Value>> + Send;
}

/// A [`Transport`] over HTTPS using `reqwest`.
///
/// # Examples
///
/// ```no_run
/// use callward::transport::HttpTransport;
///
/// # fn example() -> Result<(), callward::Error> {
/// let transport = HttpTransport::builder()
///     .api_key(std::env::var("GEMINI_API_KEY").unwrap_or_default())?
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http_client: reqwest::Client,
    base_url: Url,
    default_headers: HeaderMap,
}

impl HttpTransport {
    /// Creates a new `HttpTransportBuilder`.
    pub fn builder() -> HttpTransportBuilder {
        HttpTransportBuilder::new()
    }

    /// The URL endpoints are resolved against.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    async fn execute_request(
        &self,
        endpoint: &str,
        payload: &Value,
        timeout: Duration,
    ) -> Result<reqwest::Response> {
        let url = self.base_url.join(endpoint)?;

        tracing::debug!(url = %url, timeout_ms = timeout.as_millis(), "Sending request");

        self.http_client
            .post(url)
            .headers(self.default_headers.clone())
            .timeout(timeout)
            .json(payload)
            .send()
            .await
            .map_err(from_reqwest)
    }

    async fn parse_response(&self, response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let headers = response.headers().clone();

        tracing::debug!(status = status.as_u16(), "Received response");

        if !status.is_success() {
            let raw_response = response.text().await.unwrap_or_default();

            let info = RateLimitInfo::from_headers(&headers);
            let rate_limit_info = info.is_rate_limited().then_some(info);

            if status.is_client_error() {
                tracing::error!(
                    status = status.as_u16(),
                    response = %raw_response,
                    "Client error (4xx)"
                );
            } else if status.is_server_error() {
                tracing::warn!(
                    status = status.as_u16(),
                    response = %raw_response,
                    "Server error (5xx)"
                );
            }

            return Err(Error::HttpError {
                status,
                raw_response,
                headers,
                rate_limit_info,
            });
        }

        let raw_body = response.text().await.map_err(from_reqwest)?;

        serde_json::from_str(&raw_body).map_err(|e| {
            tracing::error!(
                error = %e,
                raw_response = %raw_body,
                "Failed to deserialize response"
            );
            Error::DeserializationFailed {
                raw_response: raw_body,
                serde_error: e.to_string(),
                status,
            }
        })
    }
}

impl Transport for HttpTransport {
    async fn send(&self, endpoint: &str, payload: &Value, timeout: Duration) -> Result<Value> {
        let response = self.execute_request(endpoint, payload, timeout).await?;
        self.parse_response(response).await
    }
}

fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout
    } else {
        Error::Network(e)
    }
}

/// Builder for configuring and creating an [`HttpTransport`].
pub struct HttpTransportBuilder {
    base_url: Option<Url>,
    default_headers: HeaderMap,
}

impl HttpTransportBuilder {
    /// Creates a builder pointing at [`DEFAULT_BASE_URL`].
    pub fn new() -> Self {
        Self {
            base_url: None,
            default_headers: HeaderMap::new(),
        }
    }

    /// Sets the base URL endpoints are resolved against.
    ///
    /// A trailing slash is added if missing, so that `models/...` endpoints resolve
    /// below the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn base_url(mut self, url: impl AsRef<str>) -> Result<Self> {
        let mut url = Url::parse(url.as_ref())?;
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        self.base_url = Some(url);
        Ok(self)
    }

    /// Sets the API key sent with every request.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is not a valid header value.
    pub fn api_key(self, key: impl AsRef<str>) -> Result<Self> {
        let mut builder = self.default_header(API_KEY_HEADER, key)?;
        if let Some(value) = builder.default_headers.get_mut(API_KEY_HEADER) {
            value.set_sensitive(true);
        }
        Ok(builder)
    }

    /// Adds a header that will be included in all requests.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn default_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        let name = HeaderName::try_from(name.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::try_from(value.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header value: {}", e)))?;
        self.default_headers.insert(name, value);
        Ok(self)
    }

    /// Builds the configured `HttpTransport`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn build(self) -> Result<HttpTransport> {
        let base_url = match self.base_url {
            Some(url) => url,
            None => Url::parse(DEFAULT_BASE_URL)?,
        };

        let http_client = reqwest::Client::builder().build().map_err(|e| {
            Error::ConfigurationError(format!("Failed to build HTTP client: {}", e))
        })?;

        Ok(HttpTransport {
            http_client,
            base_url,
            default_headers: self.default_headers,
        })
    }
}

impl Default for HttpTransportBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// An image passed alongside a prompt.
#[derive(Debug, Clone, Copy)]
pub struct ImageInput<'a> {
    /// Raw image bytes.
    pub data: &'a [u8],
    /// MIME type, e.g. `image/jpeg`.
    pub mime_type: &'a str,
}

/// Inputs for one request.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestParams<'a> {
    /// The prompt text.
    pub prompt: &'a str,
    /// An optional image.
    pub image: Option<ImageInput<'a>>,
}

impl<'a> RequestParams<'a> {
    /// Parameters carrying only a prompt.
    pub fn text(prompt: &'a str) -> Self {
        Self {
            prompt,
            image: None,
        }
    }

    /// Parameters carrying a prompt and an image.
    pub fn with_image(prompt: &'a str, data: &'a [u8], mime_type: &'a str) -> Self {
        Self {
            prompt,
            image: Some(ImageInput { data, mime_type }),
        }
    }
}

/// A request ready to hand to a [`Transport`].
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRequest {
    /// Endpoint relative to the transport's base URL.
    pub endpoint: String,
    /// The JSON body.
    pub payload: Value,
}

/// Turns an operation and its inputs into a request.
pub trait RequestBuilder: Send + Sync {
    /// Builds the request for `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationError`] if the inputs do not fit the operation.
    fn build(&self, kind: OperationKind, params: &RequestParams<'_>) -> Result<PreparedRequest>;
}

/// Builds generate-content requests.
///
/// # Examples
///
/// ```
/// use callward::operation::OperationKind;
/// use callward::transport::{GeminiRequestBuilder, RequestBuilder, RequestParams};
///
/// let builder = GeminiRequestBuilder::new().with_temperature(0.2);
/// let request = builder
///     .build(OperationKind::Text, &RequestParams::text("Hello"))
///     .unwrap();
///
/// assert_eq!(request.endpoint, "models/gemini-2.0-flash:generateContent");
/// assert_eq!(request.payload["contents"][0]["parts"][0]["text"], "Hello");
/// ```
#[derive(Debug, Clone, Default)]
pub struct GeminiRequestBuilder {
    models: HashMap<OperationKind, String>,
    temperature: Option<f32>,
}

impl GeminiRequestBuilder {
    /// Creates a builder using each kind's default model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the model used for `kind`.
    pub fn with_model(mut self, kind: OperationKind, model: impl Into<String>) -> Self {
        self.models.insert(kind, model.into());
        self
    }

    /// Sets the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// The model used for `kind`.
    pub fn model(&self, kind: OperationKind) -> &str {
        self.models
            .get(&kind)
            .map(String::as_str)
            .unwrap_or_else(|| kind.default_model())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: [RequestContent<'a>; 1],
    #[serde(skip_serializing_if = "GenerationConfig::is_empty")]
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct RequestContent<'a> {
    role: &'static str,
    parts: Vec<RequestPart<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
enum RequestPart<'a> {
    Text(&'a str),
    InlineData(InlinePayload<'a>),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InlinePayload<'a> {
    mime_type: &'a str,
    data: String,
}

#[derive(Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_modalities: Option<[&'static str; 2]>,
}

impl GenerationConfig {
    fn is_empty(&self) -> bool {
        self.temperature.is_none()
            && self.response_mime_type.is_none()
            && self.response_modalities.is_none()
    }
}

impl RequestBuilder for GeminiRequestBuilder {
    fn build(&self, kind: OperationKind, params: &RequestParams<'_>) -> Result<PreparedRequest> {
        if params.prompt.trim().is_empty() {
            return Err(Error::ConfigurationError(format!(
                "{kind} request needs a non-empty prompt"
            )));
        }

        let mut parts = vec![RequestPart::Text(params.prompt)];
        match (kind.takes_image(), params.image) {
            (true, Some(image)) if image.data.is_empty() => {
                return Err(Error::ConfigurationError(format!(
                    "{kind} request has an empty image"
                )));
            }
            (true, Some(image)) => parts.push(RequestPart::InlineData(InlinePayload {
                mime_type: image.mime_type,
                data: base64::engine::general_purpose::STANDARD.encode(image.data),
            })),
            (true, None) => {
                return Err(Error::ConfigurationError(format!(
                    "{kind} request needs an image"
                )));
            }
            (false, _) => {}
        }

        let mut generation_config = GenerationConfig {
            temperature: self.temperature,
            ..GenerationConfig::default()
        };
        match kind {
            OperationKind::Segmentation => {
                generation_config.response_mime_type = Some("application/json");
            }
            OperationKind::ImageGeneration => {
                generation_config.response_modalities = Some(["TEXT", "IMAGE"]);
            }
            OperationKind::Text | OperationKind::Multimodal => {}
        }

        let request = GenerateContentRequest {
            contents: [RequestContent {
                role: "user",
                parts,
            }],
            generation_config,
        };
        let payload = serde_json::to_value(&request)
            .map_err(|e| Error::SerializationFailed(e.to_string()))?;

        Ok(PreparedRequest {
            endpoint: format!("models/{}:generateContent", self.model(kind)),
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multimodal_request_inlines_image() {
        let request = GeminiRequestBuilder::new()
            .build(
                OperationKind::Multimodal,
                &RequestParams::with_image("What is this?", b"\x89PNG", "image/png"),
            )
            .unwrap();

        let parts = &request.payload["contents"][0]["parts"];
        assert_eq!(parts[0]["text"], "What is this?");
        assert_eq!(parts[1]["inlineData"]["mimeType"], "image/png");
        assert_eq!(parts[1]["inlineData"]["data"], "iVBORw==");
        assert!(request.payload.get("generationConfig").is_none());
    }

    #[test]
    fn test_image_generation_asks_for_image_modality() {
        let builder = GeminiRequestBuilder::new()
            .with_model(OperationKind::ImageGeneration, "imagen-test")
            .with_temperature(0.5);
        let request = builder
            .build(OperationKind::ImageGeneration, &RequestParams::text("A red chair"))
            .unwrap();

        assert_eq!(request.endpoint, "models/imagen-test:generateContent");
        let config = &request.payload["generationConfig"];
        assert_eq!(config["responseModalities"][1], "IMAGE");
        assert_eq!(config["temperature"], 0.5);
    }

    #[test]
    fn test_segmentation_requires_image() {
        let result = GeminiRequestBuilder::new()
            .build(OperationKind::Segmentation, &RequestParams::text("Find the sofa"));
        assert!(matches!(result, Err(Error::ConfigurationError(_))));

        let blank = GeminiRequestBuilder::new().build(OperationKind::Text, &RequestParams::text("  "));
        assert!(blank.is_err());
    }

    #[test]
    fn test_base_url_gains_trailing_slash() {
        let transport = HttpTransport::builder()
            .base_url("http://localhost:8080/v1beta")
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(
            transport.base_url().join("models/m:generateContent").unwrap().as_str(),
            "http://localhost:8080/v1beta/models/m:generateContent"
        );
    }

    #[test]
    fn test_invalid_api_key_is_rejected() {
        assert!(HttpTransport::builder().api_key("bad\nkey").is_err());
    }
}
