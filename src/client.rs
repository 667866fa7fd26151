//! A generative-model client with resilience built in.
//!
//! [`GeminiClient`] is a thin façade: it builds the payload for an operation, sends it
//! through a [`Transport`], and validates the response *inside* each attempt, so that
//! empty, filtered or malformed responses are retried like any other transient
//! failure. Everything else is delegated to a [`ResilientCaller`].

use crate::caller::ResilientCaller;
use crate::context::CallContext;
use crate::operation::OperationKind;
use crate::transport::{
    GeminiRequestBuilder, HttpTransport, RequestBuilder, RequestParams, Transport,
};
use crate::validate::{
    extract_binary, extract_structured, extract_text, GenerateContentResponse, ResponseAnomaly,
};
use crate::{Error, Response, Result};
use std::sync::Arc;

/// Client for text, multimodal, segmentation and image-generation calls.
///
/// The client is cheap to clone and is designed to be reused; clones share the
/// transport and the caller's rate-limit and circuit state.
///
/// # Examples
///
/// ```no_run
/// use callward::{CallContext, GeminiClient, ResilientCaller};
/// use callward::transport::HttpTransport;
///
/// # async fn example() -> Result<(), callward::Error> {
/// let transport = HttpTransport::builder().api_key("my-key")?.build()?;
/// let client = GeminiClient::new(transport, ResilientCaller::builder().build()?);
///
/// let response = client
///     .generate_text(&CallContext::new(), "Suggest a colour for a north-facing room")
///     .await?;
/// println!("{}", response.data);
/// # Ok(())
/// # }
/// ```
pub struct GeminiClient<T, B = GeminiRequestBuilder> {
    inner: Arc<GeminiClientInner<T, B>>,
}

struct GeminiClientInner<T, B> {
    transport: T,
    request_builder: B,
    caller: ResilientCaller,
}

impl<T, B> Clone for GeminiClient<T, B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl GeminiClient<HttpTransport> {
    /// Creates a client for the public API with default resilience settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is not a valid header value.
    pub fn from_api_key(api_key: impl AsRef<str>) -> Result<Self> {
        let transport = HttpTransport::builder().api_key(api_key)?.build()?;
        Ok(Self::new(transport, ResilientCaller::builder().build()?))
    }
}

impl<T: Transport> GeminiClient<T> {
    /// Creates a client using the default request builder.
    pub fn new(transport: T, caller: ResilientCaller) -> Self {
        GeminiClient::with_request_builder(transport, GeminiRequestBuilder::new(), caller)
    }
}

impl<T: Transport, B: RequestBuilder> GeminiClient<T, B> {
    /// Creates a client with a custom request builder.
    pub fn with_request_builder(transport: T, request_builder: B, caller: ResilientCaller) -> Self {
        Self {
            inner: Arc::new(GeminiClientInner {
                transport,
                request_builder,
                caller,
            }),
        }
    }

    /// The caller that guards every request.
    pub fn caller(&self) -> &ResilientCaller {
        &self.inner.caller
    }

    /// The transport requests are sent through.
    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// Generates text from a prompt.
    pub async fn generate_text(&self, ctx: &CallContext, prompt: &str) -> Result<Response<String>> {
        self.call(OperationKind::Text, ctx, RequestParams::text(prompt), extract_text)
            .await
    }

    /// Answers a prompt about an image.
    pub async fn analyze_image(
        &self,
        ctx: &CallContext,
        prompt: &str,
        image: &[u8],
        mime_type: &str,
    ) -> Result<Response<String>> {
        self.call(
            OperationKind::Multimodal,
            ctx,
            RequestParams::with_image(prompt, image, mime_type),
            extract_text,
        )
        .await
    }

    /// Asks for a segmentation of an image and returns the structured JSON payload.
    ///
    /// The model's text answer may wrap the JSON in a code fence or surrounding prose;
    /// a response without any decodable JSON is malformed and retried.
    pub async fn segment(
        &self,
        ctx: &CallContext,
        prompt: &str,
        image: &[u8],
        mime_type: &str,
    ) -> Result<Response<serde_json::Value>> {
        self.call(
            OperationKind::Segmentation,
            ctx,
            RequestParams::with_image(prompt, image, mime_type),
            |response| extract_structured(&extract_text(response)?),
        )
        .await
    }

    /// Generates an image and returns its decoded bytes.
    pub async fn generate_image(&self, ctx: &CallContext, prompt: &str) -> Result<Response<Vec<u8>>> {
        self.call(
            OperationKind::ImageGeneration,
            ctx,
            RequestParams::text(prompt),
            extract_binary,
        )
        .await
    }

    async fn call<R, E>(
        &self,
        kind: OperationKind,
        ctx: &CallContext,
        params: RequestParams<'_>,
        extract: E,
    ) -> Result<Response<R>>
    where
        E: Fn(&GenerateContentResponse) -> std::result::Result<R, ResponseAnomaly>,
    {
        let inner = &*self.inner;
        let request = inner.request_builder.build(kind, &params)?;
        let timeout = inner.caller.circuit_breaker().config().call_timeout;

        let request = &request;
        let transport = &inner.transport;
        let extract = &extract;
        inner
            .caller
            .execute(kind.key(), ctx, move |_| async move {
                let body = transport
                    .send(&request.endpoint, &request.payload, timeout)
                    .await?;
                let response = GenerateContentResponse::from_value(&body)?;
                Ok::<R, Error>(extract(&response)?)
            })
            .await
    }
}
