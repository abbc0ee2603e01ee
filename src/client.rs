use std::pin::Pin;
use std::time::Instant;

use futures::Stream;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client as ReqwestClient, Response};
use serde::Deserialize;
use url::Url;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::observability::{CLIENT_REQUEST_DURATION, CLIENT_REQUEST_ERRORS, CLIENT_REQUESTS};
use crate::sse::process_sse;
use crate::types::{GenerateContentRequest, GenerateContentResponse, Model};

/// Client for the Gemini API.
#[derive(Debug, Clone)]
pub struct Gemini {
    config: ClientConfig,
    client: ReqwestClient,
}

impl Gemini {
    /// Create a new Gemini client from an explicit configuration.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = ReqwestClient::builder()
            .connect_timeout(config.timeout())
            .build()
            .map_err(|e| {
                Error::http_client(
                    format!("Failed to build HTTP client: {}", e),
                    Some(Box::new(e)),
                )
            })?;

        Ok(Self { config, client })
    }

    /// The configuration this client was built from.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Create and return default headers for API requests.
    fn default_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        let api_key = HeaderValue::from_str(self.config.api_key()).map_err(|_| {
            Error::configuration("API key is not a valid header value", None)
        })?;
        headers.insert("x-goog-api-key", api_key);
        Ok(headers)
    }

    /// Build the URL for `models/{model}:{method}`.
    fn model_url(&self, model: &Model, method: &str) -> Result<Url> {
        let model = model.as_str();
        let model = model.strip_prefix("models/").unwrap_or(model);
        if model.is_empty() || model.contains('/') {
            return Err(Error::validation(
                format!("invalid model identifier: {model:?}"),
                Some("model".to_string()),
            ));
        }
        Ok(self
            .config
            .base_url()
            .join(&format!("models/{model}:{method}"))?)
    }

    fn map_send_error(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::timeout(
                format!("Request timed out: {}", e),
                Some(self.config.timeout().as_secs_f64()),
            )
        } else if e.is_connect() {
            Error::connection(format!("Connection error: {}", e), Some(Box::new(e)))
        } else {
            Error::http_client(format!("Request failed: {}", e), Some(Box::new(e)))
        }
    }

    /// Process API response errors and convert to our Error type
    async fn process_error_response(response: Response) -> Error {
        let status_code = response.status().as_u16();

        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|val| val.to_str().ok())
            .and_then(|val| val.parse::<u64>().ok());

        let error_body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return Error::http_client(
                    format!("Failed to read error response: {}", e),
                    Some(Box::new(e)),
                );
            }
        };

        let detail = serde_json::from_str::<ErrorResponse>(&error_body)
            .ok()
            .and_then(|parsed| parsed.error)
            .unwrap_or_else(|| ErrorDetail {
                code: Some(status_code),
                message: Some(error_body),
                status: None,
            });

        error_for_status(status_code, detail, retry_after)
    }

    async fn post(
        &self,
        url: Url,
        headers: HeaderMap,
        body: &GenerateContentRequest,
    ) -> Result<Response> {
        CLIENT_REQUESTS.click();
        let start = Instant::now();
        // The deadline covers the response headers; a streamed body may take as long as it needs.
        let request = self.client.post(url).headers(headers).json(body).send();
        let result = tokio::time::timeout(self.config.timeout(), request).await;
        CLIENT_REQUEST_DURATION.add(start.elapsed().as_secs_f64());

        let response = match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                CLIENT_REQUEST_ERRORS.click();
                return Err(self.map_send_error(e));
            }
            Err(_) => {
                CLIENT_REQUEST_ERRORS.click();
                return Err(Error::timeout(
                    format!(
                        "no response within {:.1}s",
                        self.config.timeout().as_secs_f64()
                    ),
                    Some(self.config.timeout().as_secs_f64()),
                ));
            }
        };
        if !response.status().is_success() {
            CLIENT_REQUEST_ERRORS.click();
            let err = Self::process_error_response(response).await;
            tracing::debug!(error = %err, "generate request rejected");
            return Err(err);
        }
        Ok(response)
    }

    /// Generate a complete response in one round trip.
    pub async fn generate_content(
        &self,
        model: &Model,
        request: &GenerateContentRequest,
    ) -> Result<GenerateContentResponse> {
        let url = self.model_url(model, "generateContent")?;
        let response = self.post(url, self.default_headers()?, request).await?;

        let response = response.json::<GenerateContentResponse>().await.map_err(|e| {
            Error::serialization(
                format!("Failed to parse response: {}", e),
                Some(Box::new(e)),
            )
        })?;
        if let Some(reason) = response.block_reason() {
            return Err(Error::blocked(reason));
        }
        Ok(response)
    }

    /// Generate a response as a stream of incremental chunks.
    ///
    /// Each chunk carries only the text generated since the previous one.
    pub async fn stream_generate_content(
        &self,
        model: &Model,
        request: &GenerateContentRequest,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<GenerateContentResponse>> + Send>>> {
        let mut url = self.model_url(model, "streamGenerateContent")?;
        url.query_pairs_mut().append_pair("alt", "sse");

        let mut headers = self.default_headers()?;
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("text/event-stream"),
        );

        tracing::debug!(%model, turns = request.contents.len(), "opening generation stream");
        let response = self.post(url, headers, request).await?;

        // Get the byte stream from the response
        let stream = response.bytes_stream();

        Ok(Box::pin(process_sse(Box::pin(stream))))
    }
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: Option<ErrorDetail>,
}

/// The `error` object of a Google API error body.
#[derive(Debug, Deserialize)]
pub(crate) struct ErrorDetail {
    pub(crate) code: Option<u16>,
    pub(crate) message: Option<String>,
    pub(crate) status: Option<String>,
}

/// Map an HTTP status code and error body to the appropriate error type.
pub(crate) fn error_for_status(
    status_code: u16,
    detail: ErrorDetail,
    retry_after: Option<u64>,
) -> Error {
    let message = detail
        .message
        .filter(|message| !message.trim().is_empty())
        .unwrap_or_else(|| format!("request failed with status {status_code}"));

    match status_code {
        400 => Error::bad_request(message),
        401 => Error::authentication(message),
        403 => Error::permission(message),
        404 => Error::not_found(message),
        408 => Error::timeout(message, None),
        429 => Error::rate_limit(message, retry_after),
        500 => Error::internal_server(message),
        502..=504 => Error::service_unavailable(message, retry_after),
        _ => Error::api(status_code, detail.status, message),
    }
}
