use anyhow::{anyhow, Result};
use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::chat::Message;
use crate::config::Config;

/// A lazy, finite sequence of reply fragments. `None` marks the end of the reply;
/// an `Err` item is a failure and nothing follows it.
pub type FragmentStream = BoxStream<'static, Result<String>>;

/// The two upstream operations the interactive loop relies on.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Starts a streaming chat completion over `messages`.
    async fn chat_stream(&self, messages: &[Message]) -> Result<FragmentStream>;

    /// Requests a single 1024x1024 image and returns its base64 encoded PNG payload.
    async fn create_image(&self, prompt: &str) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct StreamingChunk {
    #[serde(default)]
    choices: Vec<StreamingChoice>,

    // Providers report failures mid-stream as a chunk with only this set
    error: Option<ErrorResponse>,
}

#[derive(Debug, Deserialize)]
struct StreamingChoice {
    delta: Delta,
}

#[derive(Debug, Deserialize)]
struct Delta {
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct ImageRequest<'a> {
    prompt: &'a str,
    n: u32,
    size: &'a str,
    response_format: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    data: Vec<ImageData>,
}

#[derive(Debug, Deserialize)]
struct ImageData {
    b64_json: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    message: String,
    r#type: Option<String>,
    // Either a string or a number depending on the provider
    code: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponseContainer {
    error: ErrorResponse,
}

impl ErrorResponse {
    fn into_error(self) -> anyhow::Error {
        anyhow!(
            "API request failed ({}, code {}): {}",
            self.r#type.as_deref().unwrap_or("unknown"),
            self.code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "none".to_string()),
            self.message,
        )
    }
}

impl ErrorResponseContainer {
    fn into_error(self) -> anyhow::Error {
        self.error.into_error()
    }
}

/// One line of a server-sent event stream, as far as chat completions are concerned.
#[derive(Debug, PartialEq)]
enum EventLine {
    Ignore,
    Done,
    Fragment(String),
}

fn parse_event_line(line: &str) -> Result<EventLine> {
    // anything that isn't a 'data: ' line (comments, event names, blank separators) is skipped
    let Some(json_str) = line.strip_prefix("data:") else {
        return Ok(EventLine::Ignore);
    };
    let json_str = json_str.trim();
    if json_str.is_empty() {
        return Ok(EventLine::Ignore);
    }
    if json_str == "[DONE]" {
        return Ok(EventLine::Done);
    }

    match serde_json::from_str::<StreamingChunk>(json_str) {
        Ok(StreamingChunk {
            error: Some(error), ..
        }) => Err(error.into_error()),
        Ok(chunk) => Ok(chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)
            .map(EventLine::Fragment)
            .unwrap_or(EventLine::Ignore)),
        Err(e) => match serde_json::from_str::<ErrorResponseContainer>(json_str) {
            Ok(container) => Err(container.into_error()),
            Err(_) => Err(anyhow!("Failed to parse JSON: {}\nRaw JSON: {}", e, json_str)),
        },
    }
}

/// `ApiClient` talks to an OpenAI compatible API over HTTPS, optionally through a
/// local forwarding proxy.
pub struct ApiClient {
    client: Client,
    api: String,
    api_key: String,
    organization: String,
    model_id: String,
    image_model: Option<String>,
}

impl ApiClient {
    /// Creates a client from the parsed command-line configuration.
    ///
    /// Unless `--no-proxy` was given, every request is routed through the local
    /// HTTP proxy on `config.proxy_port`.
    ///
    /// # Returns
    /// - `Result<Self>`: the client, or an Err if the proxy address is malformed or
    ///   the underlying HTTP client cannot be built. Both are setup errors and the
    ///   caller should stop before the interactive loop starts.
    pub fn new(config: &Config) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(proxy) = config.proxy()? {
            tracing::debug!(port = config.proxy_port, "routing requests through local proxy");
            builder = builder.proxy(proxy);
        }

        Ok(ApiClient {
            client: builder.build()?,
            api: config.api.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            organization: config.organization.clone(),
            model_id: config.model_id.clone(),
            image_model: config.image_model.clone(),
        })
    }

    /// Posts `body` as JSON to `path` and returns the response if the status is a success.
    async fn post<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.api, path);
        tracing::debug!(%url, "sending request");

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.api_key));
        if !self.organization.is_empty() {
            request = request.header("OpenAI-Organization", &self.organization);
        }

        let response = request.json(body).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read response body".to_string());
            return Err(match serde_json::from_str::<ErrorResponseContainer>(&text) {
                Ok(container) => container.into_error().context(status),
                Err(_) => anyhow!("API request failed with status {}: {}", status, text),
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl Backend for ApiClient {
    async fn chat_stream(&self, messages: &[Message]) -> Result<FragmentStream> {
        let body = ChatRequest {
            model: &self.model_id,
            messages,
            stream: true,
        };
        let mut response = self.post("/v1/chat/completions", &body).await?;

        let stream = try_stream! {
            let mut buffer: Vec<u8> = Vec::new();
            let mut done = false;

            while !done {
                let Some(chunk) = response.chunk().await? else {
                    break;
                };
                buffer.extend_from_slice(&chunk);

                // Process complete lines from the buffer
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    match parse_event_line(String::from_utf8_lossy(&line).trim())? {
                        EventLine::Ignore => {}
                        EventLine::Done => {
                            done = true;
                            break;
                        }
                        EventLine::Fragment(fragment) => {
                            yield fragment;
                        }
                    }
                }
            }

            // a final line may arrive without its terminating newline
            if !done {
                if let EventLine::Fragment(fragment) =
                    parse_event_line(String::from_utf8_lossy(&buffer).trim())?
                {
                    yield fragment;
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn create_image(&self, prompt: &str) -> Result<String> {
        let body = ImageRequest {
            prompt,
            n: 1,
            size: "1024x1024",
            response_format: "b64_json",
            model: self.image_model.as_deref(),
        };
        let response = self.post("/v1/images/generations", &body).await?;
        let text = response.text().await?;

        let parsed = match serde_json::from_str::<ImageResponse>(&text) {
            Ok(parsed) => parsed,
            Err(e) => {
                return Err(match serde_json::from_str::<ErrorResponseContainer>(&text) {
                    Ok(container) => container.into_error(),
                    Err(_) => anyhow!("Failed to parse JSON: {}\nRaw JSON: {}", e, text),
                })
            }
        };

        parsed
            .data
            .into_iter()
            .next()
            .and_then(|image| image.b64_json)
            .ok_or_else(|| anyhow!("the API returned no image data"))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use futures::TryStreamExt;
    use httpmock::prelude::*;
    use serde_json::json;

    fn client_for(server: &MockServer, extra: &[&str]) -> ApiClient {
        let base_url = server.base_url();
        let mut args = vec!["gptty", "--api", base_url.as_str(), "-k", "TEST", "--no-proxy"];
        args.extend_from_slice(extra);
        ApiClient::new(&Config::try_parse_from(args).unwrap()).unwrap()
    }

    fn sse(chunks: &[serde_json::Value]) -> String {
        let mut body = String::new();
        for chunk in chunks {
            body.push_str(&format!("data: {}\n\n", chunk));
        }
        body.push_str("data: [DONE]\n\n");
        body
    }

    fn delta(content: &str) -> serde_json::Value {
        json!({
            "id": "chatcmpl-1",
            "object": "chat.completion.chunk",
            "choices": [{"index": 0, "delta": {"content": content}, "finish_reason": null}]
        })
    }

    #[test]
    fn event_lines() {
        assert_eq!(parse_event_line("").unwrap(), EventLine::Ignore);
        assert_eq!(parse_event_line(": keep-alive").unwrap(), EventLine::Ignore);
        assert_eq!(parse_event_line("data: [DONE]").unwrap(), EventLine::Done);
        assert_eq!(
            parse_event_line(&format!("data: {}", delta("hi"))).unwrap(),
            EventLine::Fragment("hi".to_string())
        );
        // role-only and usage chunks carry no text
        assert_eq!(
            parse_event_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap(),
            EventLine::Ignore
        );
        assert_eq!(
            parse_event_line(r#"data: {"choices":[],"usage":{"total_tokens":3}}"#).unwrap(),
            EventLine::Ignore
        );
    }

    #[test]
    fn in_band_error_and_garbage() {
        let err = parse_event_line(
            r#"data: {"error":{"message":"quota exceeded","type":"insufficient_quota","code":null}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));

        let err = parse_event_line(r#"data: {"choices":[],"error":{"message":"overloaded"}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("overloaded"));

        let err = parse_event_line("data: {not json").unwrap_err();
        assert!(err.to_string().contains("Failed to parse JSON"));
    }

    #[tokio::test]
    async fn chat_stream_yields_fragments_in_order() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/chat/completions")
                    .header("Authorization", "Bearer TEST")
                    .header("OpenAI-Organization", "org-42")
                    .json_body(json!({
                        "model": "gpt-3.5-turbo",
                        "messages": [{"role": "user", "content": "hi"}],
                        "stream": true,
                    }));
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body(sse(&[delta("Hel"), delta("lo"), delta("!")]));
            })
            .await;

        let client = client_for(&server, &["-o", "org-42"]);
        let fragments: Vec<String> = client
            .chat_stream(&[Message::user("hi")])
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(fragments, vec!["Hel", "lo", "!"]);
    }

    #[tokio::test]
    async fn chat_stream_reports_in_band_errors() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(200).body(format!(
                    "data: {}\n\ndata: {}\n\n",
                    delta("par"),
                    json!({"error": {"message": "overloaded", "type": "server_error"}})
                ));
            })
            .await;

        let client = client_for(&server, &[]);
        let mut stream = client.chat_stream(&[Message::user("hi")]).await.unwrap();
        assert_eq!(stream.try_next().await.unwrap().as_deref(), Some("par"));
        let err = stream.try_next().await.unwrap_err();
        assert!(err.to_string().contains("overloaded"));
    }

    #[tokio::test]
    async fn chat_stream_setup_fails_on_error_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(401).json_body(json!({
                    "error": {"message": "Incorrect API key provided", "type": "invalid_request_error", "code": "invalid_api_key"}
                }));
            })
            .await;

        let client = client_for(&server, &[]);
        let err = client
            .chat_stream(&[Message::user("hi")])
            .await
            .err()
            .unwrap();
        assert!(format!("{:#}", err).contains("Incorrect API key provided"));
    }

    #[tokio::test]
    async fn create_image_requests_one_b64_png() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/images/generations")
                    .header("Authorization", "Bearer TEST")
                    .json_body(json!({
                        "prompt": "draw a cat",
                        "n": 1,
                        "size": "1024x1024",
                        "response_format": "b64_json",
                    }));
                then.status(200).json_body(json!({
                    "created": 1700000000,
                    "data": [{"b64_json": "aGVsbG8="}]
                }));
            })
            .await;

        let client = client_for(&server, &[]);
        let payload = client.create_image("draw a cat").await.unwrap();

        mock.assert_async().await;
        assert_eq!(payload, "aGVsbG8=");
    }

    #[tokio::test]
    async fn create_image_without_data_is_an_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/images/generations");
                then.status(200).json_body(json!({"created": 1700000000, "data": []}));
            })
            .await;

        let client = client_for(&server, &["--image-model", "dall-e-3"]);
        assert!(client.create_image("draw a cat").await.is_err());
    }
}
