use crate::error::{ProxyError, Result};
use crate::logging::SharedLogger;
use crate::models::ModelResolver;
use crate::orchestrator::Orchestrator;
use crate::translate::anthropic_types::{ErrorResponse, MessagesRequest, MessagesResponse};
use crate::translate::openai_types::{
    ChatCompletionRequest, ChatCompletionResponse, ChatErrorResponse,
};
use crate::translate::{
    anthropic_to_internal, openai_to_internal, AnthropicStreamTranslator, InternalRequest,
    OpenAiStreamTranslator, ResponseAccumulator,
};
use crate::upstream::sse::ChunkStream;
use crate::upstream::types::UpstreamRequest;
use crate::upstream::UpstreamClient;

use futures::stream::{self, Stream};
use futures::StreamExt;
use std::pin::Pin;

/// Outcome of a gateway call: a whole response, or a stream of SSE events.
pub enum GatewayReply<T> {
    Complete(T),
    Stream(SseStream),
}

pub type SseStream = Pin<Box<dyn Stream<Item = SseEvent> + Send>>;

/// One server-sent event. OpenAI frames carry no event name.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    fn named(event: &str, data: String) -> Self {
        Self {
            event: Some(event.to_string()),
            data,
        }
    }

    fn data(data: String) -> Self {
        Self { event: None, data }
    }
}

/// Converts caller requests, runs them against the account pool, and converts
/// the replies back.
#[derive(Clone)]
pub struct Gateway {
    resolver: ModelResolver,
    client: UpstreamClient,
    orchestrator: Orchestrator,
    logger: SharedLogger,
}

impl Gateway {
    pub fn new(
        resolver: ModelResolver,
        client: UpstreamClient,
        orchestrator: Orchestrator,
        logger: SharedLogger,
    ) -> Self {
        Self {
            resolver,
            client,
            orchestrator,
            logger,
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub async fn openai(
        &self,
        req: &ChatCompletionRequest,
    ) -> Result<GatewayReply<ChatCompletionResponse>> {
        let internal = openai_to_internal(req, &self.resolver)?;
        let request_id = new_request_id();
        self.log_request(&request_id, "openai", &internal);

        if internal.stream {
            let chunks = self.open_stream(&internal, &request_id).await?;
            let translator = OpenAiStreamTranslator::new(&internal);
            return Ok(GatewayReply::Stream(openai_events(
                chunks,
                translator,
                self.logger.clone(),
                request_id,
            )));
        }

        let acc = self.complete(&internal, &request_id).await?;
        Ok(GatewayReply::Complete(acc.into_openai(&internal)))
    }

    pub async fn anthropic(
        &self,
        req: &MessagesRequest,
    ) -> Result<GatewayReply<MessagesResponse>> {
        let internal = anthropic_to_internal(req, &self.resolver)?;
        let request_id = new_request_id();
        self.log_request(&request_id, "anthropic", &internal);

        if internal.stream {
            let chunks = self.open_stream(&internal, &request_id).await?;
            let translator = AnthropicStreamTranslator::new(&internal);
            return Ok(GatewayReply::Stream(anthropic_events(
                chunks,
                translator,
                self.logger.clone(),
                request_id,
            )));
        }

        let acc = self.complete(&internal, &request_id).await?;
        let resp = acc.into_anthropic(&internal);
        self.logger.info(
            "proxy",
            format!(
                "[{}] Completed: in={} out={} tokens",
                request_id, resp.usage.input_tokens, resp.usage.output_tokens
            ),
        );
        Ok(GatewayReply::Complete(resp))
    }

    /// Buffered call, served either by `generateContent` or by draining the
    /// streaming endpoint.
    async fn complete(
        &self,
        internal: &InternalRequest,
        request_id: &str,
    ) -> Result<ResponseAccumulator> {
        let client = &self.client;
        self.orchestrator
            .execute(internal.family(), request_id, |cred| {
                let body = upstream_body(internal, &cred.project_id);
                async move {
                    if internal.collect_via_stream {
                        let chunks = client.stream(&cred.access_token, &body).await?;
                        ResponseAccumulator::collect(chunks).await
                    } else {
                        let resp = client.generate(&cred.access_token, &body).await?;
                        Ok(ResponseAccumulator::from_response(resp))
                    }
                }
            })
            .await
    }

    /// Open the upstream stream. Models that only return whole turns are
    /// collected here and replayed one part per chunk.
    async fn open_stream(&self, internal: &InternalRequest, request_id: &str) -> Result<ChunkStream> {
        let client = &self.client;
        self.orchestrator
            .execute(internal.family(), request_id, |cred| {
                let body = upstream_body(internal, &cred.project_id);
                async move {
                    let chunks = client.stream(&cred.access_token, &body).await?;
                    if !internal.buffers_stream() {
                        return Ok(chunks);
                    }
                    let acc = ResponseAccumulator::collect(chunks).await?;
                    let replay: ChunkStream = Box::pin(stream::iter(acc.replay().into_iter().map(Ok)));
                    Ok(replay)
                }
            })
            .await
    }

    fn log_request(&self, request_id: &str, format: &str, internal: &InternalRequest) {
        tracing::info!(
            request_id,
            format,
            model = %internal.requested_model,
            upstream_model = %internal.model,
            stream = internal.stream,
            "Request"
        );
        self.logger.info(
            "proxy",
            format!(
                "[{}] {} model={} upstream={} stream={} turns={}",
                request_id,
                format,
                internal.requested_model,
                internal.model,
                internal.stream,
                internal.request.contents.len()
            ),
        );
    }
}

fn upstream_body(internal: &InternalRequest, project: &str) -> UpstreamRequest {
    UpstreamRequest::new(project, internal.model.clone(), internal.request.clone())
}

fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().simple())
}

fn anthropic_events(
    mut chunks: ChunkStream,
    mut translator: AnthropicStreamTranslator,
    logger: SharedLogger,
    request_id: String,
) -> SseStream {
    Box::pin(async_stream::stream! {
        while let Some(item) = chunks.next().await {
            let chunk = match item {
                Ok(c) => c,
                Err(e) => {
                    logger.error("stream", format!("[{}] Upstream stream failed: {}", request_id, e));
                    let body = serde_json::to_string(&ErrorResponse::from(&e)).unwrap_or_default();
                    yield SseEvent::named("error", body);
                    return;
                }
            };
            for event in translator.process(&chunk) {
                if let Ok(json) = serde_json::to_string(&event) {
                    yield SseEvent::named(event.event_name(), json);
                }
            }
        }

        for event in translator.finish() {
            if let Ok(json) = serde_json::to_string(&event) {
                yield SseEvent::named(event.event_name(), json);
            }
        }
        logger.info("stream", format!("[{}] Stream completed", request_id));
    })
}

fn openai_events(
    mut chunks: ChunkStream,
    mut translator: OpenAiStreamTranslator,
    logger: SharedLogger,
    request_id: String,
) -> SseStream {
    Box::pin(async_stream::stream! {
        while let Some(item) = chunks.next().await {
            let chunk = match item {
                Ok(c) => c,
                Err(e) => {
                    logger.error("stream", format!("[{}] Upstream stream failed: {}", request_id, e));
                    let body = serde_json::to_string(&ChatErrorResponse::from(&e)).unwrap_or_default();
                    yield SseEvent::data(body);
                    yield SseEvent::data("[DONE]".to_string());
                    return;
                }
            };
            for out in translator.process(&chunk) {
                if let Ok(json) = serde_json::to_string(&out) {
                    yield SseEvent::data(json);
                }
            }
        }

        for out in translator.finish() {
            if let Ok(json) = serde_json::to_string(&out) {
                yield SseEvent::data(json);
            }
        }
        yield SseEvent::data("[DONE]".to_string());
        logger.info("stream", format!("[{}] Stream completed", request_id));
    })
}

/// Log and convert an error for the OpenAI route.
pub fn openai_error(logger: &SharedLogger, err: &ProxyError) -> (u16, ChatErrorResponse) {
    logger.warn("proxy", format!("OpenAI request failed: {}", err));
    (err.status_code(), ChatErrorResponse::from(err))
}

/// Log and convert an error for the Anthropic route.
pub fn anthropic_error(logger: &SharedLogger, err: &ProxyError) -> (u16, ErrorResponse) {
    logger.warn("proxy", format!("Anthropic request failed: {}", err));
    (err.status_code(), ErrorResponse::from(err))
}
