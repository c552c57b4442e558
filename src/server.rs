//! HTTP surface: health probes, model listing, and the two completion
//! endpoints.
//!
//! `/v1/chat/completions` serves the native protocol; `/v1/responses`
//! lowers to chat form before routing and lifts the result back. Streaming
//! responses are SSE in both dialects: the chat path pipes upstream bytes
//! verbatim, the responses path runs them through the event emitter.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use actix_web::{web, HttpRequest, HttpResponse, HttpResponseBuilder, Responder};
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::auth::ApiKeyAuth;
use crate::cache::{CacheBackend, MemoryCache, RedisCache, ResponseCache};
use crate::config::{CacheBackendKind, GatewayConfig};
use crate::conversion::{from_chat_response, normalize_input, to_chat_request};
use crate::error::GatewayError;
use crate::models::chat::ChatCompletionRequest;
use crate::models::responses::{InputItem, ResponsesRequest, StreamEvent};
use crate::provider::{ChunkStream, ProviderClient};
use crate::registry::ProviderRegistry;
use crate::router::Router;
use crate::routing::AliasTable;
use crate::store::{expand_previous, ResponseStore};
use crate::stream_events::ResponseEventStream;
use crate::util::{build_http_client, unix_timestamp};

#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<ApiKeyAuth>,
    pub registry: Arc<ProviderRegistry>,
    pub router: Arc<Router>,
    pub cache: Arc<ResponseCache>,
    pub store: Arc<ResponseStore>,
    pub client: ProviderClient,
}

/// Wire the whole gateway up from configuration.
pub async fn build_state(config: &GatewayConfig) -> anyhow::Result<AppState> {
    let registry = Arc::new(ProviderRegistry::from_config(config));
    if registry.is_empty() {
        warn!("no providers enabled; every completion request will fail");
    }

    let http = build_http_client();
    let client = ProviderClient::new(http);

    let aliases = AliasTable::new(config.routing.model_aliases.clone());
    let router = Router::new(
        registry.clone(),
        aliases,
        config.routing.default_strategy,
        config.routing.fallback_chain.clone(),
        client.clone(),
    );

    let cache = if config.cache.enabled {
        let backend: Arc<dyn CacheBackend> = match config.cache.backend {
            CacheBackendKind::Memory => Arc::new(MemoryCache::new(config.cache.memory.max_items)),
            CacheBackendKind::Redis => {
                match RedisCache::connect(
                    &config.cache.redis.url,
                    config.cache.redis.key_prefix.clone(),
                )
                .await
                {
                    Ok(redis) => Arc::new(redis),
                    Err(e) => {
                        warn!(error = %e, "redis unavailable, falling back to in-memory cache");
                        Arc::new(MemoryCache::new(config.cache.memory.max_items))
                    }
                }
            }
        };
        ResponseCache::from_config(&config.cache, backend)
    } else {
        ResponseCache::disabled()
    };

    Ok(AppState {
        auth: Arc::new(ApiKeyAuth::new(config.auth.key_map())),
        registry,
        router: Arc::new(router),
        cache: Arc::new(cache),
        store: Arc::new(ResponseStore::default()),
        client,
    })
}

pub fn config_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("")
            .route("/health", web::get().to(health))
            .route("/health/providers", web::get().to(health_providers))
            .route("/v1/models", web::get().to(list_models))
            .route("/v1/chat/completions", web::post().to(chat_completions))
            .route("/v1/responses", web::post().to(responses)),
    );
}

/// Check the bearer and return the client label for logging.
fn authorize(state: &AppState, req: &HttpRequest) -> Result<String, GatewayError> {
    let header = req
        .headers()
        .get(actix_web::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let verification = state.auth.verify(header)?;
    Ok(verification.label().to_string())
}

async fn health() -> impl Responder {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "timestamp": unix_timestamp(),
    }))
}

async fn health_providers(state: web::Data<AppState>) -> impl Responder {
    let probes = state.registry.list().into_iter().map(|provider| {
        let client = state.client.clone();
        async move {
            match client.probe_models(&provider).await {
                Ok(models) => json!({
                    "name": provider.name,
                    "status": "healthy",
                    "models": models,
                }),
                Err(e) => json!({
                    "name": provider.name,
                    "status": "unreachable",
                    "models": provider.models,
                    "error": e.to_string(),
                }),
            }
        }
    });
    let providers = futures_util::future::join_all(probes).await;

    HttpResponse::Ok().json(json!({
        "status": "ok",
        "timestamp": unix_timestamp(),
        "providers": providers,
    }))
}

async fn list_models(
    state: web::Data<AppState>,
    req: HttpRequest,
) -> Result<HttpResponse, GatewayError> {
    let _label = authorize(&state, &req)?;
    let created = unix_timestamp();

    let mut seen = std::collections::HashSet::new();
    let mut data = Vec::new();

    for friendly in state.router.aliases().friendly_models() {
        if seen.insert(friendly.to_string()) {
            data.push(json!({
                "id": friendly,
                "object": "model",
                "created": created,
                "owned_by": "llmux",
            }));
        }
    }
    for provider in state.registry.list() {
        for model in &provider.models {
            if seen.insert(model.clone()) {
                data.push(json!({
                    "id": model,
                    "object": "model",
                    "created": created,
                    "owned_by": provider.name,
                }));
            }
        }
    }

    Ok(HttpResponse::Ok().json(json!({"object": "list", "data": data})))
}

fn parse_chat_request(body: &Value) -> Result<ChatCompletionRequest, GatewayError> {
    let request: ChatCompletionRequest = serde_json::from_value(body.clone())
        .map_err(|e| GatewayError::validation("invalid_request", e.to_string()))?;
    if request.model.is_empty() {
        return Err(GatewayError::validation("invalid_model", "model is required"));
    }
    if request.messages.is_empty() {
        return Err(GatewayError::validation(
            "invalid_messages",
            "messages must not be empty",
        ));
    }
    Ok(request)
}

fn sse_response() -> HttpResponseBuilder {
    let mut builder = HttpResponse::Ok();
    builder
        .insert_header(("content-type", "text/event-stream"))
        .insert_header(("cache-control", "no-cache"))
        .insert_header(("connection", "keep-alive"))
        .insert_header(("x-accel-buffering", "no"));
    builder
}

async fn chat_completions(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<Value>,
) -> Result<HttpResponse, GatewayError> {
    let label = authorize(&state, &req)?;
    let request = parse_chat_request(&body)?;
    debug!(client = %label, model = %request.model, stream = request.stream.unwrap_or(false), "chat request");

    if request.stream == Some(true) {
        let committed = state.router.route_stream(&request).await?;
        let bytes = committed.response.bytes_stream().boxed();
        let mut builder = sse_response();
        builder.insert_header(("x-llmux-provider", committed.provider.clone()));
        return Ok(builder.streaming(ChatSsePassthrough::new(bytes)));
    }

    if let Some(hit) = state.cache.get(&request).await {
        return Ok(HttpResponse::Ok().json(hit));
    }

    let response = state.router.route_unary(&request).await?;
    state.cache.set(&request, &response).await;
    Ok(HttpResponse::Ok().json(response))
}

async fn responses(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<Value>,
) -> Result<HttpResponse, GatewayError> {
    let label = authorize(&state, &req)?;
    let request: ResponsesRequest = serde_json::from_value(body.into_inner())
        .map_err(|e| GatewayError::validation("invalid_request", e.to_string()))?;
    if request.model.is_empty() {
        return Err(GatewayError::validation("invalid_model", "model is required"));
    }
    debug!(client = %label, model = %request.model, stream = request.stream.unwrap_or(false), "responses request");

    let mut input = normalize_input(&request.input);
    if input.is_empty() {
        return Err(GatewayError::validation(
            "invalid_input",
            "input must not be empty",
        ));
    }

    if let Some(previous_id) = request.previous_response_id.as_deref() {
        let stored = state
            .store
            .get(previous_id)
            .ok_or_else(|| GatewayError::PreviousResponseNotFound(previous_id.to_string()))?;
        input = expand_previous(&stored, input);
    }

    let chat_request = to_chat_request(&request, &input);

    if request.stream == Some(true) {
        let committed = state.router.route_stream(&chat_request).await?;
        let provider = committed.provider.clone();
        let bytes = committed.response.bytes_stream().boxed();
        let chunks = ChunkStream::new(bytes, provider.clone());
        let events = ResponseEventStream::new(
            chunks,
            chat_request.model.clone(),
            Some(provider),
            unix_timestamp(),
        );
        let sse = ResponsesSseStream::new(events, state.store.clone(), input);
        return Ok(sse_response().streaming(sse));
    }

    let chat_response = state.router.route_unary(&chat_request).await?;
    let response = from_chat_response(&chat_response);
    state.store.set(response.clone(), input);
    Ok(HttpResponse::Ok().json(response))
}

// ---------------------------------------------------------------------------
// SSE stream adapters
// ---------------------------------------------------------------------------

/// Verbatim byte passthrough for chat streams. A mid-stream upstream error
/// becomes one final `data: {error}` frame; it never fails the HTTP
/// response that is already underway.
struct ChatSsePassthrough {
    inner: BoxStream<'static, Result<Bytes, reqwest::Error>>,
    finished: bool,
}

impl ChatSsePassthrough {
    fn new(inner: BoxStream<'static, Result<Bytes, reqwest::Error>>) -> Self {
        Self {
            inner,
            finished: false,
        }
    }
}

impl Stream for ChatSsePassthrough {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(bytes))) => Poll::Ready(Some(Ok(bytes))),
            Poll::Ready(Some(Err(e))) => {
                warn!(error = %e, "upstream chat stream failed mid-flight");
                this.finished = true;
                let frame = chat_error_frame(&e.to_string());
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

fn chat_error_frame(message: &str) -> Bytes {
    let payload = json!({
        "error": {
            "type": "api_error",
            "code": "stream_error",
            "message": message,
        }
    });
    Bytes::from(format!("data: {payload}\n\n"))
}

fn event_frame(event: &StreamEvent) -> Bytes {
    let payload = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Bytes::from(format!("event: {}\ndata: {}\n\n", event.event_type(), payload))
}

/// Serializes emitter events into SSE frames, stores the finished response
/// for conversation continuation, and terminates with `data: [DONE]`.
struct ResponsesSseStream<S> {
    inner: ResponseEventStream<S>,
    store: Arc<ResponseStore>,
    input: Option<Vec<InputItem>>,
    done_sent: bool,
}

impl<S> ResponsesSseStream<S> {
    fn new(
        inner: ResponseEventStream<S>,
        store: Arc<ResponseStore>,
        input: Vec<InputItem>,
    ) -> Self {
        Self {
            inner,
            store,
            input: Some(input),
            done_sent: false,
        }
    }
}

impl<S> Stream for ResponsesSseStream<S>
where
    S: Stream<Item = Result<crate::models::chat::ChatCompletionChunk, crate::provider::ProviderError>>
        + Unpin,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(event)) => {
                if let StreamEvent::Completed { response, .. } = &event {
                    let input = this.input.take().unwrap_or_default();
                    this.store.set(response.clone(), input);
                }
                Poll::Ready(Some(Ok(event_frame(&event))))
            }
            Poll::Ready(None) => {
                if this.done_sent {
                    Poll::Ready(None)
                } else {
                    this.done_sent = true;
                    Poll::Ready(Some(Ok(Bytes::from_static(b"data: [DONE]\n\n"))))
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
