#![forbid(unsafe_code)]
#![doc = r#"
llmux

OpenAI-compatible gateway that multiplexes Chat Completions traffic across
several upstream providers (Groq, Together, Cerebras, SambaNova,
OpenRouter, and any other OpenAI-compatible endpoint). Clients speak the
standard Chat Completions protocol or the OpenResponses protocol; the
gateway picks a provider, rewrites model names, streams the result back,
and falls back to alternate providers until the first byte has been
committed. Repeat non-streaming requests are short-circuited by a
content-addressed response cache.

Modules
- `config`: YAML configuration with `${VAR}` interpolation.
- `models`: Chat Completions and OpenResponses wire shapes.
- `registry` / `routing` / `router`: provider descriptors, alias
  resolution, strategy-ordered candidate selection, and fallback.
- `provider`: the single upstream invoke path (unary + SSE).
- `cache`: SHA-256 keyed response cache with memory and Redis backends.
- `conversion` / `stream_events`: the OpenResponses adapter.
- `store`: prior-response store for conversation continuation.
- `server`: actix-web surface (health, models, completions, responses).
"#]

pub mod auth;
pub mod cache;
pub mod config;
pub mod conversion;
pub mod error;
pub mod models;
pub mod provider;
pub mod registry;
pub mod router;
pub mod routing;
pub mod server;
pub mod store;
pub mod stream_events;
pub mod util;

pub use crate::cache::{cache_key, CacheBackend, MemoryCache, RedisCache, ResponseCache};
pub use crate::config::GatewayConfig;
pub use crate::error::GatewayError;
pub use crate::registry::{ProviderDescriptor, ProviderRegistry};
pub use crate::router::Router;
pub use crate::routing::{AliasTable, RoutingStrategy};
pub use crate::server::{build_state, config_routes, AppState};
pub use crate::store::ResponseStore;
pub use crate::stream_events::ResponseEventStream;

// Re-export the model namespaces for ergonomic library use
// (`use llmux::{chat, responses}`).
pub use crate::models::{chat, responses};
