//! Request routing with cross-provider fallback.
//!
//! Unary and streaming requests share candidate selection; only the commit
//! point differs. A unary attempt can fail all the way through the body,
//! and the router moves on. A streaming attempt commits at the first
//! successful response header: from then on bytes flow to the client and a
//! mid-stream failure is the client's to see, never a reason to retry
//! elsewhere. Retrying after the first byte would mean buffering whole
//! streams or duplicating content.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::models::chat::{ChatCompletionRequest, ChatCompletionResponse};
use crate::provider::ProviderClient;
use crate::registry::ProviderRegistry;
use crate::routing::{AliasTable, CandidateSelector, RoutingStrategy};

/// A committed upstream stream: the provider that accepted the request and
/// its raw SSE response.
pub struct CommittedStream {
    pub provider: String,
    pub response: reqwest::Response,
}

pub struct Router {
    selector: CandidateSelector,
    aliases: AliasTable,
    client: ProviderClient,
}

impl Router {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        aliases: AliasTable,
        strategy: RoutingStrategy,
        fallback_chain: Option<Vec<String>>,
        client: ProviderClient,
    ) -> Self {
        Self {
            selector: CandidateSelector::new(registry, strategy, fallback_chain),
            aliases,
            client,
        }
    }

    pub fn aliases(&self) -> &AliasTable {
        &self.aliases
    }

    pub async fn route_unary(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, GatewayError> {
        let candidates = self
            .selector
            .candidates(&request.model, request.provider.as_deref());
        if candidates.is_empty() {
            return Err(GatewayError::NoProvidersAvailable);
        }

        let mut last_error: Option<String> = None;
        for candidate in candidates {
            let native_model = self.aliases.resolve(&request.model, &candidate.name);
            if !candidate.supports(&native_model) {
                debug!(
                    provider = %candidate.name,
                    model = %native_model,
                    "provider does not list model, skipping"
                );
                continue;
            }

            match self.client.invoke(&candidate, request, &native_model).await {
                Ok(response) => {
                    debug!(provider = %candidate.name, model = %native_model, "unary request served");
                    return Ok(response);
                }
                Err(e) => {
                    warn!(provider = %candidate.name, error = %e, "provider attempt failed");
                    last_error = Some(e.to_string());
                }
            }
        }

        match last_error {
            Some(last) => Err(GatewayError::AllProvidersFailed { last }),
            // Every candidate was skipped for lack of the model.
            None => Err(GatewayError::NoProvidersAvailable),
        }
    }

    /// Try candidates until one returns a 200 response header, then hand
    /// the open stream back. Anything that goes wrong after that belongs to
    /// the caller.
    pub async fn route_stream(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<CommittedStream, GatewayError> {
        let candidates = self
            .selector
            .candidates(&request.model, request.provider.as_deref());
        if candidates.is_empty() {
            return Err(GatewayError::NoProvidersAvailable);
        }

        let mut last_error: Option<String> = None;
        for candidate in candidates {
            let native_model = self.aliases.resolve(&request.model, &candidate.name);
            if !candidate.supports(&native_model) {
                debug!(
                    provider = %candidate.name,
                    model = %native_model,
                    "provider does not list model, skipping"
                );
                continue;
            }

            match self
                .client
                .open_stream(&candidate, request, &native_model)
                .await
            {
                Ok(response) => {
                    debug!(provider = %candidate.name, model = %native_model, "stream committed");
                    return Ok(CommittedStream {
                        provider: candidate.name.clone(),
                        response,
                    });
                }
                Err(e) => {
                    warn!(provider = %candidate.name, error = %e, "provider attempt failed");
                    last_error = Some(e.to_string());
                }
            }
        }

        match last_error {
            Some(last) => Err(GatewayError::AllProvidersFailed { last }),
            None => Err(GatewayError::NoProvidersAvailable),
        }
    }
}
