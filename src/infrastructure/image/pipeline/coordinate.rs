//! Single-flight stage.

use std::sync::Arc;

use async_trait::async_trait;

use super::{Chain, Exchange, Interceptor, Outcome, weights};
use crate::application::services::RequestCoordinator;
use crate::domain::entities::{CacheKey, FetchDepth, RequestState};
use crate::domain::errors::{ImageError, ImageResult};

/// Which chain a coordinator stage guards.
///
/// The two chains produce different artifacts for the same result key, so
/// their executions must never be merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightScope {
    /// Request-level chain; results end up in the memory cache.
    Request,
    /// Decode-level chain.
    Decode,
}

impl FlightScope {
    /// Key under which executions of `exchange` are collapsed.
    ///
    /// Requests with a shallower depth or narrower cache permissions can fail
    /// or skip a store where others succeed, so both are part of the key
    /// whenever they differ from the defaults. Memory reads happen before
    /// this stage and are left out.
    #[must_use]
    pub fn flight_key(self, exchange: &Exchange) -> CacheKey {
        let mut key = exchange.result_key().as_str().to_string();
        let options = exchange.request.options();
        if options.depth != FetchDepth::Network {
            key.push_str("|depth=");
            key.push_str(&options.depth.to_string());
        }
        let permissions = [
            ('m', 'w', options.memory_cache_policy.write_enabled()),
            ('d', 'r', options.disk_cache_policy.read_enabled()),
            ('d', 'w', options.disk_cache_policy.write_enabled()),
            ('n', 'r', options.network_cache_policy.read_enabled()),
        ];
        if permissions.iter().any(|&(_, _, allowed)| !allowed) {
            key.push_str("|perm=");
            for (layer, access, allowed) in permissions {
                key.push(layer);
                key.push(if allowed { access } else { '-' });
            }
        }
        match self {
            Self::Request => {}
            Self::Decode if exchange.apply_transformations => key.push_str("|decode"),
            Self::Decode => key.push_str("|decode-raw"),
        }
        CacheKey::new(key)
    }
}

/// Runs the rest of the chain at most once per flight key.
///
/// Callers arriving while an execution runs attach to it and receive a clone
/// of its [`Outcome`], including their own memory pin.
pub struct CoordinatorInterceptor {
    coordinator: Arc<RequestCoordinator<Outcome>>,
    scope: FlightScope,
}

impl CoordinatorInterceptor {
    /// Creates the stage.
    #[must_use]
    pub const fn new(coordinator: Arc<RequestCoordinator<Outcome>>, scope: FlightScope) -> Self {
        Self { coordinator, scope }
    }
}

#[async_trait]
impl Interceptor for CoordinatorInterceptor {
    fn name(&self) -> &'static str {
        "coordinate"
    }

    fn sort_weight(&self) -> i32 {
        weights::COORDINATE
    }

    async fn intercept(&self, chain: Chain, mut exchange: Exchange) -> ImageResult<Exchange> {
        exchange.transition(RequestState::Coordinating);
        let key = self.scope.flight_key(&exchange);

        let outcome = self
            .coordinator
            .execute(&key, |liveness| {
                let fork = exchange.fork(liveness);
                async move {
                    let finished = chain.proceed(fork).await?;
                    let data = finished.request.data().to_string();
                    let decoded = finished
                        .decoded
                        .ok_or_else(|| ImageError::not_found(data))?;
                    Ok(Outcome {
                        decoded,
                        pin: finished.memory_hold,
                    })
                }
            })
            .await?;

        exchange.decoded = Some(outcome.decoded);
        exchange.memory_hold = outcome.pin;
        Ok(exchange)
    }
}
