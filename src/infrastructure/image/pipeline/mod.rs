//! Interceptor pipelines.
//!
//! A chain is an ordered list of interceptors sorted by `sort_weight`. Each
//! interceptor receives the [`Exchange`] and a [`Chain`] positioned at the
//! next stage; it either returns the exchange (ending the chain early) or
//! calls [`Chain::proceed`] and may post-process what comes back.
//!
//! Two chains are built from these stages:
//!
//! - the request-level chain: memory cache, coordination, result-cache
//!   lookup, fetch, download-cache store, decode, transform, result-cache
//!   store, memory store;
//! - the decode-level chain: coordination, fetch, download-cache store,
//!   decode and an opt-in transform stage.

mod coordinate;
mod decode;
mod exchange;
mod fetch;
mod memory;
mod result_cache;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::errors::ImageResult;

pub use coordinate::{CoordinatorInterceptor, FlightScope};
pub use decode::{DecodeInterceptor, TransformInterceptor};
pub use exchange::{Exchange, ImageResponse, Outcome};
pub use fetch::{DownloadCacheInterceptor, FetchInterceptor};
pub use memory::{MemoryCacheInterceptor, MemoryStoreInterceptor};
pub use result_cache::{ResultCacheLookupInterceptor, ResultCacheStoreInterceptor};

/// Sort weights of the built-in stages.
pub mod weights {
    /// Memory cache short-circuit.
    pub const MEMORY_CACHE: i32 = 10;
    /// Single-flight coordination.
    pub const COORDINATE: i32 = 20;
    /// Result cache lookup.
    pub const RESULT_CACHE_LOOKUP: i32 = 30;
    /// Fetch from the download cache, local sources or the network.
    pub const FETCH: i32 = 40;
    /// Download cache population.
    pub const DOWNLOAD_CACHE: i32 = 50;
    /// Decode.
    pub const DECODE: i32 = 60;
    /// Transform.
    pub const TRANSFORM: i32 = 70;
    /// Result cache population.
    pub const RESULT_CACHE_STORE: i32 = 75;
    /// Memory cache population.
    pub const MEMORY_STORE: i32 = 90;
}

/// One stage of a chain.
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Position in the chain; lower runs first.
    fn sort_weight(&self) -> i32;

    /// Handles `exchange`, usually by calling `chain.proceed`.
    async fn intercept(&self, chain: Chain, exchange: Exchange) -> ImageResult<Exchange>;
}

/// The rest of a chain from a given stage onwards.
///
/// Cloning is cheap: the interceptor list is shared and the position is a
/// plain index, so concurrent executions never interfere.
#[derive(Clone)]
pub struct Chain {
    interceptors: Arc<[Arc<dyn Interceptor>]>,
    index: usize,
}

impl Chain {
    /// Builds a chain, ordering interceptors by ascending sort weight.
    ///
    /// Interceptors with equal weights keep their insertion order.
    #[must_use]
    pub fn new(mut interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        interceptors.sort_by_key(|interceptor| interceptor.sort_weight());
        Self {
            interceptors: interceptors.into(),
            index: 0,
        }
    }

    /// Runs the next stage, or returns `exchange` when none is left.
    ///
    /// # Errors
    /// Returns the first error raised by a remaining stage.
    pub async fn proceed(self, exchange: Exchange) -> ImageResult<Exchange> {
        let Some(interceptor) = self.interceptors.get(self.index).cloned() else {
            return Ok(exchange);
        };
        exchange.liveness.check()?;
        let next = Self {
            interceptors: Arc::clone(&self.interceptors),
            index: self.index + 1,
        };
        interceptor.intercept(next, exchange).await
    }

    /// Names of the stages in execution order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    /// Number of stages remaining from this position.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.interceptors.len().saturating_sub(self.index)
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("stages", &self.names())
            .field("index", &self.index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::ImageRequest;
    use crate::domain::errors::ImageError;
    use crate::domain::services::CacheKeyCodec;
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        weight: i32,
        log: Arc<Mutex<Vec<String>>>,
        short_circuit: bool,
    }

    #[async_trait]
    impl Interceptor for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        fn sort_weight(&self) -> i32 {
            self.weight
        }

        async fn intercept(&self, chain: Chain, exchange: Exchange) -> ImageResult<Exchange> {
            self.log.lock().push(format!("enter {}", self.name));
            if self.short_circuit {
                return Ok(exchange);
            }
            let exchange = chain.proceed(exchange).await?;
            self.log.lock().push(format!("leave {}", self.name));
            Ok(exchange)
        }
    }

    struct Failing;

    #[async_trait]
    impl Interceptor for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn sort_weight(&self) -> i32 {
            50
        }

        async fn intercept(&self, _chain: Chain, _exchange: Exchange) -> ImageResult<Exchange> {
            Err(ImageError::decode("boom"))
        }
    }

    fn recorder(
        name: &'static str,
        weight: i32,
        log: &Arc<Mutex<Vec<String>>>,
    ) -> Arc<dyn Interceptor> {
        Arc::new(Recorder {
            name,
            weight,
            log: log.clone(),
            short_circuit: false,
        })
    }

    fn exchange() -> Exchange {
        let request = ImageRequest::new("img://a");
        let keys = CacheKeyCodec::new().keys(&request);
        Exchange::new(request, keys)
    }

    #[tokio::test]
    async fn test_stages_run_in_weight_order_and_unwind() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = Chain::new(vec![
            recorder("c", 30, &log),
            recorder("a", 10, &log),
            recorder("b", 20, &log),
        ]);

        assert_eq!(chain.names(), vec!["a", "b", "c"]);
        chain.proceed(exchange()).await.unwrap();

        assert_eq!(
            *log.lock(),
            vec!["enter a", "enter b", "enter c", "leave c", "leave b", "leave a"]
        );
    }

    #[tokio::test]
    async fn test_equal_weights_keep_insertion_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = Chain::new(vec![recorder("first", 10, &log), recorder("second", 10, &log)]);
        assert_eq!(chain.names(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_short_circuit_skips_rest() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = Chain::new(vec![
            recorder("a", 10, &log),
            Arc::new(Recorder {
                name: "stop",
                weight: 20,
                log: log.clone(),
                short_circuit: true,
            }),
            recorder("never", 30, &log),
        ]);

        chain.proceed(exchange()).await.unwrap();
        assert_eq!(*log.lock(), vec!["enter a", "enter stop", "leave a"]);
    }

    #[tokio::test]
    async fn test_failure_short_circuits_remaining_stages() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = Chain::new(vec![
            recorder("a", 10, &log),
            Arc::new(Failing),
            recorder("never", 90, &log),
        ]);

        let err = chain.proceed(exchange()).await.unwrap_err();
        assert_eq!(err, ImageError::decode("boom"));
        assert_eq!(*log.lock(), vec!["enter a"]);
    }

    #[tokio::test]
    async fn test_cancelled_exchange_stops_before_next_stage() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = Chain::new(vec![recorder("a", 10, &log)]);
        let exchange = exchange();
        exchange.liveness.cancel();

        let err = chain.proceed(exchange).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_executions_share_a_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = Chain::new(vec![recorder("a", 10, &log), recorder("b", 20, &log)]);

        let (first, second) = tokio::join!(
            chain.clone().proceed(exchange()),
            chain.clone().proceed(exchange())
        );
        assert!(first.is_ok() && second.is_ok());
        assert_eq!(log.lock().len(), 8);
        assert_eq!(chain.remaining(), 2);
    }
}
