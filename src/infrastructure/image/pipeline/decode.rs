//! Decode and transform stages.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::{debug, trace};

use super::{Chain, Exchange, Interceptor, weights};
use crate::domain::entities::{DecodeResult, RequestState};
use crate::domain::errors::{ImageError, ImageResult};
use crate::domain::ports::Decoder;

/// Turns fetched bytes into a [`DecodeResult`].
pub struct DecodeInterceptor {
    decoder: Arc<dyn Decoder>,
    permits: Arc<Semaphore>,
}

impl DecodeInterceptor {
    /// Creates the stage; `permits` bounds concurrent decodes.
    #[must_use]
    pub fn new(decoder: Arc<dyn Decoder>, permits: Arc<Semaphore>) -> Self {
        Self { decoder, permits }
    }
}

#[async_trait]
impl Interceptor for DecodeInterceptor {
    fn name(&self) -> &'static str {
        "decode"
    }

    fn sort_weight(&self) -> i32 {
        weights::DECODE
    }

    async fn intercept(&self, chain: Chain, mut exchange: Exchange) -> ImageResult<Exchange> {
        if exchange.decoded.is_some() {
            return chain.proceed(exchange).await;
        }
        let Some(fetched) = exchange.fetched.take() else {
            return Err(ImageError::not_found(exchange.request.data()));
        };

        exchange.transition(RequestState::Decoding);
        let output = {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| ImageError::Cancelled)?;
            exchange.liveness.check()?;
            self.decoder
                .decode(&fetched, exchange.request.options())
                .await?
        };
        debug!(
            data = %exchange.request.data(),
            width = output.metadata.width,
            height = output.metadata.height,
            source = %fetched.data_source,
            "Decoded"
        );
        exchange.decoded = Some(DecodeResult::from_output(output, fetched.data_source));
        chain.proceed(exchange).await
    }
}

/// Applies the request's transformations in order.
///
/// Each transformation produces a new result; the artifact it replaces is
/// never modified. Skipped when the exchange opted out or the result was
/// already transformed.
pub struct TransformInterceptor {
    permits: Arc<Semaphore>,
}

impl TransformInterceptor {
    /// Creates the stage; `permits` is shared with the decode stage.
    #[must_use]
    pub const fn new(permits: Arc<Semaphore>) -> Self {
        Self { permits }
    }
}

#[async_trait]
impl Interceptor for TransformInterceptor {
    fn name(&self) -> &'static str {
        "transform"
    }

    fn sort_weight(&self) -> i32 {
        weights::TRANSFORM
    }

    async fn intercept(&self, chain: Chain, mut exchange: Exchange) -> ImageResult<Exchange> {
        let transformations = exchange.request.options().transformations.clone();
        if !exchange.apply_transformations || exchange.transformed || transformations.is_empty() {
            return chain.proceed(exchange).await;
        }
        let Some(mut current) = exchange.decoded.take() else {
            return chain.proceed(exchange).await;
        };

        exchange.transition(RequestState::Transforming);
        let size = exchange.request.options().size;
        {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| ImageError::Cancelled)?;
            for transformation in &transformations {
                exchange.liveness.check()?;
                let tag = transformation.cache_key();
                match transformation.transform(Arc::clone(&current.image), size).await? {
                    Some(image) => current = current.with_transformed(image, tag),
                    None => trace!(tag = %tag, "Transformation was a no-op"),
                }
            }
        }

        exchange.decoded = Some(current);
        exchange.transformed = true;
        chain.proceed(exchange).await
    }
}
