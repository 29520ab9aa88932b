//! Per-source request rate limiting.
//!
//! Every request is fingerprinted by a [`SourceExtractor`] and charged to a
//! token bucket held in a bounded cache. Rates come from a
//! [`RateExtractor`], so they can change per request (per tenant, or as the
//! gateway peer count changes); a cached bucket is retuned in place when
//! the extracted rates differ from its current ones.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::Request;
use moka::sync::Cache;
use parking_lot::Mutex;

use crate::observability::metrics::LimiterMetricManager;
use crate::security::extractors::{AuthSourceExtractor, RateExtractor, SourceExtractor};
use crate::security::token_bucket::TokenBucket;

const MAX_SOURCES: u64 = 65_536;
const SOURCE_IDLE_TTL: Duration = Duration::from_secs(3600);

/// Token buckets keyed by request source.
pub struct SourceLimiter {
    buckets: Cache<String, Arc<Mutex<TokenBucket>>>,
    sources: Arc<dyn SourceExtractor>,
    rates: Arc<dyn RateExtractor>,
    metrics: Option<Arc<dyn LimiterMetricManager>>,
}

impl SourceLimiter {
    pub fn new(
        sources: Option<Arc<dyn SourceExtractor>>,
        rates: Arc<dyn RateExtractor>,
        metrics: Option<Arc<dyn LimiterMetricManager>>,
    ) -> Self {
        Self {
            buckets: Cache::builder()
                .max_capacity(MAX_SOURCES)
                .time_to_idle(SOURCE_IDLE_TTL)
                .build(),
            sources: sources.unwrap_or_else(|| Arc::new(AuthSourceExtractor::default())),
            rates,
            metrics,
        }
    }

    /// Charge one token to the request's source. Extraction failures count
    /// as denials.
    pub fn allow(&self, req: &Request<Body>) -> bool {
        let allowed = self.check(req);

        if let Some(metrics) = &self.metrics {
            if allowed {
                metrics.register_accepted_connection();
            } else {
                metrics.register_limited_connection();
            }
        }

        allowed
    }

    fn check(&self, req: &Request<Body>) -> bool {
        let key = match self.sources.extract_source(req) {
            Ok(key) => key,
            Err(e) => {
                tracing::debug!(error = %e, "Unable to extract request source");
                return false;
            }
        };

        let (rate, burst) = match self.rates.extract_rates(req) {
            Ok(rates) => rates,
            Err(e) => {
                tracing::debug!(error = %e, source = %key, "Unable to extract request rates");
                return false;
            }
        };

        let bucket = self
            .buckets
            .get_with(key.clone(), || Arc::new(Mutex::new(TokenBucket::new(rate, burst))));

        let mut bucket = bucket.lock();
        if bucket.rate() != rate {
            bucket.set_rate(rate);
        }
        if bucket.burst() != burst {
            bucket.set_burst(burst);
        }

        let allowed = bucket.try_acquire();
        if !allowed {
            tracing::debug!(source = %key, rate, burst, "Source rate limit exceeded");
        }
        allowed
    }
}
