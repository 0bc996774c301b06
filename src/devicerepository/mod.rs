//! Payload formatters of end device models, fetched from the Device Repository and
//! cached per model, firmware and band.

pub mod client;
pub mod formatter;
pub mod lpp;

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use nonzero_ext::nonzero;
use tokio::time::Instant;
use tracing::debug;

pub use client::{Client, ClusterClient};
pub use formatter::{Codec, Formatter, FormatterProvider, Providers};

use crate::utils::GsError;

pub const CACHE_SIZE: NonZeroUsize = nonzero!(4096usize);
pub const SUCCESS_TTL: Duration = Duration::from_secs(60 * 60);
pub const FAILURE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum PayloadFormatter {
    None = 0,
    Repository = 1,
    GrpcService = 2,
    Javascript = 3,
    CayenneLpp = 4,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct EndDeviceVersionIdentifiers {
    #[prost(string, tag = "1")]
    pub brand_id: String,
    #[prost(string, tag = "2")]
    pub model_id: String,
    #[prost(string, tag = "3")]
    pub hardware_version: String,
    #[prost(string, tag = "4")]
    pub firmware_version: String,
    #[prost(string, tag = "5")]
    pub band_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GetPayloadFormatterRequest {
    #[prost(message, optional, tag = "1")]
    pub version_ids: Option<EndDeviceVersionIdentifiers>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MessagePayloadFormatter {
    #[prost(enumeration = "PayloadFormatter", tag = "1")]
    pub formatter: i32,
    #[prost(string, tag = "2")]
    pub formatter_parameter: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecType {
    UplinkDecoder,
    DownlinkDecoder,
    DownlinkEncoder,
}

impl CodecType {
    pub fn as_str(self) -> &'static str {
        match self {
            CodecType::UplinkDecoder => "uplink_decoder",
            CodecType::DownlinkDecoder => "downlink_decoder",
            CodecType::DownlinkEncoder => "downlink_encoder",
        }
    }
}

/// `brand:model:firmware:band:codec`.
pub fn cache_key(ids: &EndDeviceVersionIdentifiers, codec_type: CodecType) -> String {
    format!(
        "{}:{}:{}:{}:{}",
        ids.brand_id,
        ids.model_id,
        ids.firmware_version,
        ids.band_id,
        codec_type.as_str()
    )
}

#[derive(Clone)]
struct Resolved {
    result: Result<Codec, GsError>,
    at: Instant,
}

impl Resolved {
    fn expired(&self, now: Instant) -> bool {
        let ttl = if self.result.is_ok() {
            SUCCESS_TTL
        } else {
            FAILURE_TTL
        };
        now.saturating_duration_since(self.at) >= ttl
    }
}

/// Frequency based cache of codecs in front of a Device Repository client.
///
/// Admission and eviction follow TinyLFU, so a burst of one-off device models does
/// not push out the formatters that are used all the time. Concurrent lookups of one
/// key share a single repository call; failures are cached too, for a shorter time.
pub struct PayloadFormatterCache {
    client: Arc<dyn Client>,
    providers: Providers,
    entries: Cache<String, Resolved>,
}

impl PayloadFormatterCache {
    pub fn new(client: Arc<dyn Client>, providers: Providers) -> Self {
        Self::with_capacity(client, providers, CACHE_SIZE)
    }

    pub fn with_capacity(client: Arc<dyn Client>, providers: Providers, capacity: NonZeroUsize) -> Self {
        Self {
            client,
            providers,
            entries: Cache::builder()
                .max_capacity(capacity.get() as u64)
                .build(),
        }
    }

    async fn fetch(&self, ids: &EndDeviceVersionIdentifiers, codec_type: CodecType) -> Result<Codec, GsError> {
        let formatter = self.client.get_formatter(ids, codec_type).await?;
        self.providers.codec(&formatter)
    }

    /// Returns the codec of `codec_type` for the end device version `ids`.
    ///
    /// # Errors
    ///
    /// Returns the repository or provider error, cached or fresh.
    pub async fn get(&self, ids: &EndDeviceVersionIdentifiers, codec_type: CodecType) -> Result<Codec, GsError> {
        let key = cache_key(ids, codec_type);
        if let Some(resolved) = self.entries.get(&key).await {
            if !resolved.expired(Instant::now()) {
                return resolved.result;
            }
            self.entries.invalidate(&key).await;
        }
        let resolved = self
            .entries
            .get_with(key.clone(), async {
                debug!(%key, "Fetching payload formatter");
                Resolved {
                    result: self.fetch(ids, codec_type).await,
                    at: Instant::now(),
                }
            })
            .await;
        resolved.result
    }

    /// The number of cached codecs, after pending evictions have been applied.
    pub async fn len(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures_util::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingClient {
        calls: AtomicUsize,
        response: Result<MessagePayloadFormatter, GsError>,
    }

    #[async_trait]
    impl Client for CountingClient {
        async fn get_formatter(
            &self,
            _ids: &EndDeviceVersionIdentifiers,
            _codec_type: CodecType,
        ) -> Result<MessagePayloadFormatter, GsError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.response.clone()
        }
    }

    fn lpp() -> MessagePayloadFormatter {
        MessagePayloadFormatter {
            formatter: PayloadFormatter::CayenneLpp as i32,
            formatter_parameter: String::new(),
        }
    }

    fn ids(model: &str) -> EndDeviceVersionIdentifiers {
        EndDeviceVersionIdentifiers {
            brand_id: "acme".into(),
            model_id: model.into(),
            firmware_version: "1.0".into(),
            band_id: "EU_863_870".into(),
            ..Default::default()
        }
    }

    fn cache(response: Result<MessagePayloadFormatter, GsError>) -> (Arc<CountingClient>, PayloadFormatterCache) {
        let client = Arc::new(CountingClient {
            calls: AtomicUsize::new(0),
            response,
        });
        let cache = PayloadFormatterCache::new(client.clone(), Providers::with_defaults());
        (client, cache)
    }

    #[test]
    fn keys() {
        assert_eq!(
            cache_key(&ids("sensor"), CodecType::DownlinkEncoder),
            "acme:sensor:1.0:EU_863_870:downlink_encoder"
        );
    }

    #[tokio::test]
    async fn concurrent_lookups_share_one_call() {
        let (client, cache) = cache(Ok(lpp()));
        let ids = ids("sensor");
        let results = join_all((0..16).map(|_| cache.get(&ids, CodecType::UplinkDecoder))).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);

        cache.get(&ids, CodecType::DownlinkEncoder).await.unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn successes_expire_after_an_hour() {
        let (client, cache) = cache(Ok(lpp()));
        let ids = ids("sensor");
        cache.get(&ids, CodecType::UplinkDecoder).await.unwrap();
        tokio::time::advance(SUCCESS_TTL - Duration::from_secs(1)).await;
        cache.get(&ids, CodecType::UplinkDecoder).await.unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        tokio::time::advance(Duration::from_secs(2)).await;
        cache.get(&ids, CodecType::UplinkDecoder).await.unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_cached_briefly() {
        let (client, cache) = cache(Err(GsError::NotFound("model".into())));
        let ids = ids("unknown");
        assert!(cache.get(&ids, CodecType::UplinkDecoder).await.is_err());
        assert!(cache.get(&ids, CodecType::UplinkDecoder).await.is_err());
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        tokio::time::advance(FAILURE_TTL).await;
        assert!(cache.get(&ids, CodecType::UplinkDecoder).await.is_err());
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn frequent_models_survive_a_scan_of_one_off_models() {
        let client = Arc::new(CountingClient {
            calls: AtomicUsize::new(0),
            response: Ok(lpp()),
        });
        let capacity = nonzero!(16usize);
        let cache = PayloadFormatterCache::with_capacity(client.clone(), Providers::with_defaults(), capacity);
        // Access frequencies are only tracked once the cache is half full.
        for i in 0..8 {
            cache.get(&ids(&format!("fleet-{}", i)), CodecType::UplinkDecoder).await.unwrap();
        }
        cache.len().await;
        cache.len().await;
        for _ in 0..10 {
            cache.get(&ids("popular"), CodecType::UplinkDecoder).await.unwrap();
        }
        cache.len().await;
        assert_eq!(client.calls.load(Ordering::SeqCst), 9);

        for i in 0..32 {
            cache.get(&ids(&format!("rare-{}", i)), CodecType::UplinkDecoder).await.unwrap();
            assert!(cache.len().await <= capacity.get() as u64);
        }
        assert_eq!(client.calls.load(Ordering::SeqCst), 41);

        cache.get(&ids("popular"), CodecType::UplinkDecoder).await.unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 41);
    }
}
