use std::{
    collections::HashMap,
    net::IpAddr,
    num::NonZeroU32,
    sync::Arc,
    time::Duration,
};

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use governor::{
    clock::{Clock, QuantaClock},
    middleware::{NoOpMiddleware, StateInformationMiddleware},
    state::keyed::DashMapStateStore,
    Quota, RateLimiter as GovernorLimiter,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::cluster::auth::VerifiedContext;
use crate::utils::error::GsError;

pub const HEADER_LIMIT: &str = "x-rate-limit-limit";
pub const HEADER_AVAILABLE: &str = "x-rate-limit-available";
pub const HEADER_RESET: &str = "x-rate-limit-reset";
pub const HEADER_RETRY: &str = "x-rate-limit-retry";

/// A named quota bound to one or more resource classes.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Profile {
    pub name: String,
    pub max_per_min: u32,
    /// Bucket depth; defaults to `max_per_min`.
    #[serde(default)]
    pub max_burst: Option<u32>,
    pub associations: Vec<String>,
}

impl Profile {
    pub fn burst(&self) -> u32 {
        self.max_burst.unwrap_or(self.max_per_min)
    }
}

/// The unit of accounting: a key and the classes tried, in order, to find its profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub key: String,
    pub classes: Vec<String>,
}

impl Resource {
    pub fn new(key: impl Into<String>, classes: Vec<String>) -> Self {
        Self {
            key: key.into(),
            classes,
        }
    }

    pub fn accept_mqtt(remote: IpAddr) -> Self {
        Self::new(format!("gs:accept:mqtt:ip:{}", remote), vec!["gs:accept:mqtt".into()])
    }

    pub fn accept_ttigw(remote: IpAddr) -> Self {
        Self::new(format!("gs:accept:ttigw:ip:{}", remote), vec!["gs:accept:ttigw".into()])
    }

    pub fn accept_semtech_ws(remote: IpAddr) -> Self {
        Self::new(
            format!("gs:accept:semtechws/lbslns:ip:{}", remote),
            vec!["gs:accept:semtechws/lbslns".into()],
        )
    }

    /// Uplink traffic of one gateway, shared by all its frontends.
    pub fn gateway_up(gateway_uid: &str) -> Self {
        Self::new(format!("gs:up:gtw:{}", gateway_uid), vec!["gs:up".into()])
    }

    pub fn gateway_udp_traffic(remote: IpAddr) -> Self {
        Self::new(
            format!("gs:up:udp:ip:{}", remote),
            vec!["gs:up:udp".into(), "gs:up".into()],
        )
    }

    pub fn application_down_mqtt(application_uid: &str) -> Self {
        Self::new(format!("as:down:mqtt:app:{}", application_uid), vec!["as:down:mqtt".into()])
    }

    pub fn application_down_web(webhook_uid: &str) -> Self {
        Self::new(format!("as:down:web:{}", webhook_uid), vec!["as:down:web".into()])
    }

    /// An HTTP request on a route template, from a caller.
    pub fn http(class: &str, path_template: &str, caller: &str) -> Self {
        Self::new(
            format!("http:{}:{}:{}", class, path_template, caller),
            vec![
                format!("http:{}:{}", class, path_template),
                format!("http:{}", class),
                "http".into(),
            ],
        )
    }

    pub fn grpc_method(full_method: &str, caller: &str) -> Self {
        Self::grpc("grpc:method", full_method, caller)
    }

    pub fn grpc_stream_accept(full_method: &str, caller: &str) -> Self {
        Self::grpc("grpc:stream:accept", full_method, caller)
    }

    pub fn grpc_stream_up(full_method: &str, caller: &str) -> Self {
        Self::grpc("grpc:stream:up", full_method, caller)
    }

    fn grpc(class: &str, full_method: &str, caller: &str) -> Self {
        Self::new(
            format!("{}:{}:{}", class, full_method, caller),
            vec![format!("{}:{}", class, full_method), class.to_string()],
        )
    }
}

/// The outcome of one rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    pub limited: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Time until the bucket is full again.
    pub reset_after: Duration,
    /// Time until the next request would be allowed; zero unless limited.
    pub retry_after: Duration,
}

impl RateLimitResult {
    /// The result of a check that no profile applies to.
    pub fn unlimited() -> Self {
        Self {
            limited: false,
            limit: 0,
            remaining: 0,
            reset_after: Duration::ZERO,
            retry_after: Duration::ZERO,
        }
    }

    /// Header name and value pairs, with durations rounded up to whole seconds.
    ///
    /// The retry header is only present when the request was limited.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        if self.limit == 0 {
            return Vec::new();
        }
        let mut headers = vec![
            (HEADER_LIMIT, self.limit.to_string()),
            (HEADER_AVAILABLE, self.remaining.to_string()),
            (HEADER_RESET, ceil_secs(self.reset_after).to_string()),
        ];
        if self.limited {
            headers.push((HEADER_RETRY, ceil_secs(self.retry_after).max(1).to_string()));
        }
        headers
    }

    pub fn apply_to_metadata(&self, metadata: &mut tonic::metadata::MetadataMap) {
        for (name, value) in self.headers() {
            if let Ok(value) = value.parse() {
                metadata.insert(name, value);
            }
        }
    }

    pub fn apply_to_headers(&self, headers: &mut HeaderMap) {
        for (name, value) in self.headers() {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(HeaderName::from_static(name), value);
            }
        }
    }

    /// Converts a limited result to an error, passing allowed results through.
    pub fn into_result(self) -> Result<Self, GsError> {
        if self.limited {
            Err(GsError::ResourceExhausted(self))
        } else {
            Ok(self)
        }
    }
}

fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

/// Storage of the per-key buckets of one profile.
pub trait RateLimitStore: Send + Sync {
    /// Consumes one cell for `key`.
    fn check(&self, key: &str) -> Result<RateLimitResult, GsError>;

    /// Drops buckets that are back at full capacity.
    fn compact(&self) {}

    /// Number of tracked keys.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type KeyedLimiter<C> =
    GovernorLimiter<String, DashMapStateStore<String>, C, StateInformationMiddleware>;

/// In-memory GCRA buckets backed by `governor`.
pub struct GovernorStore<C: Clock = QuantaClock> {
    limiter: KeyedLimiter<C>,
    clock: C,
    burst: u32,
    emission_interval: Duration,
}

impl GovernorStore<QuantaClock> {
    pub fn new(profile: &Profile) -> Result<Self, GsError> {
        Self::with_clock(profile, QuantaClock::default())
    }
}

impl<C: Clock> GovernorStore<C> {
    /// Builds the store for `profile`, measuring time with `clock`.
    ///
    /// # Errors
    ///
    /// Returns `GsError::Configuration` if the profile allows zero requests.
    pub fn with_clock(profile: &Profile, clock: C) -> Result<Self, GsError> {
        let per_min = NonZeroU32::new(profile.max_per_min).ok_or_else(|| {
            GsError::Configuration(format!("profile `{}`: max_per_min must be > 0", profile.name))
        })?;
        let burst = NonZeroU32::new(profile.burst()).ok_or_else(|| {
            GsError::Configuration(format!("profile `{}`: max_burst must be > 0", profile.name))
        })?;
        let quota = Quota::per_minute(per_min).allow_burst(burst);
        let limiter = GovernorLimiter::<String, _, C, NoOpMiddleware<C::Instant>>::new(quota, DashMapStateStore::default(), &clock)
            .with_middleware::<StateInformationMiddleware>();
        Ok(Self {
            limiter,
            clock,
            burst: burst.get(),
            emission_interval: Duration::from_secs(60) / per_min.get(),
        })
    }
}

impl<C> RateLimitStore for GovernorStore<C>
where
    C: Clock + Send + Sync,
    C::Instant: Send + Sync,
{
    fn check(&self, key: &str) -> Result<RateLimitResult, GsError> {
        let key = key.to_string();
        match self.limiter.check_key(&key) {
            Ok(snapshot) => {
                let remaining = snapshot.remaining_burst_capacity();
                Ok(RateLimitResult {
                    limited: false,
                    limit: self.burst,
                    remaining,
                    reset_after: self.emission_interval * (self.burst - remaining),
                    retry_after: Duration::ZERO,
                })
            }
            Err(not_until) => Ok(RateLimitResult {
                limited: true,
                limit: self.burst,
                remaining: 0,
                reset_after: self.emission_interval * self.burst,
                retry_after: not_until.wait_time_from(self.clock.now()),
            }),
        }
    }

    fn compact(&self) {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
    }

    fn len(&self) -> usize {
        self.limiter.len()
    }
}

/// Routes resources to the profile of their first configured class.
///
/// Classes without a profile are not limited. All frontends share one instance.
#[derive(Clone, Default)]
pub struct RateLimiter {
    by_class: HashMap<String, (Arc<Profile>, Arc<dyn RateLimitStore>)>,
}

impl RateLimiter {
    /// Builds a limiter with in-memory stores.
    ///
    /// # Errors
    ///
    /// Returns `GsError::Configuration` for profiles with zero quotas or classes claimed
    /// by two profiles.
    pub fn new(profiles: &[Profile]) -> Result<Self, GsError> {
        Self::with_stores(profiles, |profile| {
            Ok(Arc::new(GovernorStore::new(profile)?) as Arc<dyn RateLimitStore>)
        })
    }

    /// Builds a limiter whose stores come from `factory`, one per profile.
    pub fn with_stores<F>(profiles: &[Profile], factory: F) -> Result<Self, GsError>
    where
        F: Fn(&Profile) -> Result<Arc<dyn RateLimitStore>, GsError>,
    {
        let mut by_class = HashMap::new();
        for profile in profiles {
            let store = factory(profile)?;
            let profile = Arc::new(profile.clone());
            for class in &profile.associations {
                if by_class
                    .insert(class.clone(), (profile.clone(), store.clone()))
                    .is_some()
                {
                    return Err(GsError::Configuration(format!(
                        "rate limit class `{}` is associated with more than one profile",
                        class
                    )));
                }
            }
        }
        Ok(Self { by_class })
    }

    /// A limiter that never limits.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Checks `resource` against the profile of its first configured class.
    ///
    /// A failing store limits the request.
    pub fn rate_limit(&self, resource: &Resource) -> RateLimitResult {
        let Some((profile, store)) = resource
            .classes
            .iter()
            .find_map(|class| self.by_class.get(class))
        else {
            return RateLimitResult::unlimited();
        };
        match store.check(&resource.key) {
            Ok(result) => {
                if result.limited {
                    debug!(key = %resource.key, profile = %profile.name, "Rate limited");
                }
                result
            }
            Err(err) => {
                error!(key = %resource.key, profile = %profile.name, error = %err, "Rate limit store failed");
                RateLimitResult {
                    limited: true,
                    limit: profile.burst(),
                    remaining: 0,
                    reset_after: Duration::from_secs(60),
                    retry_after: Duration::from_secs(60),
                }
            }
        }
    }

    /// Like [`rate_limit`](Self::rate_limit), but fails with `ResourceExhausted` when limited.
    pub fn check(&self, resource: &Resource) -> Result<RateLimitResult, GsError> {
        self.rate_limit(resource).into_result()
    }

    /// Checks `resource` unless the caller authenticated as a cluster peer.
    pub fn check_caller(
        &self,
        verified: &VerifiedContext,
        resource: &Resource,
    ) -> Result<RateLimitResult, GsError> {
        if verified.is_cluster_authenticated() {
            return Ok(RateLimitResult::unlimited());
        }
        self.check(resource)
    }

    /// Drops idle buckets from every store.
    pub fn compact(&self) {
        for (_, store) in self.by_class.values() {
            store.compact();
        }
    }

    /// Compacts the stores every `interval` until `token` is cancelled.
    pub fn spawn_compaction(&self, interval: Duration, token: CancellationToken) {
        if self.by_class.is_empty() {
            return;
        }
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => limiter.compact(),
                }
            }
            debug!("Rate limiter compaction stopped");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use governor::clock::FakeRelativeClock;

    fn profile(max_per_min: u32, max_burst: u32, class: &str) -> Profile {
        Profile {
            name: "test".into(),
            max_per_min,
            max_burst: Some(max_burst),
            associations: vec![class.into()],
        }
    }

    #[test]
    fn burst_then_limit() {
        let limiter = RateLimiter::new(&[profile(3, 3, "gs:accept:mqtt")]).unwrap();
        let resource = Resource::accept_mqtt("10.0.0.1".parse().unwrap());
        for i in 0..3 {
            let result = limiter.rate_limit(&resource);
            assert!(!result.limited, "request {} limited", i);
            assert_eq!(result.remaining, 2 - i);
        }
        let result = limiter.rate_limit(&resource);
        assert!(result.limited);
        assert_eq!(result.limit, 3);
        assert!(result.retry_after > Duration::ZERO);

        // Other keys have their own bucket.
        let other = Resource::accept_mqtt("10.0.0.2".parse().unwrap());
        assert!(!limiter.rate_limit(&other).limited);
    }

    #[test]
    fn refills_at_configured_rate() {
        let clock = FakeRelativeClock::default();
        let store = GovernorStore::with_clock(&profile(60, 1, "c"), clock.clone()).unwrap();
        assert!(!store.check("k").unwrap().limited);
        let limited = store.check("k").unwrap();
        assert!(limited.limited);
        assert_eq!(limited.retry_after, Duration::from_secs(1));

        clock.advance(Duration::from_secs(1));
        assert!(!store.check("k").unwrap().limited);
    }

    #[test]
    fn first_configured_class_decides() {
        let limiter = RateLimiter::new(&[
            profile(1, 1, "grpc:stream:up"),
            profile(100, 100, "grpc:stream:up:/ttn.lorawan.v3.GtwGs/LinkGateway"),
        ])
        .unwrap();
        let resource = Resource::grpc_stream_up("/ttn.lorawan.v3.GtwGs/LinkGateway", "gw");
        assert!(!limiter.rate_limit(&resource).limited);
        assert!(!limiter.rate_limit(&resource).limited);

        let generic = Resource::grpc_stream_up("/other.Service/Method", "gw");
        assert!(!limiter.rate_limit(&generic).limited);
        assert!(limiter.rate_limit(&generic).limited);
    }

    #[test]
    fn unconfigured_classes_are_not_limited() {
        let limiter = RateLimiter::disabled();
        for _ in 0..1000 {
            assert!(!limiter.rate_limit(&Resource::gateway_up("gw")).limited);
        }
        assert!(limiter.rate_limit(&Resource::gateway_up("gw")).headers().is_empty());
    }

    struct FailingStore;

    impl RateLimitStore for FailingStore {
        fn check(&self, _key: &str) -> Result<RateLimitResult, GsError> {
            Err(GsError::Unavailable("store offline".into()))
        }

        fn len(&self) -> usize {
            0
        }
    }

    #[test]
    fn store_failure_limits() {
        let limiter = RateLimiter::with_stores(&[profile(10, 10, "gs:up")], |_| {
            Ok(Arc::new(FailingStore) as Arc<dyn RateLimitStore>)
        })
        .unwrap();
        let err = limiter.check(&Resource::gateway_up("gw")).unwrap_err();
        assert!(matches!(err, GsError::ResourceExhausted(_)));
    }

    #[test]
    fn cluster_callers_bypass_limits() {
        let limiter = RateLimiter::new(&[profile(1, 1, "grpc:method")]).unwrap();
        let resource = Resource::grpc_method("/ttn.lorawan.v3.Gs/GetGatewayConnectionStats", "peer");
        let cluster = VerifiedContext::cluster();
        for _ in 0..5 {
            assert!(limiter.check_caller(&cluster, &resource).is_ok());
        }
        let anonymous = VerifiedContext::anonymous();
        assert!(limiter.check_caller(&anonymous, &resource).is_ok());
        assert!(limiter.check_caller(&anonymous, &resource).is_err());
    }

    #[test]
    fn headers_round_seconds_up() {
        let result = RateLimitResult {
            limited: true,
            limit: 3,
            remaining: 0,
            reset_after: Duration::from_millis(59_500),
            retry_after: Duration::from_millis(19_200),
        };
        let headers: HashMap<_, _> = result.headers().into_iter().collect();
        assert_eq!(headers[HEADER_LIMIT], "3");
        assert_eq!(headers[HEADER_AVAILABLE], "0");
        assert_eq!(headers[HEADER_RESET], "60");
        assert_eq!(headers[HEADER_RETRY], "20");

        let mut map = HeaderMap::new();
        result.apply_to_headers(&mut map);
        assert_eq!(map.get(HEADER_RETRY).unwrap(), "20");
    }

    #[test]
    fn resource_keys_follow_conventions() {
        let http = Resource::http("gs", "/api/v3/gs/gateways/{gateway_id}/connection/stats", "1.2.3.4");
        assert_eq!(http.classes.last().unwrap(), "http");
        assert_eq!(http.classes[1], "http:gs");
        let udp = Resource::gateway_udp_traffic("1.2.3.4".parse().unwrap());
        assert_eq!(udp.classes, vec!["gs:up:udp", "gs:up"]);
        assert_eq!(Resource::application_down_web("app/hook").classes, vec!["as:down:web"]);
        assert_eq!(Resource::application_down_mqtt("app").classes, vec!["as:down:mqtt"]);
        assert_eq!(
            Resource::accept_semtech_ws("1.2.3.4".parse().unwrap()).classes,
            vec!["gs:accept:semtechws/lbslns"]
        );
        assert_eq!(Resource::accept_ttigw("::1".parse().unwrap()).classes, vec!["gs:accept:ttigw"]);
    }

    #[test]
    fn compaction_drops_full_buckets() {
        let clock = FakeRelativeClock::default();
        let store = GovernorStore::with_clock(&profile(60, 2, "c"), clock.clone()).unwrap();
        store.check("a").unwrap();
        store.check("b").unwrap();
        assert_eq!(store.len(), 2);
        clock.advance(Duration::from_secs(10));
        store.compact();
        assert_eq!(store.len(), 0);
    }
}
