//! Geolocation lookup and its process-lifetime cache.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::OnceCell;

use crate::error::{TelemetryError, TelemetryResult};

const UNKNOWN: &str = "Unknown";

/// Where the visitor appears to be.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoData {
    pub country: String,
    pub city: String,
    pub region: String,
    pub timezone: String,
    pub isp: String,
}

impl GeoData {
    /// The fixed fallback used whenever the lookup fails.
    pub fn unknown() -> Self {
        Self {
            country: UNKNOWN.to_string(),
            city: UNKNOWN.to_string(),
            region: UNKNOWN.to_string(),
            timezone: UNKNOWN.to_string(),
            isp: UNKNOWN.to_string(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        *self == Self::unknown()
    }
}

/// Third-party lookup keyed by the caller's IP.
#[trait_variant::make(Send)]
pub trait GeoResolver: Send + Sync {
    async fn lookup(&self) -> TelemetryResult<GeoData>;
}

/// Response body of the lookup service.
#[derive(Debug, Default, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    country_name: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    timezone: Option<String>,
    #[serde(default)]
    org: Option<String>,
}

impl From<LookupResponse> for GeoData {
    fn from(response: LookupResponse) -> Self {
        let or_unknown = |value: Option<String>| value.unwrap_or_else(|| UNKNOWN.to_string());
        Self {
            country: or_unknown(response.country_name),
            city: or_unknown(response.city),
            region: or_unknown(response.region),
            timezone: or_unknown(response.timezone),
            isp: or_unknown(response.org),
        }
    }
}

/// [`GeoResolver`] issuing a single HTTP GET.
#[derive(Debug, Clone)]
pub struct HttpGeoResolver {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpGeoResolver {
    pub fn new(endpoint: &str, timeout: Duration) -> TelemetryResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TelemetryError::Config(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl GeoResolver for HttpGeoResolver {
    async fn lookup(&self) -> TelemetryResult<GeoData> {
        let response = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|e| TelemetryError::Geolocation(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TelemetryError::Geolocation(format!("lookup returned {}", status)));
        }

        let body: LookupResponse = response
            .json()
            .await
            .map_err(|e| TelemetryError::Geolocation(format!("failed to parse response: {}", e)))?;
        Ok(body.into())
    }
}

/// Memoizes the first lookup result, success or fallback, for the lifetime
/// of the cache. Concurrent first callers share one lookup.
#[derive(Debug)]
pub struct GeolocationCache<R> {
    resolver: R,
    timeout: Duration,
    cell: OnceCell<GeoData>,
}

impl<R: GeoResolver> GeolocationCache<R> {
    pub fn new(resolver: R, timeout: Duration) -> Self {
        Self {
            resolver,
            timeout,
            cell: OnceCell::new(),
        }
    }

    /// Resolve (once) and return the visitor's location. Never fails.
    pub async fn get(&self) -> GeoData {
        self.cell.get_or_init(|| self.resolve()).await.clone()
    }

    /// The memoized value, if a lookup has completed.
    pub fn cached(&self) -> Option<&GeoData> {
        self.cell.get()
    }

    async fn resolve(&self) -> GeoData {
        match tokio::time::timeout(self.timeout, self.resolver.lookup()).await {
            Ok(Ok(geo)) => {
                tracing::debug!(country = %geo.country, "Geolocation resolved");
                geo
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Geolocation unavailable, using fallback");
                GeoData::unknown()
            }
            Err(_) => {
                tracing::warn!(timeout = ?self.timeout, "Geolocation lookup timed out, using fallback");
                GeoData::unknown()
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Scripted resolver counting its calls.
    #[derive(Debug, Clone)]
    pub(crate) struct FakeResolver {
        pub calls: Arc<AtomicUsize>,
        pub result: Option<GeoData>,
        pub delay: Duration,
    }

    impl FakeResolver {
        pub fn ok(geo: GeoData) -> Self {
            Self { calls: Arc::new(AtomicUsize::new(0)), result: Some(geo), delay: Duration::ZERO }
        }

        pub fn failing() -> Self {
            Self { calls: Arc::new(AtomicUsize::new(0)), result: None, delay: Duration::ZERO }
        }

        pub fn slow(delay: Duration) -> Self {
            Self { delay, ..Self::ok(oslo()) }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl GeoResolver for FakeResolver {
        async fn lookup(&self) -> TelemetryResult<GeoData> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.result
                .clone()
                .ok_or_else(|| TelemetryError::Geolocation("lookup returned 503".to_string()))
        }
    }

    pub(crate) fn oslo() -> GeoData {
        GeoData {
            country: "Norway".to_string(),
            city: "Oslo".to_string(),
            region: "Oslo".to_string(),
            timezone: "Europe/Oslo".to_string(),
            isp: "Telenor".to_string(),
        }
    }

    #[test]
    fn test_unknown_fallback() {
        let geo = GeoData::unknown();
        assert!(geo.is_unknown());
        assert_eq!(geo.country, "Unknown");
        assert_eq!(geo.isp, "Unknown");
        assert!(!oslo().is_unknown());
    }

    #[test]
    fn test_lookup_response_mapping() {
        let body: LookupResponse = serde_json::from_str(
            r#"{"ip":"1.2.3.4","country_name":"Norway","city":"Oslo","region":"Oslo","timezone":"Europe/Oslo","org":"Telenor"}"#,
        )
        .unwrap();
        assert_eq!(GeoData::from(body), oslo());

        let partial: LookupResponse = serde_json::from_str(r#"{"country_name":"Norway"}"#).unwrap();
        let geo = GeoData::from(partial);
        assert_eq!(geo.country, "Norway");
        assert_eq!(geo.city, "Unknown");
    }

    #[tokio::test]
    async fn test_cache_memoizes_success() {
        let resolver = FakeResolver::ok(oslo());
        let cache = GeolocationCache::new(resolver.clone(), Duration::from_secs(2));
        assert!(cache.cached().is_none());

        assert_eq!(cache.get().await, oslo());
        assert_eq!(cache.get().await, oslo());
        assert_eq!(resolver.call_count(), 1);
        assert_eq!(cache.cached(), Some(&oslo()));
    }

    #[tokio::test]
    async fn test_cache_memoizes_failure() {
        let resolver = FakeResolver::failing();
        let cache = GeolocationCache::new(resolver.clone(), Duration::from_secs(2));

        assert!(cache.get().await.is_unknown());
        assert!(cache.get().await.is_unknown());
        assert_eq!(resolver.call_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_calls_share_one_lookup() {
        let resolver = FakeResolver::slow(Duration::from_millis(20));
        let cache = GeolocationCache::new(resolver.clone(), Duration::from_secs(2));

        let (a, b, c) = tokio::join!(cache.get(), cache.get(), cache.get());
        assert_eq!(a, oslo());
        assert_eq!(b, a);
        assert_eq!(c, a);
        assert_eq!(resolver.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_timeout_falls_back() {
        let resolver = FakeResolver::slow(Duration::from_secs(10));
        let cache = GeolocationCache::new(resolver.clone(), Duration::from_secs(2));

        let started = tokio::time::Instant::now();
        let geo = cache.get().await;
        assert!(geo.is_unknown());
        assert!(started.elapsed() < Duration::from_secs(3));

        // The timed-out result is cached too.
        assert!(cache.get().await.is_unknown());
        assert_eq!(resolver.call_count(), 1);
    }

    #[tokio::test]
    async fn test_http_resolver_unreachable_endpoint_falls_back() {
        let resolver =
            HttpGeoResolver::new("http://127.0.0.1:9/json/", Duration::from_millis(500)).unwrap();
        assert_eq!(resolver.endpoint(), "http://127.0.0.1:9/json/");

        let cache = GeolocationCache::new(resolver, Duration::from_secs(2));
        assert!(cache.get().await.is_unknown());
    }
}
