//! HTTP cache.
//!
//! RFC 7234-shaped caching keyed by (method, normalized URL, the request
//! header values named by the response's Vary). The in-memory index is
//! authoritative; the disk backend (when enabled) is write-through
//! persistence restored at engine build. Size is a soft budget: an
//! insert may briefly exceed it before eviction catches up.

pub mod disk;
pub mod http_date;

use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use url::Url;

/// Cache behavior selected at engine build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    #[default]
    Disabled,
    InMemory,
    /// Metadata and bodies persisted under `httpcache/`.
    Disk,
    /// Storage path is used for other engine state, but HTTP responses
    /// are not cached.
    DiskNoHttp,
}

impl CacheMode {
    fn caches_responses(&self) -> bool {
        matches!(self, CacheMode::InMemory | CacheMode::Disk)
    }
}

/// Primary cache key: method plus URL without fragment.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct CacheKey {
    pub(crate) url: String,
    pub(crate) method: String,
}

impl CacheKey {
    pub fn new(url: &Url, method: &str) -> Self {
        let mut url_str = url.to_string();
        if let Some(pos) = url_str.find('#') {
            url_str.truncate(pos);
        }
        Self {
            url: url_str,
            method: method.to_uppercase(),
        }
    }
}

/// Cached response entry.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CacheEntry {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(with = "body_bytes")]
    pub body: Bytes,
    /// Wall-clock store time (unix seconds); survives restarts.
    pub stored_at: u64,
    /// Freshness lifetime from max-age or Expires. `None` = never fresh,
    /// kept only for its validators.
    pub ttl_secs: Option<u64>,
    /// Extra staleness window during which serving is allowed while a
    /// revalidation runs in the background.
    pub stale_while_revalidate_secs: Option<u64>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// Request-header (name, value) pairs the response varies on.
    pub vary: Vec<(String, String)>,
}

mod body_bytes {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_bytes(body)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Bytes, D::Error> {
        let v = Vec::<u8>::deserialize(de)?;
        Ok(Bytes::from(v))
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl CacheEntry {
    pub fn is_fresh(&self) -> bool {
        match self.ttl_secs {
            Some(ttl) => unix_now() < self.stored_at + ttl,
            None => false,
        }
    }

    /// Stale but inside the stale-while-revalidate window.
    pub fn serve_stale_while_revalidating(&self) -> bool {
        if self.is_fresh() {
            return false;
        }
        match (self.ttl_secs, self.stale_while_revalidate_secs) {
            (Some(ttl), Some(swr)) => unix_now() < self.stored_at + ttl + swr,
            _ => false,
        }
    }

    pub fn has_validators(&self) -> bool {
        self.etag.is_some() || self.last_modified.is_some()
    }

    /// Conditional request headers derived from the validators.
    pub fn conditional_headers(&self) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        if let Some(etag) = &self.etag {
            headers.push(("if-none-match".to_string(), etag.clone()));
        }
        if let Some(lm) = &self.last_modified {
            headers.push(("if-modified-since".to_string(), lm.clone()));
        }
        headers
    }

    fn matches_vary(&self, request_headers: &[(String, String)]) -> bool {
        self.vary.iter().all(|(name, stored_value)| {
            let current = request_headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
                .unwrap_or("");
            current == stored_value
        })
    }
}

/// Outcome of a cache lookup.
#[derive(Debug)]
pub enum CacheLookup {
    /// Entry is fresh; serve it without touching the network.
    Fresh(CacheEntry),
    /// Entry is within its stale-while-revalidate window: serve it and
    /// refresh in the background.
    StaleWhileRevalidate(CacheEntry),
    /// Entry is stale; revalidate with the included conditional headers.
    Stale(CacheEntry),
    Miss,
}

struct Slot {
    entry: CacheEntry,
    last_used: Instant,
    sequence: u64,
}

/// Engine-wide HTTP cache.
pub struct HttpCache {
    mode: CacheMode,
    entries: DashMap<CacheKey, Slot>,
    current_size: AtomicUsize,
    max_size_bytes: usize,
    clock: AtomicU64,
    disk: Option<Arc<disk::DiskBackend>>,
}

impl HttpCache {
    /// Open the cache. For disk modes the backend takes an exclusive
    /// lock on the cache directory; a second engine on the same path is
    /// refused.
    pub fn open(
        mode: CacheMode,
        max_size_bytes: usize,
        storage_path: Option<&std::path::Path>,
    ) -> Result<Self, crate::base::neterror::NetError> {
        let disk = match (mode, storage_path) {
            (CacheMode::Disk, Some(path)) | (CacheMode::DiskNoHttp, Some(path)) => {
                Some(Arc::new(disk::DiskBackend::open(path)?))
            }
            (CacheMode::Disk, None) | (CacheMode::DiskNoHttp, None) => {
                return Err(crate::base::neterror::NetError::InvalidArgument(
                    "disk cache mode requires a storage path".into(),
                ))
            }
            _ => None,
        };

        let cache = Self {
            mode,
            entries: DashMap::new(),
            current_size: AtomicUsize::new(0),
            max_size_bytes: if max_size_bytes == 0 {
                50 * 1024 * 1024
            } else {
                max_size_bytes
            },
            clock: AtomicU64::new(0),
            disk,
        };

        if cache.mode == CacheMode::Disk {
            if let Some(disk) = &cache.disk {
                for (key, entry) in disk.load_all() {
                    let size = entry.body.len();
                    cache.insert_slot(key, entry);
                    cache.current_size.fetch_add(size, Ordering::Relaxed);
                }
            }
        }
        Ok(cache)
    }

    /// In-memory cache with default budget, for tests and IN_MEMORY mode.
    pub fn in_memory(max_size_bytes: usize) -> Self {
        Self::open(CacheMode::InMemory, max_size_bytes, None).expect("in-memory cache")
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    /// Look up a response for (method, url) under the given request
    /// headers (Vary comparison).
    pub fn lookup(
        &self,
        url: &Url,
        method: &str,
        request_headers: &[(String, String)],
    ) -> CacheLookup {
        if !self.mode.caches_responses() || !is_cacheable_method(method) {
            return CacheLookup::Miss;
        }
        let key = CacheKey::new(url, method);
        let Some(mut slot) = self.entries.get_mut(&key) else {
            return CacheLookup::Miss;
        };
        if !slot.entry.matches_vary(request_headers) {
            return CacheLookup::Miss;
        }
        slot.last_used = Instant::now();
        let entry = slot.entry.clone();
        drop(slot);

        if entry.is_fresh() {
            CacheLookup::Fresh(entry)
        } else if entry.serve_stale_while_revalidating() {
            CacheLookup::StaleWhileRevalidate(entry)
        } else if entry.has_validators() {
            CacheLookup::Stale(entry)
        } else {
            // Nothing to validate with; the entry is dead weight.
            self.remove(url, method);
            CacheLookup::Miss
        }
    }

    /// Store a response. Respects no-store/no-cache and the method/status
    /// gates; keys the Vary'd request headers into the entry.
    pub fn store(
        &self,
        url: &Url,
        method: &str,
        request_headers: &[(String, String)],
        status: u16,
        response_headers: &[(String, String)],
        body: Bytes,
    ) {
        if !self.mode.caches_responses() || !is_cacheable_method(method) {
            return;
        }
        if !(200..300).contains(&status) && status != 304 {
            return;
        }

        let cc = parse_cache_control(response_headers);
        if cc.no_store {
            return;
        }

        let ttl_secs = freshness_lifetime(&cc, response_headers);
        if ttl_secs.is_none() && cc.no_cache {
            return;
        }

        let vary = vary_headers(response_headers, request_headers);
        // `Vary: *` is never cacheable.
        if vary.iter().any(|(n, _)| n == "*") {
            return;
        }

        let entry = CacheEntry {
            status,
            headers: response_headers.to_vec(),
            body: body.clone(),
            stored_at: unix_now(),
            ttl_secs,
            stale_while_revalidate_secs: cc.stale_while_revalidate,
            etag: header_value(response_headers, "etag"),
            last_modified: header_value(response_headers, "last-modified"),
            vary,
        };

        self.evict_for(body.len());

        let key = CacheKey::new(url, method);
        if let Some(disk) = &self.disk {
            if self.mode == CacheMode::Disk {
                disk.store(&key, &entry);
            }
        }
        self.current_size.fetch_add(body.len(), Ordering::Relaxed);
        if let Some(old) = self.insert_slot(key, entry) {
            self.current_size.fetch_sub(old.body.len(), Ordering::Relaxed);
        }
    }

    /// Merge a 304 into the stored entry: refresh TTL and update the
    /// validator/caching headers. Returns the refreshed entry.
    pub fn update_from_not_modified(
        &self,
        url: &Url,
        method: &str,
        response_headers: &[(String, String)],
    ) -> Option<CacheEntry> {
        let key = CacheKey::new(url, method);
        let mut slot = self.entries.get_mut(&key)?;

        for name in ["cache-control", "etag", "expires", "date", "last-modified"] {
            if let Some(value) = header_value(response_headers, name) {
                if let Some(existing) = slot
                    .entry
                    .headers
                    .iter_mut()
                    .find(|(n, _)| n.eq_ignore_ascii_case(name))
                {
                    existing.1 = value;
                } else {
                    slot.entry.headers.push((name.to_string(), value));
                }
            }
        }

        let cc = parse_cache_control(response_headers);
        if let Some(ttl) = freshness_lifetime(&cc, response_headers) {
            slot.entry.ttl_secs = Some(ttl);
        }
        slot.entry.stored_at = unix_now();
        if let Some(etag) = header_value(response_headers, "etag") {
            slot.entry.etag = Some(etag);
        }
        let entry = slot.entry.clone();
        drop(slot);

        if let Some(disk) = &self.disk {
            if self.mode == CacheMode::Disk {
                disk.store(&key, &entry);
            }
        }
        Some(entry)
    }

    pub fn remove(&self, url: &Url, method: &str) {
        let key = CacheKey::new(url, method);
        if let Some((_, slot)) = self.entries.remove(&key) {
            self.current_size
                .fetch_sub(slot.entry.body.len(), Ordering::Relaxed);
        }
        if let Some(disk) = &self.disk {
            disk.remove(&key);
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.current_size.store(0, Ordering::Relaxed);
        if let Some(disk) = &self.disk {
            disk.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.current_size.load(Ordering::Relaxed)
    }

    /// Release the disk lock. Called from engine shutdown.
    pub fn close(&self) {
        if let Some(disk) = &self.disk {
            disk.close();
        }
    }

    fn insert_slot(&self, key: CacheKey, entry: CacheEntry) -> Option<CacheEntry> {
        let sequence = self.clock.fetch_add(1, Ordering::Relaxed);
        self.entries
            .insert(
                key,
                Slot {
                    entry,
                    last_used: Instant::now(),
                    sequence,
                },
            )
            .map(|old| old.entry)
    }

    fn evict_for(&self, incoming: usize) {
        while self.current_size.load(Ordering::Relaxed) + incoming > self.max_size_bytes
            && !self.entries.is_empty()
        {
            let mut victim: Option<(CacheKey, Instant, u64)> = None;
            for slot in self.entries.iter() {
                let candidate = (
                    slot.key().clone(),
                    slot.value().last_used,
                    slot.value().sequence,
                );
                let replace = match &victim {
                    None => true,
                    Some((_, used, seq)) => {
                        candidate.1 < *used || (candidate.1 == *used && candidate.2 < *seq)
                    }
                };
                if replace {
                    victim = Some(candidate);
                }
            }
            match victim {
                Some((key, _, _)) => {
                    if let Some((_, slot)) = self.entries.remove(&key) {
                        self.current_size
                            .fetch_sub(slot.entry.body.len(), Ordering::Relaxed);
                    }
                    if let Some(disk) = &self.disk {
                        disk.remove(&key);
                    }
                }
                None => break,
            }
        }
    }
}

fn is_cacheable_method(method: &str) -> bool {
    method.eq_ignore_ascii_case("GET") || method.eq_ignore_ascii_case("HEAD")
}

fn header_value(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.clone())
}

/// The request header values named by the response's Vary header.
fn vary_headers(
    response_headers: &[(String, String)],
    request_headers: &[(String, String)],
) -> Vec<(String, String)> {
    let Some(vary) = header_value(response_headers, "vary") else {
        return Vec::new();
    };
    vary.split(',')
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .map(|name| {
            let value = request_headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(&name))
                .map(|(_, v)| v.clone())
                .unwrap_or_default();
            (name, value)
        })
        .collect()
}

/// Parsed Cache-Control directives.
#[derive(Debug, Default)]
struct CacheControl {
    no_store: bool,
    no_cache: bool,
    max_age: Option<u64>,
    stale_while_revalidate: Option<u64>,
}

fn parse_cache_control(headers: &[(String, String)]) -> CacheControl {
    let mut cc = CacheControl::default();
    let Some(value) = header_value(headers, "cache-control") else {
        return cc;
    };

    for directive in value.split(',') {
        let directive = directive.trim().to_lowercase();
        if directive == "no-store" {
            cc.no_store = true;
        } else if directive == "no-cache" {
            cc.no_cache = true;
        } else if let Some(age) = directive.strip_prefix("max-age=") {
            cc.max_age = age.parse().ok();
        } else if let Some(swr) = directive.strip_prefix("stale-while-revalidate=") {
            cc.stale_while_revalidate = swr.parse().ok();
        }
    }
    cc
}

/// max-age wins; otherwise Expires - Date when both parse.
fn freshness_lifetime(cc: &CacheControl, headers: &[(String, String)]) -> Option<u64> {
    if let Some(max_age) = cc.max_age {
        return Some(max_age);
    }
    let expires = http_date::parse_http_date(&header_value(headers, "expires")?)?;
    let date = http_date::parse_http_date(&header_value(headers, "date")?)?;
    let lifetime = expires - date;
    if lifetime.is_positive() {
        Some(lifetime.whole_seconds() as u64)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(path: &str) -> Url {
        Url::parse(&format!("https://example.com{path}")).unwrap()
    }

    fn headers(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_store_and_fresh_lookup() {
        let cache = HttpCache::in_memory(0);
        let url = url("/page");
        cache.store(
            &url,
            "GET",
            &[],
            200,
            &headers(&[("cache-control", "max-age=3600")]),
            Bytes::from("hello"),
        );

        match cache.lookup(&url, "GET", &[]) {
            CacheLookup::Fresh(entry) => {
                assert_eq!(entry.body, Bytes::from("hello"));
                assert_eq!(entry.status, 200);
            }
            other => panic!("expected fresh hit, got {other:?}"),
        }
    }

    #[test]
    fn test_no_store_not_cached() {
        let cache = HttpCache::in_memory(0);
        let url = url("/secret");
        cache.store(
            &url,
            "GET",
            &[],
            200,
            &headers(&[("cache-control", "no-store")]),
            Bytes::from("secret"),
        );
        assert!(matches!(cache.lookup(&url, "GET", &[]), CacheLookup::Miss));
    }

    #[test]
    fn test_post_not_cached() {
        let cache = HttpCache::in_memory(0);
        let url = url("/api");
        cache.store(
            &url,
            "POST",
            &[],
            200,
            &headers(&[("cache-control", "max-age=3600")]),
            Bytes::from("data"),
        );
        assert!(matches!(cache.lookup(&url, "POST", &[]), CacheLookup::Miss));
    }

    #[test]
    fn test_stale_entry_offers_validators() {
        let cache = HttpCache::in_memory(0);
        let url = url("/resource");
        cache.store(
            &url,
            "GET",
            &[],
            200,
            &headers(&[("cache-control", "max-age=0"), ("etag", "\"abc123\"")]),
            Bytes::from("body"),
        );

        match cache.lookup(&url, "GET", &[]) {
            CacheLookup::Stale(entry) => {
                let conditional = entry.conditional_headers();
                assert!(conditional
                    .iter()
                    .any(|(n, v)| n == "if-none-match" && v == "\"abc123\""));
            }
            other => panic!("expected stale, got {other:?}"),
        }
    }

    #[test]
    fn test_stale_while_revalidate_window() {
        let cache = HttpCache::in_memory(0);
        let url = url("/swr");
        cache.store(
            &url,
            "GET",
            &[],
            200,
            &headers(&[("cache-control", "max-age=0, stale-while-revalidate=60")]),
            Bytes::from("swr-body"),
        );

        match cache.lookup(&url, "GET", &[]) {
            CacheLookup::StaleWhileRevalidate(entry) => {
                assert_eq!(entry.body, Bytes::from("swr-body"));
            }
            other => panic!("expected stale-while-revalidate, got {other:?}"),
        }
    }

    #[test]
    fn test_vary_mismatch_is_miss() {
        let cache = HttpCache::in_memory(0);
        let url = url("/vary");
        cache.store(
            &url,
            "GET",
            &headers(&[("accept-encoding", "br")]),
            200,
            &headers(&[("cache-control", "max-age=3600"), ("vary", "Accept-Encoding")]),
            Bytes::from("brotli"),
        );

        // Same Vary'd value hits.
        assert!(matches!(
            cache.lookup(&url, "GET", &headers(&[("accept-encoding", "br")])),
            CacheLookup::Fresh(_)
        ));
        // Different value misses.
        assert!(matches!(
            cache.lookup(&url, "GET", &headers(&[("accept-encoding", "gzip")])),
            CacheLookup::Miss
        ));
    }

    #[test]
    fn test_not_modified_refreshes_entry() {
        let cache = HttpCache::in_memory(0);
        let url = url("/revalidated");
        cache.store(
            &url,
            "GET",
            &[],
            200,
            &headers(&[("cache-control", "max-age=0"), ("etag", "\"v1\"")]),
            Bytes::from("body-v1"),
        );

        let refreshed = cache
            .update_from_not_modified(
                &url,
                "GET",
                &headers(&[("cache-control", "max-age=3600"), ("etag", "\"v2\"")]),
            )
            .unwrap();
        assert_eq!(refreshed.etag.as_deref(), Some("\"v2\""));
        assert!(refreshed.is_fresh());
        assert_eq!(refreshed.body, Bytes::from("body-v1"), "body survives the merge");

        assert!(matches!(cache.lookup(&url, "GET", &[]), CacheLookup::Fresh(_)));
    }

    #[test]
    fn test_size_budget_evicts_lru() {
        let cache = HttpCache::in_memory(10);
        let first = url("/a");
        let second = url("/b");
        cache.store(
            &first,
            "GET",
            &[],
            200,
            &headers(&[("cache-control", "max-age=60")]),
            Bytes::from("aaaaaa"),
        );
        cache.store(
            &second,
            "GET",
            &[],
            200,
            &headers(&[("cache-control", "max-age=60")]),
            Bytes::from("bbbbbb"),
        );

        assert!(cache.size_bytes() <= 10);
        assert!(matches!(cache.lookup(&first, "GET", &[]), CacheLookup::Miss));
        assert!(matches!(cache.lookup(&second, "GET", &[]), CacheLookup::Fresh(_)));
    }

    #[test]
    fn test_disabled_mode() {
        let cache = HttpCache::open(CacheMode::Disabled, 0, None).unwrap();
        let url = url("/x");
        cache.store(
            &url,
            "GET",
            &[],
            200,
            &headers(&[("cache-control", "max-age=60")]),
            Bytes::from("x"),
        );
        assert!(matches!(cache.lookup(&url, "GET", &[]), CacheLookup::Miss));
    }

    #[test]
    fn test_expires_header_freshness() {
        let cc = CacheControl::default();
        let lifetime = freshness_lifetime(
            &cc,
            &headers(&[
                ("date", "Wed, 21 Oct 2015 07:28:00 GMT"),
                ("expires", "Wed, 21 Oct 2015 08:28:00 GMT"),
            ]),
        );
        assert_eq!(lifetime, Some(3600));
    }
}
