//! Per-URL render cache.
//!
//! Entries hold the id-stripped HTML body, its MD5 ETag, a monotonic
//! expiry, and the application-declared last-modified time. The embedded
//! runtime generates fresh element ids on every run, so stripping them is
//! what makes the ETag deterministic; the stripped body is both what gets
//! hashed and what gets served.

use std::num::NonZeroUsize;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant, SystemTime};

use lru::LruCache;
use md5::{Digest, Md5};
use regex::Regex;

/// Freshness window applied when the application declares none
/// (an `expiresIn` of zero): 30 days.
pub const DEFAULT_TTL: Duration = Duration::from_millis(2_592_000_000);

/// A cached page.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Id-stripped HTML body.
    pub body: String,
    /// Lowercase hex MD5 digest of `body`.
    pub etag: String,
    /// Monotonic expiry; an entry at or past it is a miss.
    pub expires_at: Instant,
    /// Application-declared last-modified time.
    pub last_modified: Option<SystemTime>,
}

/// Shared render cache, keyed by the full request URL (path + `?` + query).
pub struct RenderCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
}

impl RenderCache {
    /// Create a cache bounded to `capacity` entries, LRU-evicted.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Look up a fresh entry. Expired entries are dropped and report a miss.
    pub fn lookup(&self, key: &str) -> Option<CacheEntry> {
        let mut entries = self.entries.lock().expect("render cache lock poisoned");
        let now = Instant::now();
        match entries.get(key) {
            None => return None,
            Some(entry) if entry.expires_at > now => return Some(entry.clone()),
            Some(_) => {}
        }
        entries.pop(key);
        None
    }

    /// Store a freshly rendered page and return the entry that was stored.
    ///
    /// `expires_in_secs` is the application-declared freshness window;
    /// zero selects [`DEFAULT_TTL`]. `last_modified_secs` is Unix seconds.
    pub fn fill(
        &self,
        key: &str,
        html: &str,
        expires_in_secs: u64,
        last_modified_secs: Option<u64>,
    ) -> CacheEntry {
        let ttl = if expires_in_secs == 0 {
            DEFAULT_TTL
        } else {
            Duration::from_secs(expires_in_secs)
        };
        self.fill_with_ttl(key, html, ttl, last_modified_secs)
    }

    fn fill_with_ttl(
        &self,
        key: &str,
        html: &str,
        ttl: Duration,
        last_modified_secs: Option<u64>,
    ) -> CacheEntry {
        let body = strip_element_ids(html);
        let etag = etag_for(&body);
        let entry = CacheEntry {
            body,
            etag,
            expires_at: Instant::now() + ttl,
            last_modified: last_modified_secs
                .map(|secs| SystemTime::UNIX_EPOCH + Duration::from_secs(secs)),
        };
        self.entries
            .lock()
            .expect("render cache lock poisoned")
            .put(key.to_owned(), entry.clone());
        entry
    }

    /// Number of cached entries, fresh or not.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .expect("render cache lock poisoned")
            .len()
    }

    /// Returns `true` when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Remove all whitespace-delimited `id="…"` / `id='…'` attributes.
///
/// The embedded runtime assigns non-deterministic element ids per run;
/// stripping them yields a stable fingerprint for the same semantic
/// content.
pub fn strip_element_ids(html: &str) -> String {
    static ID_ATTRIBUTE: OnceLock<Regex> = OnceLock::new();
    let pattern = ID_ATTRIBUTE.get_or_init(|| {
        Regex::new(r#"\s+id=("[^"]*"|'[^']*')"#).expect("id attribute pattern is valid")
    });
    pattern.replace_all(html, "").into_owned()
}

/// Lowercase hex MD5 digest of a body.
pub fn etag_for(body: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(body.as_bytes());
    hex::encode(hasher.finalize())
}

/// Evaluate the client's preconditions against an entry.
///
/// Returns `true` when a 304 short-circuit applies: the `If-None-Match`
/// header names the entry's ETag (quotes and `*` respected), or the entry
/// was last modified at or before the `If-Modified-Since` date.
pub fn precondition_matches(
    entry: &CacheEntry,
    if_none_match: Option<&str>,
    if_modified_since: Option<SystemTime>,
) -> bool {
    if let Some(raw) = if_none_match {
        let matched = raw
            .split(',')
            .map(str::trim)
            .any(|candidate| candidate == "*" || candidate.trim_matches('"') == entry.etag);
        if matched {
            return true;
        }
    }
    if let (Some(since), Some(last_modified)) = (if_modified_since, entry.last_modified) {
        if last_modified <= since {
            return true;
        }
    }
    false
}
