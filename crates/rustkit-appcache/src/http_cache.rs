//! HTTP caching helpers for reusing previously stored responses.
//!
//! Implements the parts of RFC 7234 the update job needs:
//! - Cache-Control directives
//! - Freshness lifetime (max-age, Expires, Last-Modified heuristic)
//! - Conditional revalidation headers (ETag, Last-Modified)
//! - Refreshing a stored response from a 304

use std::time::{Duration, SystemTime};

use http::{header, HeaderMap, StatusCode};

use crate::storage::ResponseInfo;

/// Cache-Control directive parser.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    /// max-age in seconds
    pub max_age: Option<u64>,
    /// no-cache (must revalidate)
    pub no_cache: bool,
    /// no-store (don't cache)
    pub no_store: bool,
    /// must-revalidate
    pub must_revalidate: bool,
}

impl CacheControl {
    /// Parse a Cache-Control header value.
    pub fn parse(value: &str) -> Self {
        let mut cc = Self::default();

        for directive in value.split(',') {
            let directive = directive.trim().to_ascii_lowercase();
            let (name, arg) = match directive.split_once('=') {
                Some((name, arg)) => (name.trim(), Some(arg.trim().trim_matches('"'))),
                None => (directive.as_str(), None),
            };

            match name {
                "no-cache" => cc.no_cache = true,
                "no-store" => cc.no_store = true,
                "must-revalidate" => cc.must_revalidate = true,
                "max-age" => cc.max_age = arg.and_then(|a| a.parse().ok()),
                _ => {}
            }
        }

        cc
    }

    /// Merge every Cache-Control header in `headers`.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let joined = headers
            .get_all(header::CACHE_CONTROL)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(",");
        Self::parse(&joined)
    }
}

fn header_date(headers: &HeaderMap, name: header::HeaderName) -> Option<SystemTime> {
    let value = headers.get(name)?.to_str().ok()?;
    httpdate::parse_http_date(value).ok()
}

/// Statuses a heuristic freshness lifetime may be computed for.
fn heuristically_cacheable(status: StatusCode) -> bool {
    matches!(status.as_u16(), 200 | 203 | 206 | 300 | 301 | 410)
}

/// Freshness lifetime of a stored response.
pub fn freshness_lifetime(info: &ResponseInfo) -> Duration {
    let headers = &info.headers;
    let cc = CacheControl::from_headers(headers);
    if cc.no_store || cc.no_cache {
        return Duration::ZERO;
    }
    if let Some(max_age) = cc.max_age {
        return Duration::from_secs(max_age);
    }

    let date = header_date(headers, header::DATE).unwrap_or(info.response_time);

    if let Some(expires) = headers.get(header::EXPIRES) {
        // Invalid Expires means already expired.
        return expires
            .to_str()
            .ok()
            .and_then(|v| httpdate::parse_http_date(v).ok())
            .and_then(|at| at.duration_since(date).ok())
            .unwrap_or(Duration::ZERO);
    }

    if heuristically_cacheable(info.status) {
        if let Some(modified) = header_date(headers, header::LAST_MODIFIED) {
            if let Ok(since) = date.duration_since(modified) {
                return since / 10;
            }
        }
    }

    Duration::ZERO
}

/// Current age of a stored response.
pub fn current_age(info: &ResponseInfo, now: SystemTime) -> Duration {
    let resident = now.duration_since(info.response_time).unwrap_or(Duration::ZERO);
    let age_header = info
        .headers
        .get(header::AGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::ZERO);
    resident + age_header
}

/// Whether a stored response may be copied into a new cache without touching the network.
pub fn can_reuse_without_fetch(info: &ResponseInfo, now: SystemTime) -> bool {
    if info.headers.contains_key(header::VARY) {
        return false;
    }
    let cc = CacheControl::from_headers(&info.headers);
    if cc.no_store || cc.no_cache || cc.must_revalidate {
        return false;
    }
    current_age(info, now) < freshness_lifetime(info)
}

/// Revalidation headers derived from a stored response.
pub fn conditional_headers(info: &ResponseInfo) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(etag) = info.headers.get(header::ETAG) {
        headers.insert(header::IF_NONE_MATCH, etag.clone());
    }
    if let Some(modified) = info.headers.get(header::LAST_MODIFIED) {
        headers.insert(header::IF_MODIFIED_SINCE, modified.clone());
    }
    headers
}

/// Stored response updated by a 304.
///
/// Headers carried by the 304 replace the stored ones, except
/// `Content-Length`, and the response counts as received at `now`.
pub fn refresh_from_not_modified(stored: &ResponseInfo, update: &HeaderMap, now: SystemTime) -> ResponseInfo {
    let mut headers = stored.headers.clone();
    for name in update.keys() {
        if name == header::CONTENT_LENGTH {
            continue;
        }
        headers.remove(name);
        for value in update.get_all(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    ResponseInfo {
        status: stored.status,
        headers,
        response_time: now,
    }
}
