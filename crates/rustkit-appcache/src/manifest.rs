//! Cache manifest parsing.
//!
//! A manifest is line oriented:
//!
//! ```text
//! CACHE MANIFEST
//! # v42
//! CACHE:
//! /app.js
//! NETWORK:
//! *
//! FALLBACK:
//! /pages/ /offline.html
//! ```
//!
//! Malformed lines are skipped. Only a missing signature fails the parse.
//! "Unchanged" checks compare raw bytes through [`Fingerprint`], never the
//! parsed structure.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;
use url::Url;

use rustkit_net::same_origin;

const SIGNATURE: &str = "CACHE MANIFEST";
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";
const PATTERN_FLAG: &str = "isPattern";

/// Manifest parse errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    #[error("Invalid manifest signature")]
    InvalidSignature,
}

/// How permissive the parser is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParseMode {
    /// Standard syntax only.
    #[default]
    PerStandard,
    /// Also honor `isPattern` wildcard namespaces.
    AllowDangerousFeatures,
}

/// Kind of namespace entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamespaceType {
    Fallback,
    Intercept,
    Network,
}

/// A namespace from the FALLBACK, NETWORK or CHROMIUM-INTERCEPT sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    pub kind: NamespaceType,
    pub namespace_url: Url,
    /// Fallback or intercept target; `None` for network namespaces.
    pub target_url: Option<Url>,
    /// `*` wildcard pattern instead of a prefix.
    pub is_pattern: bool,
}

impl Namespace {
    fn new(kind: NamespaceType, namespace_url: Url, target_url: Option<Url>, is_pattern: bool) -> Self {
        Self {
            kind,
            namespace_url,
            target_url,
            is_pattern,
        }
    }

    /// Check whether `url` falls inside this namespace.
    pub fn matches(&self, url: &Url) -> bool {
        if self.is_pattern {
            wildcard_match(self.namespace_url.as_str(), url.as_str())
        } else {
            url.as_str().starts_with(self.namespace_url.as_str())
        }
    }
}

/// Glob match where `*` spans any run of characters.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern = pattern.as_bytes();
    let text = text.as_bytes();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            backtrack = Some((p, t));
            p += 1;
        } else if p < pattern.len() && pattern[p] == text[t] {
            p += 1;
            t += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == b'*')
}

/// Raw manifest bytes, kept for byte-for-byte "unchanged" comparisons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint(Bytes);

impl Fingerprint {
    pub fn of(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }

    /// True only for identical bytes.
    pub fn matches(&self, data: &[u8]) -> bool {
        self.0.as_ref() == data
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Parsed manifest.
#[derive(Debug, Clone)]
pub struct Manifest {
    /// CACHE section URLs, in document order, without duplicates.
    pub explicit_urls: Vec<Url>,
    pub fallback_namespaces: Vec<Namespace>,
    pub online_whitelist: Vec<Namespace>,
    /// NETWORK section contained `*`.
    pub online_whitelist_all: bool,
    pub intercept_namespaces: Vec<Namespace>,
    /// SETTINGS section contained `prefer-online`.
    pub prefer_online: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Explicit,
    Fallback,
    Network,
    Intercept,
    Settings,
    Unknown,
}

impl Section {
    fn from_header(line: &str) -> Option<Self> {
        match line {
            "CACHE:" => Some(Section::Explicit),
            "FALLBACK:" => Some(Section::Fallback),
            "NETWORK:" => Some(Section::Network),
            "CHROMIUM-INTERCEPT:" => Some(Section::Intercept),
            "SETTINGS:" => Some(Section::Settings),
            _ if line.ends_with(':') => Some(Section::Unknown),
            _ => None,
        }
    }
}

fn is_manifest_whitespace(c: char) -> bool {
    c == ' ' || c == '\t'
}

impl Manifest {
    /// Parse manifest bytes fetched from `manifest_url`.
    pub fn parse(manifest_url: &Url, data: &[u8], mode: ParseMode) -> Result<Self, ManifestError> {
        let body = data.strip_prefix(UTF8_BOM).unwrap_or(data);
        let text = String::from_utf8_lossy(body);

        let rest = text
            .strip_prefix(SIGNATURE)
            .ok_or(ManifestError::InvalidSignature)?;
        match rest.chars().next() {
            None | Some(' ') | Some('\t') | Some('\r') | Some('\n') => {}
            Some(_) => return Err(ManifestError::InvalidSignature),
        }

        let mut manifest = Manifest {
            explicit_urls: Vec::new(),
            fallback_namespaces: Vec::new(),
            online_whitelist: Vec::new(),
            online_whitelist_all: false,
            intercept_namespaces: Vec::new(),
            prefer_online: false,
        };

        let allow_patterns = mode == ParseMode::AllowDangerousFeatures;
        let mut section = Section::Explicit;

        // The remainder of the signature line is ignored.
        for line in rest.split(['\r', '\n']).skip(1) {
            let line = line.trim_matches(is_manifest_whitespace);
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(next) = Section::from_header(line) {
                section = next;
                continue;
            }

            let mut tokens = line.split(is_manifest_whitespace).filter(|t| !t.is_empty());
            let Some(first) = tokens.next() else {
                continue;
            };

            match section {
                Section::Unknown => {}
                Section::Settings => {
                    if line == "prefer-online" {
                        manifest.prefer_online = true;
                    }
                }
                Section::Explicit => {
                    let Some(url) = resolve(manifest_url, first) else {
                        continue;
                    };
                    if !matches!(url.scheme(), "http" | "https") {
                        continue;
                    }
                    if manifest_url.scheme() == "https" && !same_origin(manifest_url, &url) {
                        trace!(url = %url, "Skipping cross-origin entry in https manifest");
                        continue;
                    }
                    if !manifest.explicit_urls.contains(&url) {
                        manifest.explicit_urls.push(url);
                    }
                }
                Section::Network => {
                    if first == "*" {
                        manifest.online_whitelist_all = true;
                        continue;
                    }
                    let Some(url) = resolve(manifest_url, first) else {
                        continue;
                    };
                    if url.scheme() != manifest_url.scheme() {
                        continue;
                    }
                    let is_pattern = allow_patterns && tokens.next() == Some(PATTERN_FLAG);
                    manifest
                        .online_whitelist
                        .push(Namespace::new(NamespaceType::Network, url, None, is_pattern));
                }
                Section::Fallback => {
                    let Some(namespace) = resolve_same_origin(manifest_url, first) else {
                        continue;
                    };
                    let Some(target) = tokens.next().and_then(|t| resolve_same_origin(manifest_url, t))
                    else {
                        continue;
                    };
                    let is_pattern = allow_patterns && tokens.next() == Some(PATTERN_FLAG);
                    // First mapping for a namespace wins.
                    if manifest
                        .fallback_namespaces
                        .iter()
                        .any(|ns| ns.namespace_url == namespace)
                    {
                        continue;
                    }
                    manifest.fallback_namespaces.push(Namespace::new(
                        NamespaceType::Fallback,
                        namespace,
                        Some(target),
                        is_pattern,
                    ));
                }
                Section::Intercept => {
                    let Some(namespace) = resolve_same_origin(manifest_url, first) else {
                        continue;
                    };
                    if tokens.next() != Some("return") {
                        continue;
                    }
                    let Some(target) = tokens.next().and_then(|t| resolve_same_origin(manifest_url, t))
                    else {
                        continue;
                    };
                    let is_pattern = allow_patterns && tokens.next() == Some(PATTERN_FLAG);
                    manifest.intercept_namespaces.push(Namespace::new(
                        NamespaceType::Intercept,
                        namespace,
                        Some(target),
                        is_pattern,
                    ));
                }
            }
        }

        Ok(manifest)
    }

    /// Fallback target URLs, in section order.
    pub fn fallback_targets(&self) -> impl Iterator<Item = &Url> {
        self.fallback_namespaces
            .iter()
            .filter_map(|ns| ns.target_url.as_ref())
    }

    /// Intercept target URLs, in section order.
    pub fn intercept_targets(&self) -> impl Iterator<Item = &Url> {
        self.intercept_namespaces
            .iter()
            .filter_map(|ns| ns.target_url.as_ref())
    }
}

fn resolve(base: &Url, token: &str) -> Option<Url> {
    let mut url = base.join(token).ok()?;
    url.set_fragment(None);
    Some(url)
}

fn resolve_same_origin(base: &Url, token: &str) -> Option<Url> {
    resolve(base, token).filter(|url| same_origin(base, url))
}
