//! C2 — field coercion and canonicalization of raw Index records into
//! [`Release`]/[`FileEntry`] values.
//!
//! Each helper here mirrors one of the "pop a key, treat empty/`UNKNOWN`/
//! `None` as absent" defaulting rules from the original source, but as an
//! explicit free function rather than a subclassed mapping — the
//! underscore-attribute convention the Index itself uses is a wire-format
//! artifact, not something worth preserving in the internal model.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::index::{RawRelease, RawValue};
use crate::model::{FileEntry, RequirementSpec, Release};

/// Treats an empty string, `"UNKNOWN"`, or `"None"` as absent, returning the
/// default (empty string) in those cases.
pub fn absent_if_placeholder(raw: Option<&str>) -> String {
    match raw {
        None => String::new(),
        Some(v) if v.is_empty() || v == "UNKNOWN" || v == "None" => String::new(),
        Some(v) => v.to_string(),
    }
}

/// Splits `keywords` on commas if present, otherwise on whitespace; each
/// token is trimmed. An empty input yields an empty list.
pub fn split_keywords(raw: &str) -> Vec<String> {
    if raw.is_empty() {
        return Vec::new();
    }
    let tokens: Vec<&str> = if raw.contains(',') {
        raw.split(',').collect()
    } else {
        raw.split_whitespace().collect()
    };
    tokens
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Deduplicates then sorts classifiers ascending.
pub fn normalize_classifiers(raw: &[String]) -> Vec<String> {
    let mut out = raw.to_vec();
    out.sort();
    out.dedup();
    out
}

/// `platform` / `supported_platforms` accept either a scalar or a sequence;
/// a scalar is wrapped into a single-element sequence. Placeholder scalars
/// (`UNKNOWN`, `None`, empty) yield an empty sequence rather than a
/// single-element one containing the placeholder.
#[derive(Debug, Clone)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
    Absent,
}

pub fn one_or_many_to_vec(value: OneOrMany) -> Vec<String> {
    match value {
        OneOrMany::Absent => Vec::new(),
        OneOrMany::One(s) => {
            let cleaned = absent_if_placeholder(Some(&s));
            if cleaned.is_empty() {
                Vec::new()
            } else {
                vec![cleaned]
            }
        }
        OneOrMany::Many(items) => items,
    }
}

/// Splits a `"label,uri"` project_url entry on the FIRST comma only.
pub fn split_project_url(raw: &str) -> Option<(String, String)> {
    let (label, uri) = raw.split_once(',')?;
    Some((label.trim().to_string(), uri.trim().to_string()))
}

static REQUIREMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?P<name>[^\s(;]+)\s*(?:\(\s*(?P<pred>[^)]*)\s*\))?\s*$").unwrap()
});

/// Parses a single `"name (version-predicate) ; env-marker"` entry. The
/// predicate and environment-marker segments are both optional; a missing
/// predicate yields `version == ""`.
pub fn split_meta(raw: &str) -> Option<RequirementSpec> {
    let (main, env) = match raw.split_once(';') {
        Some((m, e)) => (m, e.trim()),
        None => (raw, ""),
    };

    let caps = REQUIREMENT_RE.captures(main.trim())?;
    let name = caps.name("name")?.as_str().to_string();
    let version = caps
        .name("pred")
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default();

    Some(RequirementSpec {
        name,
        version,
        environment: env.to_string(),
    })
}

/// Errors produced while cleaning a URL (§4.3).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("could not produce a valid url")]
pub struct UrlCleanError;

static CANONICAL_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?xi)
        ^(?:http|ftp)s?://                                     # scheme
        (?:
            (?:[A-Z0-9](?:[A-Z0-9-]{0,61}[A-Z0-9])?\.)+(?:[A-Z]{2,6}\.?|[A-Z0-9-]{2,}\.?) # domain
            |localhost
            |\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}                # ipv4
            |\[?[A-F0-9]*:[A-F0-9:]+\]?                        # ipv6
        )
        (?::\d+)?                                              # optional port
        (?:/?|[/?]\S*)$                                        # optional path/query
        ",
    )
    .unwrap()
});

struct SplitUrl {
    scheme: String,
    netloc: String,
    path: String,
    query: String,
    fragment: String,
}

fn urlsplit(raw: &str) -> SplitUrl {
    let (rest, fragment) = match raw.split_once('#') {
        Some((r, f)) => (r.to_string(), f.to_string()),
        None => (raw.to_string(), String::new()),
    };

    let mut remainder = rest.as_str();
    let mut scheme = String::new();
    if let Some(colon) = remainder.find(':') {
        let candidate = &remainder[..colon];
        let looks_like_scheme = !candidate.is_empty()
            && candidate.chars().next().unwrap().is_ascii_alphabetic()
            && candidate
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
            && !candidate.contains('/');
        if looks_like_scheme {
            scheme = candidate.to_lowercase();
            remainder = &remainder[colon + 1..];
        }
    }

    let mut netloc = String::new();
    if let Some(stripped) = remainder.strip_prefix("//") {
        let end = stripped
            .find(['/', '?'])
            .unwrap_or(stripped.len());
        netloc = stripped[..end].to_string();
        remainder = &stripped[end..];
    }

    let (path, query) = match remainder.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (remainder.to_string(), String::new()),
    };

    SplitUrl {
        scheme,
        netloc,
        path,
        query,
        fragment,
    }
}

fn urlunsplit(parts: &SplitUrl) -> String {
    let mut out = String::new();
    if !parts.scheme.is_empty() {
        out.push_str(&parts.scheme);
        out.push(':');
    }
    if !parts.netloc.is_empty() || parts.path.starts_with("//") {
        out.push_str("//");
        out.push_str(&parts.netloc);
    }
    out.push_str(&parts.path);
    if !parts.query.is_empty() {
        out.push('?');
        out.push_str(&parts.query);
    }
    if !parts.fragment.is_empty() {
        out.push('#');
        out.push_str(&parts.fragment);
    }
    out
}

/// Cleans and validates a candidate URL (§4.3). Missing scheme/netloc/path
/// are filled in, the result is checked against the canonical URL regex,
/// and IDN domains are given one ACE-encoding retry before failing.
pub fn clean_url(raw: &str) -> Result<String, UrlCleanError> {
    let mut parts = urlsplit(raw);

    if parts.scheme.is_empty() {
        parts.scheme = "http".to_string();
    }

    if parts.netloc.is_empty() {
        // Assume the path segment actually contains the domain; rebuild and
        // re-split so any embedded query string separates out correctly.
        parts.netloc = parts.path.clone();
        parts.path = String::new();
        let rebuilt = urlunsplit(&parts);
        parts = urlsplit(&rebuilt);
        if parts.scheme.is_empty() {
            parts.scheme = "http".to_string();
        }
    }

    if parts.path.is_empty() {
        parts.path = "/".to_string();
    }

    let mut cleaned = urlunsplit(&parts);

    if !CANONICAL_URL_RE.is_match(&cleaned) {
        if cleaned.is_empty() {
            return Err(UrlCleanError);
        }
        let mut reparsed = urlsplit(&cleaned);
        let ace = idna::domain_to_ascii(&reparsed.netloc).map_err(|_| UrlCleanError)?;
        reparsed.netloc = ace;
        cleaned = urlunsplit(&reparsed);
        if !CANONICAL_URL_RE.is_match(&cleaned) {
            return Err(UrlCleanError);
        }
    }

    Ok(cleaned)
}

/// Reads a raw field as a list of strings regardless of whether the Index
/// reported it as a scalar or a sequence, applying the `OneOrMany` rule
/// (§4.2) to a bare scalar.
fn raw_one_or_many(raw: &RawRelease, key: &str) -> Vec<String> {
    match raw.get(key) {
        None => one_or_many_to_vec(OneOrMany::Absent),
        Some(RawValue::Str(s)) => one_or_many_to_vec(OneOrMany::One(s.clone())),
        Some(RawValue::List(items)) => one_or_many_to_vec(OneOrMany::Many(
            items.iter().filter_map(RawValue::as_str).map(str::to_string).collect(),
        )),
        Some(_) => Vec::new(),
    }
}

fn raw_requirement_list(raw: &RawRelease, key: &str) -> Vec<RequirementSpec> {
    raw.get_list(key)
        .map(|items| {
            items
                .iter()
                .filter_map(RawValue::as_str)
                .filter_map(split_meta)
                .collect()
        })
        .unwrap_or_default()
}

fn raw_uri_field(raw: &RawRelease, uris: &mut BTreeMap<String, String>, key: &str, label: &str) {
    if let Some(value) = raw.get_str(key) {
        let value = absent_if_placeholder(Some(value));
        if !value.is_empty()
            && let Ok(cleaned) = clean_url(&value)
        {
            uris.insert(label.to_string(), cleaned);
        }
    }
}

fn raw_uris(raw: &RawRelease) -> BTreeMap<String, String> {
    let mut uris = BTreeMap::new();

    raw_uri_field(raw, &mut uris, "bugtrack_url", "Bug tracker");
    raw_uri_field(raw, &mut uris, "home_page", "Home page");
    raw_uri_field(raw, &mut uris, "download_url", "Download");
    raw_uri_field(raw, &mut uris, "docs_url", "Documentation");

    if let Some(entries) = raw.get_list("project_url") {
        for entry in entries.iter().filter_map(RawValue::as_str) {
            if let Some((label, uri)) = split_project_url(entry)
                && let Ok(cleaned) = clean_url(&uri)
            {
                uris.insert(label, cleaned);
            }
        }
    }

    uris
}

/// C2 — builds the normalized [`Release`] record for one version, from the
/// Index's raw fields plus the already-fetched [`FileEntry`] list.
/// `files` is expected pre-sorted by filename; `created` is derived here as
/// the minimum `upload_time` across them.
pub fn build_release(name: &str, version: &str, raw: &RawRelease, files: Vec<FileEntry>) -> Release {
    let classifiers = normalize_classifiers(&raw_one_or_many(raw, "classifiers"));
    let created = files.iter().filter_map(|f| f.upload_time).min();

    Release {
        name: name.to_string(),
        version: version.to_string(),
        summary: absent_if_placeholder(raw.get_str("summary")),
        description: absent_if_placeholder(raw.get_str("description")),
        license: absent_if_placeholder(raw.get_str("license")),
        author: absent_if_placeholder(raw.get_str("author")),
        author_email: absent_if_placeholder(raw.get_str("author_email")),
        maintainer: absent_if_placeholder(raw.get_str("maintainer")),
        maintainer_email: absent_if_placeholder(raw.get_str("maintainer_email")),
        classifiers,
        uris: raw_uris(raw),
        requires_python: absent_if_placeholder(raw.get_str("requires_python")),
        requires_external: raw_one_or_many(raw, "requires_external"),
        platforms: raw_one_or_many(raw, "platform"),
        supported_platforms: raw_one_or_many(raw, "supported_platforms"),
        keywords: split_keywords(&absent_if_placeholder(raw.get_str("keywords"))),
        requires: raw_requirement_list(raw, "requires_dist"),
        provides: raw_requirement_list(raw, "provides_dist"),
        obsoletes: raw_requirement_list(raw, "obsoletes_dist"),
        created,
        yanked: false,
        files,
    }
}
