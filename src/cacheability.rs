use std::time::{Duration, SystemTime};

use http::{header, HeaderMap, Method, StatusCode};

const HEURISTIC_FRACTION: u32 = 10;
const MAX_HEURISTIC_FRESHNESS: Duration = Duration::from_secs(24 * 60 * 60);

// RFC 7231 section 6.1: status codes cacheable by default.
const CACHEABLE_STATUS: &[u16] = &[200, 203, 204, 206, 300, 301, 404, 405, 410, 414, 501];

#[derive(Debug, Clone)]
pub struct Decision {
    pub store: bool,
    pub expires_at: Option<SystemTime>,
    pub reasons: Vec<String>,
}

#[derive(Debug, Default)]
struct Directives {
    no_store: bool,
    no_cache: bool,
    private: bool,
    public: bool,
    must_revalidate: bool,
    max_age: Option<u64>,
    s_maxage: Option<u64>,
}

/// Decides whether a response may be stored by a shared cache and until when
/// it stays fresh. Pure over its inputs; malformed directives are skipped as
/// if absent.
pub fn evaluate(
    req_headers: &HeaderMap,
    resp_headers: &HeaderMap,
    status: StatusCode,
    method: &Method,
    now: SystemTime,
) -> Decision {
    let req_dir = parse_cache_control(req_headers);
    let resp_dir = parse_cache_control(resp_headers);

    let mut reasons = Vec::new();

    if *method != Method::GET && *method != Method::HEAD {
        reasons.push(format!("method {method} is not cacheable"));
    }
    if req_dir.no_store {
        reasons.push("request Cache-Control: no-store".to_string());
    }
    if resp_dir.no_store {
        reasons.push("response Cache-Control: no-store".to_string());
    }
    if resp_dir.private {
        reasons.push("response Cache-Control: private".to_string());
    }
    if resp_dir.no_cache {
        reasons.push("response Cache-Control: no-cache".to_string());
    }
    if req_headers.contains_key(header::AUTHORIZATION)
        && !(resp_dir.public || resp_dir.s_maxage.is_some() || resp_dir.must_revalidate)
    {
        reasons.push("authorized request without explicit response caching".to_string());
    }

    let has_explicit_freshness = resp_dir.max_age.is_some()
        || resp_dir.s_maxage.is_some()
        || resp_headers.contains_key(header::EXPIRES);
    if !CACHEABLE_STATUS.contains(&status.as_u16()) && !has_explicit_freshness {
        reasons.push(format!("status {status} is not cacheable by default"));
    }

    let expires_at = compute_expiry(resp_headers, &resp_dir, now);

    Decision {
        store: reasons.is_empty(),
        expires_at,
        reasons,
    }
}

fn compute_expiry(resp_headers: &HeaderMap, resp_dir: &Directives, now: SystemTime) -> Option<SystemTime> {
    let date = header_time(resp_headers, header::DATE).unwrap_or(now);

    if let Some(secs) = resp_dir.s_maxage.or(resp_dir.max_age) {
        return date.checked_add(Duration::from_secs(secs));
    }

    if let Some(expires) = header_time(resp_headers, header::EXPIRES) {
        return Some(expires);
    }

    // heuristic freshness: a fraction of the object's age
    let last_modified = header_time(resp_headers, header::LAST_MODIFIED)?;
    let age = date.duration_since(last_modified).ok()?;
    let freshness = (age / HEURISTIC_FRACTION).min(MAX_HEURISTIC_FRESHNESS);
    Some(now + freshness)
}

fn parse_cache_control(headers: &HeaderMap) -> Directives {
    let mut dir = Directives::default();
    let Some(raw) = headers.get(header::CACHE_CONTROL).and_then(|v| v.to_str().ok()) else {
        return dir;
    };
    for token in raw.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let (name, value) = match token.split_once('=') {
            Some((name, value)) => (name.trim(), Some(value.trim().trim_matches('"'))),
            None => (token, None),
        };
        match name.to_ascii_lowercase().as_str() {
            "no-store" => dir.no_store = true,
            "no-cache" => dir.no_cache = true,
            "private" => dir.private = true,
            "public" => dir.public = true,
            "must-revalidate" | "proxy-revalidate" => dir.must_revalidate = true,
            "max-age" => dir.max_age = parse_seconds(name, value),
            "s-maxage" => dir.s_maxage = parse_seconds(name, value),
            _ => {}
        }
    }
    dir
}

fn parse_seconds(name: &str, value: Option<&str>) -> Option<u64> {
    match value.and_then(|v| v.parse::<u64>().ok()) {
        Some(secs) => Some(secs),
        None => {
            log::debug!("ignoring malformed cache directive {name}={value:?}");
            None
        }
    }
}

fn header_time(headers: &HeaderMap, name: header::HeaderName) -> Option<SystemTime> {
    let raw = headers.get(name)?.to_str().ok()?;
    httpdate::parse_http_date(raw).ok()
}
