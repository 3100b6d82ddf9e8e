//! Upstream rate-limit telemetry.
//!
//! The store mirrors whatever the vendors report in their response headers,
//! keyed `provider/provider_model`. It never enforces anything; it exists so
//! operators (and `/internal/ratelimit`) can see where headroom is going.
//! Updates are last-writer-wins per key.

use dashmap::DashMap;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};

use tianji_provider_core::{Headers, header_get};

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitState {
    pub tokens_limit: i64,
    pub tokens_remaining: i64,
    pub tokens_reset: Option<OffsetDateTime>,
    pub requests_limit: i64,
    pub requests_remaining: i64,
    pub requests_reset: Option<OffsetDateTime>,
    pub updated_at: OffsetDateTime,
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self {
            tokens_limit: -1,
            tokens_remaining: -1,
            tokens_reset: None,
            requests_limit: -1,
            requests_remaining: -1,
            requests_reset: None,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        }
    }
}

impl RateLimitState {
    fn is_empty(&self) -> bool {
        self.tokens_limit < 0
            && self.tokens_remaining < 0
            && self.tokens_reset.is_none()
            && self.requests_limit < 0
            && self.requests_remaining < 0
            && self.requests_reset.is_none()
    }
}

#[derive(Debug, Default)]
pub struct RateLimitStore {
    states: DashMap<String, RateLimitState>,
}

impl RateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the vendor's rate-limit headers and replace the entry for `key`
    /// in one write. Headers that fail to parse are treated as absent; if no
    /// recognized header is present at all the prior counters are kept and
    /// only the entry's timestamp is refreshed.
    pub fn parse_and_update(&self, key: &str, headers: &Headers) {
        self.parse_and_update_at(key, headers, OffsetDateTime::now_utc());
    }

    fn parse_and_update_at(&self, key: &str, headers: &Headers, now: OffsetDateTime) {
        let mut state = RateLimitState::default();

        // OpenAI family: counts are integers, resets are Go-style durations
        // ("1s", "6m0s", "85ms") relative to now.
        if let Some(v) = int_header(headers, "x-ratelimit-limit-tokens") {
            state.tokens_limit = v;
        }
        if let Some(v) = int_header(headers, "x-ratelimit-remaining-tokens") {
            state.tokens_remaining = v;
        }
        if let Some(v) = header_get(headers, "x-ratelimit-reset-tokens")
            .and_then(parse_go_duration)
        {
            state.tokens_reset = Some(now + v);
        }
        if let Some(v) = int_header(headers, "x-ratelimit-limit-requests") {
            state.requests_limit = v;
        }
        if let Some(v) = int_header(headers, "x-ratelimit-remaining-requests") {
            state.requests_remaining = v;
        }
        if let Some(v) = header_get(headers, "x-ratelimit-reset-requests")
            .and_then(parse_go_duration)
        {
            state.requests_reset = Some(now + v);
        }

        // Anthropic family: resets are RFC3339 timestamps.
        if let Some(v) = int_header(headers, "anthropic-ratelimit-tokens-limit") {
            state.tokens_limit = v;
        }
        if let Some(v) = int_header(headers, "anthropic-ratelimit-tokens-remaining") {
            state.tokens_remaining = v;
        }
        if let Some(v) = header_get(headers, "anthropic-ratelimit-tokens-reset")
            .and_then(parse_rfc3339)
        {
            state.tokens_reset = Some(v);
        }
        if let Some(v) = int_header(headers, "anthropic-ratelimit-requests-limit") {
            state.requests_limit = v;
        }
        if let Some(v) = int_header(headers, "anthropic-ratelimit-requests-remaining") {
            state.requests_remaining = v;
        }
        if let Some(v) = header_get(headers, "anthropic-ratelimit-requests-reset")
            .and_then(parse_rfc3339)
        {
            state.requests_reset = Some(v);
        }

        if state.is_empty() {
            // no counters to write; an existing entry only gets its
            // timestamp refreshed
            if let Some(mut entry) = self.states.get_mut(key) {
                entry.updated_at = now;
            }
            return;
        }
        state.updated_at = now;
        self.states.insert(key.to_string(), state);
    }

    pub fn get(&self, key: &str) -> Option<RateLimitState> {
        self.states.get(key).map(|entry| entry.clone())
    }

    pub fn snapshot(&self) -> Vec<(String, RateLimitState)> {
        let mut out: Vec<(String, RateLimitState)> = self
            .states
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

fn int_header(headers: &Headers, name: &str) -> Option<i64> {
    header_get(headers, name).and_then(|v| v.trim().parse().ok())
}

fn parse_rfc3339(value: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(value.trim(), &Rfc3339).ok()
}

/// Go duration strings: one or more `<number><unit>` segments, units
/// `h`, `m`, `s`, `ms`. `"6m0s"` is six minutes.
fn parse_go_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let mut total = Duration::ZERO;
    let mut num = String::new();
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            num.push(c);
            continue;
        }
        let unit = if c == 'm' && chars.peek() == Some(&'s') {
            chars.next();
            "ms"
        } else {
            match c {
                'h' => "h",
                'm' => "m",
                's' => "s",
                _ => return None,
            }
        };
        let n: f64 = num.parse().ok()?;
        num.clear();
        let seconds = match unit {
            "h" => n * 3600.0,
            "m" => n * 60.0,
            "s" => n,
            _ => n / 1000.0,
        };
        total += Duration::seconds_f64(seconds);
    }
    if !num.is_empty() {
        // trailing digits without a unit
        return None;
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn go_durations_parse() {
        assert_eq!(parse_go_duration("1s"), Some(Duration::seconds(1)));
        assert_eq!(parse_go_duration("6m0s"), Some(Duration::seconds(360)));
        assert_eq!(
            parse_go_duration("85ms"),
            Some(Duration::seconds_f64(0.085))
        );
        assert_eq!(parse_go_duration("2h"), Some(Duration::hours(2)));
        assert_eq!(parse_go_duration("garbage"), None);
        assert_eq!(parse_go_duration("15"), None);
    }

    #[test]
    fn openai_headers_fill_state() {
        let store = RateLimitStore::new();
        let now = OffsetDateTime::now_utc();
        store.parse_and_update_at(
            "openai/gpt-4o",
            &headers(&[
                ("x-ratelimit-limit-tokens", "2000000"),
                ("x-ratelimit-remaining-tokens", "1999000"),
                ("x-ratelimit-reset-tokens", "1s"),
                ("x-ratelimit-limit-requests", "10000"),
                ("x-ratelimit-remaining-requests", "9999"),
            ]),
            now,
        );
        let state = store.get("openai/gpt-4o").unwrap();
        assert_eq!(state.tokens_limit, 2_000_000);
        assert_eq!(state.tokens_remaining, 1_999_000);
        assert_eq!(state.tokens_reset, Some(now + Duration::seconds(1)));
        assert_eq!(state.requests_remaining, 9999);
        assert_eq!(state.requests_reset, None);
        assert_eq!(state.updated_at, now);
    }

    #[test]
    fn anthropic_resets_parse_as_timestamps() {
        let store = RateLimitStore::new();
        store.parse_and_update(
            "anthropic/claude-3-5-sonnet",
            &headers(&[
                ("anthropic-ratelimit-tokens-limit", "80000"),
                ("anthropic-ratelimit-tokens-remaining", "79000"),
                ("anthropic-ratelimit-tokens-reset", "2026-08-25T12:00:00Z"),
            ]),
        );
        let state = store.get("anthropic/claude-3-5-sonnet").unwrap();
        assert_eq!(state.tokens_limit, 80_000);
        assert_eq!(
            state.tokens_reset.unwrap().unix_timestamp(),
            OffsetDateTime::parse("2026-08-25T12:00:00Z", &Rfc3339)
                .unwrap()
                .unix_timestamp()
        );
        // unfilled fields stay at their unknown defaults
        assert_eq!(state.requests_limit, -1);
    }

    #[test]
    fn replay_is_idempotent_and_empty_updates_only_touch_the_timestamp() {
        let store = RateLimitStore::new();
        let now = OffsetDateTime::now_utc();
        let hs = headers(&[("x-ratelimit-remaining-tokens", "5")]);
        store.parse_and_update_at("k", &hs, now);
        let first = store.get("k").unwrap();
        store.parse_and_update_at("k", &hs, now);
        assert_eq!(store.get("k").unwrap(), first);

        // headers with nothing recognizable keep the counters and refresh
        // updated_at
        let later = now + Duration::seconds(30);
        store.parse_and_update_at(
            "k",
            &headers(&[("content-type", "application/json")]),
            later,
        );
        let touched = store.get("k").unwrap();
        assert_eq!(touched.tokens_remaining, first.tokens_remaining);
        assert_eq!(touched.tokens_limit, first.tokens_limit);
        assert_eq!(touched.updated_at, later);

        // a key the store has never seen gets no entry from a header-less
        // response
        store.parse_and_update_at("unseen", &headers(&[]), later);
        assert!(store.get("unseen").is_none());
    }

    #[test]
    fn unparseable_values_are_absent() {
        let store = RateLimitStore::new();
        store.parse_and_update(
            "k",
            &headers(&[
                ("x-ratelimit-remaining-tokens", "many"),
                ("x-ratelimit-limit-tokens", "100"),
                ("anthropic-ratelimit-tokens-reset", "soon"),
            ]),
        );
        let state = store.get("k").unwrap();
        assert_eq!(state.tokens_remaining, -1);
        assert_eq!(state.tokens_limit, 100);
        assert_eq!(state.tokens_reset, None);
    }
}
