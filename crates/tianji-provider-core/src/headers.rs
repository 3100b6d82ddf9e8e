//! Header handling shared by adapters and the IO layer.
//!
//! Headers travel as a plain vec of pairs so this crate stays independent of
//! any HTTP framework. Lookups are case-insensitive.

pub type Headers = Vec<(String, String)>;

pub fn header_get<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

pub fn header_set(headers: &mut Headers, name: &str, value: impl Into<String>) {
    header_remove(headers, name);
    headers.push((name.to_string(), value.into()));
}

pub fn header_remove(headers: &mut Headers, name: &str) {
    headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
}

pub fn set_content_type_json(headers: &mut Headers) {
    header_set(headers, "content-type", "application/json");
}

pub fn set_accept_json(headers: &mut Headers) {
    header_set(headers, "accept", "application/json");
}

pub fn set_accept_event_stream(headers: &mut Headers) {
    header_set(headers, "accept", "text/event-stream");
}

pub fn set_bearer(headers: &mut Headers, token: &str) {
    header_set(headers, "authorization", format!("Bearer {token}"));
}
