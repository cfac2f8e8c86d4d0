//! Provenance header rewriting.
//!
//! Builds the outbound header set: a shallow copy of the inbound headers with
//! `x-forwarded-for`, `x-forwarded-port` and `x-forwarded-proto` set, or
//! extended when an earlier proxy already set them.

use http::header::{HeaderMap, HeaderName, HeaderValue};

use crate::http::request::PeerInfo;

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_PORT: HeaderName = HeaderName::from_static("x-forwarded-port");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Protocol of a forwarding operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Ws,
}

impl Protocol {
    /// Tag recorded in `x-forwarded-proto`; `s`-suffixed when the inbound
    /// hop is already secure.
    pub fn tag(self, secure: bool) -> &'static str {
        match (self, secure) {
            (Protocol::Http, false) => "http",
            (Protocol::Http, true) => "https",
            (Protocol::Ws, false) => "ws",
            (Protocol::Ws, true) => "wss",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag(false))
    }
}

/// Copy `headers` and record the client's address, port and protocol.
///
/// Without peer information (connection already gone) the copy is returned
/// untouched. No other header is added, removed or modified.
pub fn forwarded_headers(headers: &HeaderMap, peer: Option<&PeerInfo>, protocol: Protocol) -> HeaderMap {
    let mut out = headers.clone();

    let Some(peer) = peer else {
        tracing::debug!(protocol = %protocol, "No peer information, provenance headers left unset");
        return out;
    };

    append_value(&mut out, X_FORWARDED_FOR, &peer.addr.ip().to_string());
    append_value(&mut out, X_FORWARDED_PORT, &peer.addr.port().to_string());
    append_value(&mut out, X_FORWARDED_PROTO, protocol.tag(peer.secure));
    out
}

/// Set `name` to `value`, or to `<existing>,<value>` when already present.
/// Repeated header lines count as one comma-joined value.
fn append_value(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    let mut joined: Vec<u8> = Vec::new();
    for existing in headers.get_all(&name) {
        joined.extend_from_slice(existing.as_bytes());
        joined.push(b',');
    }
    joined.extend_from_slice(value.as_bytes());

    if let Ok(value) = HeaderValue::from_bytes(&joined) {
        headers.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(addr: &str, secure: bool) -> PeerInfo {
        PeerInfo::new(addr.parse().unwrap(), secure)
    }

    #[test]
    fn sets_provenance_from_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("host", "example.com".parse().unwrap());

        let out = forwarded_headers(&headers, Some(&peer("5.6.7.8:4321", false)), Protocol::Http);
        assert_eq!(out["x-forwarded-for"], "5.6.7.8");
        assert_eq!(out["x-forwarded-port"], "4321");
        assert_eq!(out["x-forwarded-proto"], "http");
        assert_eq!(out["host"], "example.com");
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn appends_to_existing_chain() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "1.2.3.4".parse().unwrap());
        headers.insert("x-forwarded-port", "80".parse().unwrap());
        headers.insert("x-forwarded-proto", "https".parse().unwrap());

        let out = forwarded_headers(&headers, Some(&peer("5.6.7.8:9000", false)), Protocol::Http);
        assert_eq!(out["x-forwarded-for"], "1.2.3.4,5.6.7.8");
        assert_eq!(out["x-forwarded-port"], "80,9000");
        assert_eq!(out["x-forwarded-proto"], "https,http");
    }

    #[test]
    fn repeated_lines_are_joined_before_appending() {
        let mut headers = HeaderMap::new();
        headers.append("x-forwarded-for", "1.1.1.1".parse().unwrap());
        headers.append("x-forwarded-for", "2.2.2.2".parse().unwrap());

        let out = forwarded_headers(&headers, Some(&peer("3.3.3.3:1", false)), Protocol::Http);
        let values: Vec<_> = out.get_all("x-forwarded-for").iter().collect();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0], "1.1.1.1,2.2.2.2,3.3.3.3");
    }

    #[test]
    fn secure_hop_suffixes_protocol() {
        let headers = HeaderMap::new();
        let out = forwarded_headers(&headers, Some(&peer("10.0.0.2:5000", true)), Protocol::Ws);
        assert_eq!(out["x-forwarded-proto"], "wss");

        let out = forwarded_headers(&headers, Some(&peer("10.0.0.2:5000", true)), Protocol::Http);
        assert_eq!(out["x-forwarded-proto"], "https");
    }

    #[test]
    fn ipv6_peer_is_recorded_without_brackets() {
        let out = forwarded_headers(&HeaderMap::new(), Some(&peer("[::1]:8080", false)), Protocol::Http);
        assert_eq!(out["x-forwarded-for"], "::1");
        assert_eq!(out["x-forwarded-port"], "8080");
    }

    #[test]
    fn missing_peer_leaves_copy_untouched() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "1.2.3.4".parse().unwrap());
        headers.insert("accept", "*/*".parse().unwrap());

        let out = forwarded_headers(&headers, None, Protocol::Ws);
        assert_eq!(out, headers);
    }
}
