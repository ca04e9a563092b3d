//! Flow search language
//!
//! A query is a whitespace-separated list of terms. `key:value` terms filter
//! a single attribute, anything else is a free keyword searched across the
//! whole exchange. A leading `-` negates a term. Terms of the same kind are
//! ANDed; a flow passes a negated term only when it does not match it.
//!
//! | key | matches |
//! |---|---|
//! | `host`, `domain` | substring of the lower-cased host |
//! | `device`, `client`, `ip` | substring of the client IP |
//! | `path` | substring of the URL path |
//! | `url` | substring of the full URL |
//! | `method` | exact method, case-insensitive |
//! | `status`, `code` | `404`, `2xx`, `400-404`, `>=500`, `<=299`, `>399`, `<300` |
//! | `type`, `content-type`, `mime` | substring of the response Content-Type; `json` also matches JSON-looking bodies |
//!
//! Unknown keys, and status values that do not parse, are searched as
//! keywords.

mod status;
mod tokenizer;

pub use status::StatusFilter;
pub use tokenizer::{tokenize, Token};

use crate::models::{Flow, Headers};

/// Positive and negated terms of one kind
#[derive(Debug, Clone, PartialEq)]
struct Terms<T> {
    include: Vec<T>,
    exclude: Vec<T>,
}

impl<T> Default for Terms<T> {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

impl<T> Terms<T> {
    fn push(&mut self, term: T, negated: bool) {
        if negated {
            self.exclude.push(term);
        } else {
            self.include.push(term);
        }
    }

    fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    fn passes(&self, matches: impl Fn(&T) -> bool) -> bool {
        self.include.iter().all(&matches) && !self.exclude.iter().any(&matches)
    }
}

/// Parsed search string
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FlowQuery {
    host: Terms<String>,
    client: Terms<String>,
    path: Terms<String>,
    url: Terms<String>,
    method: Terms<String>,
    status: Terms<StatusFilter>,
    content_type: Terms<String>,
    keywords: Terms<String>,
}

impl FlowQuery {
    pub fn parse(text: &str) -> Self {
        let mut query = FlowQuery::default();
        for Token { text, negated } in tokenize(text) {
            query.add_term(&text, negated);
        }
        query
    }

    fn add_term(&mut self, text: &str, negated: bool) {
        let Some((key, value)) = text.split_once(':') else {
            self.keywords.push(text.to_lowercase(), negated);
            return;
        };
        let value = value.trim();
        let key = key.trim().to_lowercase();
        if key.is_empty() {
            self.keywords.push(text.to_lowercase(), negated);
            return;
        }
        if value.is_empty() {
            return;
        }

        let lowered = value.to_lowercase();
        match key.as_str() {
            "host" | "domain" => self.host.push(lowered, negated),
            "device" | "client" | "ip" => self.client.push(lowered, negated),
            "path" => self.path.push(lowered, negated),
            "url" => self.url.push(lowered, negated),
            "method" => self.method.push(value.to_uppercase(), negated),
            "status" | "code" => match StatusFilter::parse(value) {
                Some(filter) => self.status.push(filter, negated),
                None => self.keywords.push(text.to_lowercase(), negated),
            },
            "type" | "content-type" | "mime" => self.content_type.push(lowered, negated),
            _ => self.keywords.push(text.to_lowercase(), negated),
        }
    }

    /// True when the query has no predicates and matches every flow
    pub fn is_empty(&self) -> bool {
        self.host.is_empty()
            && self.client.is_empty()
            && self.path.is_empty()
            && self.url.is_empty()
            && self.method.is_empty()
            && self.status.is_empty()
            && self.content_type.is_empty()
            && self.keywords.is_empty()
    }

    /// Evaluate only the status grammar, e.g. `status_matches("2xx", 204)`
    pub fn status_matches(text: &str, code: u16) -> bool {
        StatusFilter::parse(text).is_some_and(|filter| filter.matches(code))
    }

    pub fn matches(&self, flow: &Flow) -> bool {
        if self.is_empty() {
            return true;
        }

        let host = flow.host();
        if !self.host.passes(|term| host.contains(term.as_str())) {
            return false;
        }

        let client_ip = flow
            .client
            .as_ref()
            .map(|c| c.ip.to_lowercase())
            .unwrap_or_default();
        if !self.client.passes(|term| client_ip.contains(term.as_str())) {
            return false;
        }

        let path = flow.path().to_lowercase();
        if !self.path.passes(|term| path.contains(term.as_str())) {
            return false;
        }

        let url = flow.url().to_lowercase();
        if !self.url.passes(|term| url.contains(term.as_str())) {
            return false;
        }

        let method = flow.method().to_uppercase();
        if !self.method.passes(|term| method == *term) {
            return false;
        }

        let status = flow.status();
        if !self
            .status
            .passes(|filter| status.is_some_and(|code| filter.matches(code)))
        {
            return false;
        }

        if !self.content_type.is_empty() {
            let response = flow.response.as_ref();
            let content_type = response
                .and_then(|r| r.content_type())
                .map(str::to_lowercase)
                .unwrap_or_default();
            let body = response.and_then(|r| r.body.as_deref()).unwrap_or_default();
            if !self
                .content_type
                .passes(|term| content_type_matches(term, &content_type, body))
            {
                return false;
            }
        }

        if !self.keywords.is_empty() {
            let haystack = keyword_haystack(flow);
            if !self.keywords.passes(|term| haystack.contains(term.as_str())) {
                return false;
            }
        }

        true
    }

    /// Flows matching the query, in the given order
    pub fn filter<'a>(&self, flows: impl IntoIterator<Item = &'a Flow>) -> Vec<&'a Flow> {
        flows.into_iter().filter(|flow| self.matches(flow)).collect()
    }
}

fn content_type_matches(term: &str, content_type: &str, body: &str) -> bool {
    if content_type.contains(term) {
        return true;
    }
    if term == "json" {
        let body = body.trim_start();
        return body.starts_with('{') || body.starts_with('[');
    }
    false
}

/// Everything a free keyword is searched in, lower-cased
fn keyword_haystack(flow: &Flow) -> String {
    let mut parts: Vec<String> = vec![
        flow.url().to_string(),
        flow.method().to_string(),
        flow.host(),
        flow.path(),
    ];

    let push_headers = |parts: &mut Vec<String>, headers: &Headers| {
        parts.extend(headers.iter().map(|(k, v)| format!("{k}:{v}")));
    };
    if let Some(request) = &flow.request {
        push_headers(&mut parts, &request.headers);
        parts.extend(request.body.clone());
    }
    if let Some(response) = &flow.response {
        if let Some(headers) = &response.headers {
            push_headers(&mut parts, headers);
        }
        parts.extend(response.body.clone());
    }

    parts.join(" ").to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClientInfo, Request, Response};

    fn flow(url: &str, status: Option<u16>, content_type: Option<&str>, body: &str) -> Flow {
        let mut flow = Flow::new("f", "response");
        let mut req_headers = Headers::new();
        req_headers.insert("User-Agent".into(), "FRTM-Test".into());
        flow.request = Some(Request {
            method: "GET".into(),
            url: url.into(),
            headers: req_headers,
            body: Some("needle=1".into()),
        });
        flow.client = Some(ClientInfo {
            ip: "192.168.1.23".into(),
            port: 50123,
        });
        let headers = content_type.map(|ct| {
            let mut headers = Headers::new();
            headers.insert("Content-Type".into(), ct.into());
            headers
        });
        flow.response = Some(Response {
            status,
            headers,
            body: Some(body.into()),
        });
        flow
    }

    #[test]
    fn empty_query_matches_everything() {
        let query = FlowQuery::parse("   ");
        assert!(query.is_empty());
        assert!(query.matches(&Flow::new("x", "request")));
        assert!(FlowQuery::parse("host: -").is_empty());
    }

    #[test]
    fn combined_negated_type_status_and_host() {
        let query = FlowQuery::parse("-type:image status:>=400 host:api.example.com");

        let json = flow("https://api.example.com/v1", Some(500), Some("application/json"), "{}");
        assert!(query.matches(&json));

        let png = flow("https://api.example.com/v1", Some(500), Some("image/png"), "");
        assert!(!query.matches(&png));

        let ok = flow("https://api.example.com/v1", Some(399), Some("application/json"), "{}");
        assert!(!query.matches(&ok));

        let other_host = flow("https://cdn.example.com/v1", Some(500), Some("text/html"), "");
        assert!(!query.matches(&other_host));
    }

    #[test]
    fn status_grammar() {
        let bucket = FlowQuery::parse("status:2xx");
        for code in [199, 200, 250, 299, 300] {
            let f = flow("https://a.com/", Some(code), None, "");
            assert_eq!(bucket.matches(&f), (200..=299).contains(&code), "{code}");
        }

        let range = FlowQuery::parse("code:400-404");
        let accepted: Vec<u16> = (390..420)
            .filter(|c| range.matches(&flow("https://a.com/", Some(*c), None, "")))
            .collect();
        assert_eq!(accepted, vec![400, 401, 402, 403, 404]);

        assert!(FlowQuery::status_matches("2xx", 204));
        assert!(!FlowQuery::status_matches("2xx", 301));
    }

    #[test]
    fn missing_status_fails_positive_and_passes_negative() {
        let pending = flow("https://a.com/", None, None, "");
        assert!(!FlowQuery::parse("status:200").matches(&pending));
        assert!(FlowQuery::parse("-status:200").matches(&pending));
    }

    #[test]
    fn json_type_falls_back_to_body_shape() {
        let query = FlowQuery::parse("type:json");
        assert!(query.matches(&flow("https://a.com/", Some(200), None, "  [1, 2]")));
        assert!(query.matches(&flow("https://a.com/", Some(200), Some("application/json"), "")));
        assert!(!query.matches(&flow("https://a.com/", Some(200), Some("text/plain"), "hello")));
        assert!(!FlowQuery::parse("mime:xml").matches(&flow("https://a.com/", Some(200), None, "{}")));
    }

    #[test]
    fn method_client_path_and_url() {
        let f = flow("https://a.com/Users/42?x=1", Some(200), None, "");
        assert!(FlowQuery::parse("method:get").matches(&f));
        assert!(!FlowQuery::parse("method:post").matches(&f));
        assert!(FlowQuery::parse("ip:192.168.1").matches(&f));
        assert!(!FlowQuery::parse("device:10.0").matches(&f));
        assert!(FlowQuery::parse("path:users/4").matches(&f));
        assert!(FlowQuery::parse("url:x=1").matches(&f));
        assert!(!FlowQuery::parse("-path:users").matches(&f));
    }

    #[test]
    fn keywords_search_headers_and_bodies() {
        let f = flow("https://a.com/x", Some(200), Some("text/plain"), "Hello World");
        assert!(FlowQuery::parse("frtm-test").matches(&f));
        assert!(FlowQuery::parse("needle").matches(&f));
        assert!(FlowQuery::parse("\"hello world\"").matches(&f));
        assert!(FlowQuery::parse("content-type:text").matches(&f));
        assert!(!FlowQuery::parse("-hello").matches(&f));
        assert!(!FlowQuery::parse("hello missing").matches(&f));
    }

    #[test]
    fn unknown_keys_and_bad_status_become_keywords() {
        let f = flow("https://a.com/x", Some(200), None, "token foo:bar here");
        assert!(FlowQuery::parse("foo:bar").matches(&f));
        assert!(!FlowQuery::parse("status:abc").matches(&f));

        let with_literal = flow("https://a.com/x", Some(200), None, "status:abc");
        assert!(FlowQuery::parse("status:abc").matches(&with_literal));
        // A bare bucket is a keyword, not a status filter
        assert!(!FlowQuery::parse("2xx").matches(&f));
    }
}
