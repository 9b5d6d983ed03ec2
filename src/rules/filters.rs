//! Built-in filters

use regex::{Regex, RegexBuilder};
use serde::Deserialize;

use super::{Filter, FilterInput};
use crate::error::RuleExecutionFailure;

/// How a [`StringSelector`] compares its pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorOperation {
    #[default]
    Exact,
    Contains,
    StartsWith,
    EndsWith,
    Regex,
}

/// String predicate shared by host, path and header filters
#[derive(Debug, Clone)]
pub struct StringSelector {
    pattern: String,
    operation: SelectorOperation,
    case_sensitive: bool,
    regex: Option<Regex>,
}

impl StringSelector {
    pub fn new(
        pattern: impl Into<String>,
        operation: SelectorOperation,
        case_sensitive: bool,
    ) -> Result<Self, RuleExecutionFailure> {
        let pattern = pattern.into();
        let regex = match operation {
            SelectorOperation::Regex => Some(
                RegexBuilder::new(&pattern)
                    .case_insensitive(!case_sensitive)
                    .build()
                    .map_err(|e| RuleExecutionFailure::InvalidPattern {
                        pattern: pattern.clone(),
                        reason: e.to_string(),
                    })?,
            ),
            _ => None,
        };
        Ok(Self {
            pattern,
            operation,
            case_sensitive,
            regex,
        })
    }

    fn plain(pattern: &str, operation: SelectorOperation) -> Self {
        Self {
            pattern: pattern.to_string(),
            operation,
            case_sensitive: false,
            regex: None,
        }
    }

    /// Case-insensitive exact match
    pub fn exact(pattern: &str) -> Self {
        Self::plain(pattern, SelectorOperation::Exact)
    }

    pub fn contains(pattern: &str) -> Self {
        Self::plain(pattern, SelectorOperation::Contains)
    }

    pub fn ends_with(pattern: &str) -> Self {
        Self::plain(pattern, SelectorOperation::EndsWith)
    }

    pub fn matches(&self, value: &str) -> bool {
        if let Some(regex) = &self.regex {
            return regex.is_match(value);
        }
        let (value, pattern) = if self.case_sensitive {
            (value.to_string(), self.pattern.clone())
        } else {
            (value.to_lowercase(), self.pattern.to_lowercase())
        };
        match self.operation {
            SelectorOperation::Exact => value == pattern,
            SelectorOperation::Contains => value.contains(&pattern),
            SelectorOperation::StartsWith => value.starts_with(&pattern),
            SelectorOperation::EndsWith => value.ends_with(&pattern),
            SelectorOperation::Regex => false,
        }
    }
}

/// Matches everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyFilter;

impl Filter for AnyFilter {
    fn apply(&self, _input: &FilterInput<'_>) -> bool {
        true
    }
}

/// Host name of the authority
#[derive(Debug, Clone)]
pub struct HostFilter {
    selector: StringSelector,
}

impl HostFilter {
    pub fn new(selector: StringSelector) -> Self {
        Self { selector }
    }
}

impl Filter for HostFilter {
    fn apply(&self, input: &FilterInput<'_>) -> bool {
        self.selector.matches(input.authority.host_name())
    }
}

/// Host and port of the authority
#[derive(Debug, Clone)]
pub struct AuthorityFilter {
    host: String,
    port: u16,
}

impl AuthorityFilter {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Filter for AuthorityFilter {
    fn apply(&self, input: &FilterInput<'_>) -> bool {
        input.authority.port() == self.port
            && input.authority.host_name().eq_ignore_ascii_case(&self.host)
    }
}

/// Request path, query included
#[derive(Debug, Clone)]
pub struct PathFilter {
    selector: StringSelector,
}

impl PathFilter {
    pub fn new(selector: StringSelector) -> Self {
        Self { selector }
    }
}

impl Filter for PathFilter {
    fn apply(&self, input: &FilterInput<'_>) -> bool {
        input
            .exchange
            .map(|e| self.selector.matches(e.request.header.path()))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct MethodFilter {
    method: String,
}

impl MethodFilter {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
        }
    }
}

impl Filter for MethodFilter {
    fn apply(&self, input: &FilterInput<'_>) -> bool {
        input
            .exchange
            .map(|e| e.request.header.method().eq_ignore_ascii_case(&self.method))
            .unwrap_or(false)
    }
}

/// Any value of the named request header
#[derive(Debug, Clone)]
pub struct RequestHeaderFilter {
    name: String,
    selector: StringSelector,
}

impl RequestHeaderFilter {
    pub fn new(name: impl Into<String>, selector: StringSelector) -> Self {
        Self {
            name: name.into(),
            selector,
        }
    }
}

impl Filter for RequestHeaderFilter {
    fn apply(&self, input: &FilterInput<'_>) -> bool {
        let Some(exchange) = input.exchange else {
            return false;
        };
        exchange
            .request
            .header
            .get_all(&self.name)
            .any(|v| self.selector.matches(v))
    }
}

/// Any value of the named response header; false before the response arrives
#[derive(Debug, Clone)]
pub struct ResponseHeaderFilter {
    name: String,
    selector: StringSelector,
}

impl ResponseHeaderFilter {
    pub fn new(name: impl Into<String>, selector: StringSelector) -> Self {
        Self {
            name: name.into(),
            selector,
        }
    }
}

impl Filter for ResponseHeaderFilter {
    fn apply(&self, input: &FilterInput<'_>) -> bool {
        let Some(response) = input.exchange.and_then(|e| e.response.as_ref()) else {
            return false;
        };
        response
            .header
            .fields()
            .iter()
            .filter(|f| f.is(&self.name))
            .any(|f| self.selector.matches(&f.value))
    }
}

/// Response status within an inclusive range
#[derive(Debug, Clone, Copy)]
pub struct StatusCodeFilter {
    min: u16,
    max: u16,
}

impl StatusCodeFilter {
    pub fn exact(status: u16) -> Self {
        Self {
            min: status,
            max: status,
        }
    }

    pub fn range(min: u16, max: u16) -> Self {
        Self { min, max }
    }
}

impl Filter for StatusCodeFilter {
    fn apply(&self, input: &FilterInput<'_>) -> bool {
        input
            .exchange
            .and_then(|e| e.status_code())
            .map(|s| (self.min..=self.max).contains(&s))
            .unwrap_or(false)
    }
}

/// Request addressed to the proxy itself
#[derive(Debug, Clone, Copy, Default)]
pub struct IsSelfFilter;

impl Filter for IsSelfFilter {
    fn apply(&self, input: &FilterInput<'_>) -> bool {
        input.context.is_self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionOperation {
    #[default]
    And,
    Or,
}

/// Combination of child filters. An empty `and` matches, an empty `or` does not.
#[derive(Debug)]
pub struct FilterCollection {
    children: Vec<Box<dyn Filter>>,
    operation: CollectionOperation,
}

impl FilterCollection {
    pub fn new(children: Vec<Box<dyn Filter>>, operation: CollectionOperation) -> Self {
        Self {
            children,
            operation,
        }
    }

    pub fn and(children: Vec<Box<dyn Filter>>) -> Self {
        Self::new(children, CollectionOperation::And)
    }

    pub fn or(children: Vec<Box<dyn Filter>>) -> Self {
        Self::new(children, CollectionOperation::Or)
    }
}

impl Filter for FilterCollection {
    fn apply(&self, input: &FilterInput<'_>) -> bool {
        match self.operation {
            CollectionOperation::And => self.children.iter().all(|c| c.apply(input)),
            CollectionOperation::Or => self.children.iter().any(|c| c.apply(input)),
        }
    }
}

/// Negation of another filter
#[derive(Debug)]
pub struct InvertedFilter {
    inner: Box<dyn Filter>,
}

impl InvertedFilter {
    pub fn new(inner: impl Filter + 'static) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }

    pub fn boxed(inner: Box<dyn Filter>) -> Self {
        Self { inner }
    }
}

impl Filter for InvertedFilter {
    fn apply(&self, input: &FilterInput<'_>) -> bool {
        !self.inner.apply(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::Authority;
    use crate::exchange::{Exchange, ExchangeContext, Request, Response};
    use crate::http::body::Body;
    use crate::http::header::{HeaderField, RequestHeader, ResponseHeader};

    fn exchange() -> Exchange {
        let header = RequestHeader::parse(
            b"POST /api/items?page=2 HTTP/1.1\r\nHost: api.example.com\r\nX-Trace: abc-123\r\n\r\n",
            true,
            None,
        )
        .unwrap();
        Exchange::new(
            1,
            Authority::new("api.example.com", 443, true),
            ExchangeContext::new(),
            Request::new(header, Body::empty()),
        )
    }

    fn check(filter: &dyn Filter, exchange: &Exchange) -> bool {
        filter.apply(&FilterInput {
            authority: &exchange.authority,
            context: &exchange.context,
            exchange: Some(exchange),
            connection: None,
        })
    }

    #[test]
    fn test_selector_operations() {
        assert!(StringSelector::exact("Example.COM").matches("example.com"));
        assert!(StringSelector::contains("ampl").matches("example.com"));
        assert!(StringSelector::ends_with(".com").matches("example.com"));
        let starts = StringSelector::new("exa", SelectorOperation::StartsWith, true).unwrap();
        assert!(starts.matches("example.com"));
        assert!(!starts.matches("EXAMPLE.com"));

        let regex = StringSelector::new(r"^api\.", SelectorOperation::Regex, false).unwrap();
        assert!(regex.matches("API.example.com"));
    }

    #[test]
    fn test_invalid_regex_is_rejected() {
        let err = StringSelector::new("(unclosed", SelectorOperation::Regex, true).unwrap_err();
        assert!(matches!(err, RuleExecutionFailure::InvalidPattern { .. }));
    }

    #[test]
    fn test_request_filters() {
        let ex = exchange();
        assert!(check(&HostFilter::new(StringSelector::ends_with("example.com")), &ex));
        assert!(check(&AuthorityFilter::new("API.example.com", 443), &ex));
        assert!(!check(&AuthorityFilter::new("api.example.com", 80), &ex));
        assert!(check(&PathFilter::new(StringSelector::contains("/items")), &ex));
        assert!(check(&MethodFilter::new("post"), &ex));
        assert!(check(
            &RequestHeaderFilter::new("x-trace", StringSelector::contains("abc")),
            &ex
        ));
        assert!(!check(&IsSelfFilter, &ex));
    }

    #[test]
    fn test_response_filters_need_response() {
        let mut ex = exchange();
        let status = StatusCodeFilter::range(400, 499);
        let header_filter = ResponseHeaderFilter::new("server", StringSelector::exact("nginx"));
        assert!(!check(&status, &ex));
        assert!(!check(&header_filter, &ex));

        ex.response = Some(Response {
            header: ResponseHeader::from_parts(
                404,
                "HTTP/1.1",
                vec![HeaderField::new("Server", "nginx")],
            )
            .unwrap(),
            body: Body::empty(),
        });
        assert!(check(&status, &ex));
        assert!(check(&header_filter, &ex));
        assert!(!check(&StatusCodeFilter::exact(200), &ex));
    }

    #[test]
    fn test_collections_and_inversion() {
        let ex = exchange();
        let and = FilterCollection::and(vec![
            Box::new(AnyFilter) as Box<dyn Filter>,
            Box::new(MethodFilter::new("GET")),
        ]);
        let or = FilterCollection::or(vec![
            Box::new(MethodFilter::new("GET")) as Box<dyn Filter>,
            Box::new(MethodFilter::new("POST")),
        ]);
        assert!(!check(&and, &ex));
        assert!(check(&or, &ex));
        assert!(check(&InvertedFilter::new(and), &ex));
        assert!(check(&FilterCollection::and(Vec::new()), &ex));
        assert!(!check(&FilterCollection::or(Vec::new()), &ex));
    }

    #[test]
    fn test_authority_scope_without_exchange() {
        let authority = Authority::new("example.com", 443, true);
        let context = ExchangeContext::new();
        let input = FilterInput {
            authority: &authority,
            context: &context,
            exchange: None,
            connection: None,
        };
        assert!(HostFilter::new(StringSelector::exact("example.com")).apply(&input));
        assert!(!PathFilter::new(StringSelector::contains("/")).apply(&input));
    }
}
