//! Built-in actions

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use url::Url;

use super::{Action, ActionTarget, FilterScope};
use crate::authority::Authority;
use crate::error::RuleExecutionFailure;
use crate::establish::tls::load_client_certificate;
use crate::exchange::{AlpnProtocol, ClientCertificate, HeaderAlteration, PreMadeResponse};
use crate::proxy_metrics;

/// Tunnel the CONNECT without decryption
#[derive(Debug, Clone, Copy, Default)]
pub struct SkipSslTunnelingAction;

#[async_trait]
impl Action for SkipSslTunnelingAction {
    fn name(&self) -> &'static str {
        "skip_ssl_tunneling"
    }

    fn scope(&self) -> FilterScope {
        FilterScope::OnAuthorityReceived
    }

    async fn alter(&self, target: &mut ActionTarget<'_>) -> Result<(), RuleExecutionFailure> {
        target.context.blind_mode = true;
        Ok(())
    }
}

/// Route the exchange to another origin, prefixing the path with the destination path.
///
/// `https://backend.local/api` turns `GET /users` into `GET /api/users` on
/// `backend.local:443`.
#[derive(Debug, Clone)]
pub struct ForwardAction {
    destination: Url,
}

impl ForwardAction {
    pub fn new(url: &str) -> Result<Self, RuleExecutionFailure> {
        let destination =
            Url::parse(url).map_err(|_| RuleExecutionFailure::InvalidDestination(url.to_string()))?;
        if !matches!(destination.scheme(), "http" | "https") || destination.host_str().is_none() {
            return Err(RuleExecutionFailure::InvalidDestination(url.to_string()));
        }
        Ok(Self { destination })
    }

    fn authority(&self) -> Authority {
        let secure = self.destination.scheme() == "https";
        let host = self.destination.host_str().unwrap_or_default();
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port = self
            .destination
            .port_or_known_default()
            .unwrap_or(if secure { 443 } else { 80 });
        Authority::new(host, port, secure)
    }

    fn rewrite_path(&self, path: &str) -> String {
        let base = self.destination.path().trim_end_matches('/');
        if path.starts_with('/') {
            format!("{}{}", base, path)
        } else {
            format!("{}/{}", base, path)
        }
    }
}

#[async_trait]
impl Action for ForwardAction {
    fn name(&self) -> &'static str {
        "forward"
    }

    fn scope(&self) -> FilterScope {
        FilterScope::RequestHeaderReceivedFromClient
    }

    async fn alter(&self, target: &mut ActionTarget<'_>) -> Result<(), RuleExecutionFailure> {
        let Some(exchange) = target.exchange.as_deref_mut() else {
            return Ok(());
        };
        let authority = self.authority();
        let path = self.rewrite_path(exchange.request.header.path());

        debug!(
            exchange_id = exchange.id,
            from = %exchange.authority,
            to = %authority,
            path = %path,
            "Forwarding exchange"
        );

        let header = &mut exchange.request.header;
        header.set_path(path);
        header.set_scheme(authority.scheme());
        header.set_authority(authority.host_header());
        exchange.authority = authority.clone();
        target.authority = authority;
        Ok(())
    }
}

/// Connect to a fixed address instead of resolving the host
#[derive(Debug, Clone, Copy)]
pub struct SpoofDnsAction {
    ip: IpAddr,
    port: Option<u16>,
}

impl SpoofDnsAction {
    pub fn new(ip: IpAddr, port: Option<u16>) -> Self {
        Self { ip, port }
    }
}

#[async_trait]
impl Action for SpoofDnsAction {
    fn name(&self) -> &'static str {
        "spoof_dns"
    }

    fn scope(&self) -> FilterScope {
        FilterScope::OnAuthorityReceived
    }

    async fn alter(&self, target: &mut ActionTarget<'_>) -> Result<(), RuleExecutionFailure> {
        target.context.remote_host_ip = Some(self.ip);
        if self.port.is_some() {
            target.context.remote_host_port = self.port;
        }
        Ok(())
    }
}

/// Which header list a header action edits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderTarget {
    Request,
    Response,
}

#[derive(Debug, Clone)]
struct HeaderEdit {
    target: HeaderTarget,
    alteration: HeaderAlteration,
}

impl HeaderEdit {
    fn scope(&self) -> FilterScope {
        match self.target {
            HeaderTarget::Request => FilterScope::RequestHeaderReceivedFromClient,
            HeaderTarget::Response => FilterScope::ResponseHeaderReceivedFromRemote,
        }
    }

    fn push(&self, target: &mut ActionTarget<'_>) {
        let list = match self.target {
            HeaderTarget::Request => &mut target.context.request_header_alterations,
            HeaderTarget::Response => &mut target.context.response_header_alterations,
        };
        list.push(self.alteration.clone());
    }
}

macro_rules! header_action {
    ($(#[$doc:meta])* $name:ident, $label:literal, $target:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone)]
        pub struct $name(HeaderEdit);

        #[async_trait]
        impl Action for $name {
            fn name(&self) -> &'static str {
                $label
            }

            fn scope(&self) -> FilterScope {
                self.0.scope()
            }

            async fn alter(
                &self,
                target: &mut ActionTarget<'_>,
            ) -> Result<(), RuleExecutionFailure> {
                self.0.push(target);
                Ok(())
            }
        }

        impl $name {
            fn with(alteration: HeaderAlteration) -> Self {
                Self(HeaderEdit {
                    target: $target,
                    alteration,
                })
            }
        }
    };
}

header_action!(AddRequestHeaderAction, "add_request_header", HeaderTarget::Request);
header_action!(
    /// Replace every value of a request header; `{{previous}}` expands to the old value
    UpdateRequestHeaderAction,
    "update_request_header",
    HeaderTarget::Request
);
header_action!(DeleteRequestHeaderAction, "delete_request_header", HeaderTarget::Request);
header_action!(AddResponseHeaderAction, "add_response_header", HeaderTarget::Response);
header_action!(
    /// Replace every value of a response header; `{{previous}}` expands to the old value
    UpdateResponseHeaderAction,
    "update_response_header",
    HeaderTarget::Response
);
header_action!(DeleteResponseHeaderAction, "delete_response_header", HeaderTarget::Response);

impl AddRequestHeaderAction {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::with(HeaderAlteration::add(name, value))
    }
}

impl UpdateRequestHeaderAction {
    pub fn new(name: impl Into<String>, value: impl Into<String>, add_if_missing: bool) -> Self {
        Self::with(HeaderAlteration::replace(name, value, add_if_missing))
    }
}

impl DeleteRequestHeaderAction {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with(HeaderAlteration::delete(name))
    }
}

impl AddResponseHeaderAction {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::with(HeaderAlteration::add(name, value))
    }
}

impl UpdateResponseHeaderAction {
    pub fn new(name: impl Into<String>, value: impl Into<String>, add_if_missing: bool) -> Self {
        Self::with(HeaderAlteration::replace(name, value, add_if_missing))
    }
}

impl DeleteResponseHeaderAction {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with(HeaderAlteration::delete(name))
    }
}

/// Restrict the upstream ALPN offer to a single protocol
#[derive(Debug, Clone, Copy)]
pub struct ForceProtocolAction {
    protocol: AlpnProtocol,
}

impl ForceProtocolAction {
    pub fn http11() -> Self {
        Self {
            protocol: AlpnProtocol::Http11,
        }
    }

    pub fn http2() -> Self {
        Self {
            protocol: AlpnProtocol::Http2,
        }
    }
}

#[async_trait]
impl Action for ForceProtocolAction {
    fn name(&self) -> &'static str {
        match self.protocol {
            AlpnProtocol::Http11 => "force_http11",
            AlpnProtocol::Http2 => "force_http2",
        }
    }

    fn scope(&self) -> FilterScope {
        FilterScope::OnAuthorityReceived
    }

    async fn alter(&self, target: &mut ActionTarget<'_>) -> Result<(), RuleExecutionFailure> {
        target.context.ssl_application_protocols = Some(vec![self.protocol]);
        Ok(())
    }
}

/// Present a client certificate to the remote; loaded once when the rule is built
#[derive(Debug, Clone)]
pub struct SetClientCertificateAction {
    certificate: Arc<ClientCertificate>,
}

impl SetClientCertificateAction {
    pub fn new(
        certificate_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, RuleExecutionFailure> {
        Ok(Self {
            certificate: Arc::new(load_client_certificate(certificate_path, key_path)?),
        })
    }
}

#[async_trait]
impl Action for SetClientCertificateAction {
    fn name(&self) -> &'static str {
        "set_client_certificate"
    }

    fn scope(&self) -> FilterScope {
        FilterScope::OnAuthorityReceived
    }

    async fn alter(&self, target: &mut ActionTarget<'_>) -> Result<(), RuleExecutionFailure> {
        target.context.client_certificate = Some(self.certificate.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SkipRemoteCertificateValidationAction;

#[async_trait]
impl Action for SkipRemoteCertificateValidationAction {
    fn name(&self) -> &'static str {
        "skip_remote_certificate_validation"
    }

    fn scope(&self) -> FilterScope {
        FilterScope::OnAuthorityReceived
    }

    async fn alter(&self, target: &mut ActionTarget<'_>) -> Result<(), RuleExecutionFailure> {
        target.context.skip_remote_certificate_validation = true;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ApplyTagAction {
    tag: String,
}

impl ApplyTagAction {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }
}

#[async_trait]
impl Action for ApplyTagAction {
    fn name(&self) -> &'static str {
        "apply_tag"
    }

    fn scope(&self) -> FilterScope {
        FilterScope::RequestHeaderReceivedFromClient
    }

    async fn alter(&self, target: &mut ActionTarget<'_>) -> Result<(), RuleExecutionFailure> {
        if let Some(exchange) = target.exchange.as_deref_mut() {
            if !exchange.tags.contains(&self.tag) {
                exchange.tags.push(self.tag.clone());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ApplyCommentAction {
    comment: String,
}

impl ApplyCommentAction {
    pub fn new(comment: impl Into<String>) -> Self {
        Self {
            comment: comment.into(),
        }
    }
}

#[async_trait]
impl Action for ApplyCommentAction {
    fn name(&self) -> &'static str {
        "apply_comment"
    }

    fn scope(&self) -> FilterScope {
        FilterScope::RequestHeaderReceivedFromClient
    }

    async fn alter(&self, target: &mut ActionTarget<'_>) -> Result<(), RuleExecutionFailure> {
        if let Some(exchange) = target.exchange.as_deref_mut() {
            exchange.comment = Some(self.comment.clone());
        }
        Ok(())
    }
}

/// Answer from the proxy without contacting the remote
#[derive(Debug, Clone)]
pub struct MockedResponseAction {
    response: PreMadeResponse,
}

impl MockedResponseAction {
    pub fn new(response: PreMadeResponse) -> Self {
        Self { response }
    }
}

#[async_trait]
impl Action for MockedResponseAction {
    fn name(&self) -> &'static str {
        "mocked_response"
    }

    fn scope(&self) -> FilterScope {
        FilterScope::RequestHeaderReceivedFromClient
    }

    async fn alter(&self, target: &mut ActionTarget<'_>) -> Result<(), RuleExecutionFailure> {
        target.context.pre_made_response = Some(self.response.clone());
        Ok(())
    }
}

/// Bind a variable usable as `${user.NAME}` in templates
#[derive(Debug, Clone)]
pub struct SetVariableAction {
    name: String,
    value: String,
    scope: FilterScope,
}

impl SetVariableAction {
    pub fn new(name: impl Into<String>, value: impl Into<String>, scope: FilterScope) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            scope,
        }
    }
}

#[async_trait]
impl Action for SetVariableAction {
    fn name(&self) -> &'static str {
        "set_variable"
    }

    fn scope(&self) -> FilterScope {
        self.scope
    }

    async fn alter(&self, target: &mut ActionTarget<'_>) -> Result<(), RuleExecutionFailure> {
        let value = render_template(&self.value, target);
        target.context.variables.insert(self.name.clone(), value);
        Ok(())
    }
}

lazy_static! {
    static ref TEMPLATE_VARIABLE: Regex =
        Regex::new(r"\$\{([a-z]+)\.([A-Za-z0-9_\-]+)\}").unwrap();
}

/// Expand `${authority.host}`, `${request.method}`, `${request.path}`,
/// `${exchange.id}`, `${response.status}` and `${user.NAME}`. Unknown
/// variables expand to an empty string.
pub fn render_template(template: &str, target: &ActionTarget<'_>) -> String {
    TEMPLATE_VARIABLE
        .replace_all(template, |caps: &Captures<'_>| {
            let exchange = target.exchange.as_deref();
            match (&caps[1], &caps[2]) {
                ("authority", "host") => target.authority.host_name().to_string(),
                ("authority", "port") => target.authority.port().to_string(),
                ("request", "method") => exchange
                    .map(|e| e.request.header.method().to_string())
                    .unwrap_or_default(),
                ("request", "path") => exchange
                    .map(|e| e.request.header.path().to_string())
                    .unwrap_or_default(),
                ("exchange", "id") => exchange.map(|e| e.id.to_string()).unwrap_or_default(),
                ("response", "status") => exchange
                    .and_then(|e| e.status_code())
                    .map(|s| s.to_string())
                    .unwrap_or_default(),
                ("user", name) => target.context.variables.get(name).cloned().unwrap_or_default(),
                _ => String::new(),
            }
        })
        .into_owned()
}

/// Append a templated line to a file
#[derive(Debug, Clone)]
pub struct FileAppendAction {
    path: PathBuf,
    text: String,
    scope: FilterScope,
}

impl FileAppendAction {
    pub fn new(path: impl Into<PathBuf>, text: impl Into<String>, scope: FilterScope) -> Self {
        Self {
            path: path.into(),
            text: text.into(),
            scope,
        }
    }
}

#[async_trait]
impl Action for FileAppendAction {
    fn name(&self) -> &'static str {
        "file_append"
    }

    fn scope(&self) -> FilterScope {
        self.scope
    }

    async fn alter(&self, target: &mut ActionTarget<'_>) -> Result<(), RuleExecutionFailure> {
        let mut line = render_template(&self.text, target);
        line.push('\n');

        let fail = |e: std::io::Error| RuleExecutionFailure::action("file_append", e.to_string());
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(fail)?;
        file.write_all(line.as_bytes()).await.map_err(fail)?;
        file.flush().await.map_err(fail)?;
        Ok(())
    }
}

/// Serve the CA certificate to clients browsing the proxy itself
#[derive(Debug, Clone)]
pub struct MountCertificateAuthorityAction {
    pem: String,
}

impl MountCertificateAuthorityAction {
    pub fn new(pem: String) -> Self {
        Self { pem }
    }
}

#[async_trait]
impl Action for MountCertificateAuthorityAction {
    fn name(&self) -> &'static str {
        "mount_certificate_authority"
    }

    fn scope(&self) -> FilterScope {
        FilterScope::RequestHeaderReceivedFromClient
    }

    async fn alter(&self, target: &mut ActionTarget<'_>) -> Result<(), RuleExecutionFailure> {
        target.context.pre_made_response = Some(
            PreMadeResponse::new(200, "application/x-pem-file", self.pem.clone())
                .with_header(
                    "Content-Disposition",
                    "attachment; filename=\"fluxgate-ca.pem\"",
                )
                .with_header("Connection", "close"),
        );
        Ok(())
    }
}

/// Serve the Prometheus exposition on the proxy's own `/metrics`
#[derive(Debug, Clone, Copy, Default)]
pub struct ServeMetricsAction;

#[async_trait]
impl Action for ServeMetricsAction {
    fn name(&self) -> &'static str {
        "serve_metrics"
    }

    fn scope(&self) -> FilterScope {
        FilterScope::RequestHeaderReceivedFromClient
    }

    async fn alter(&self, target: &mut ActionTarget<'_>) -> Result<(), RuleExecutionFailure> {
        target.context.pre_made_response = Some(PreMadeResponse::new(
            200,
            "text/plain; version=0.0.4",
            proxy_metrics::render(),
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{Exchange, ExchangeContext, Request};
    use crate::http::body::Body;
    use crate::http::header::RequestHeader;
    use crate::rules::{AnyFilter, Rule, RuleEngine};

    fn exchange(raw: &[u8]) -> Exchange {
        let header = RequestHeader::parse(raw, true, None).unwrap();
        Exchange::new(
            42,
            Authority::new("shop.example.com", 443, true),
            ExchangeContext::new(),
            Request::new(header, Body::empty()),
        )
    }

    async fn apply(action: impl Action + 'static, scope: FilterScope, ex: &mut Exchange) {
        RuleEngine::new(Vec::new(), vec![Rule::new(AnyFilter, action)])
            .enforce_on_exchange(scope, ex, None)
            .await;
    }

    #[tokio::test]
    async fn test_forward_rewrites_path_and_authority() {
        let mut ex = exchange(b"GET /users HTTP/1.1\r\nHost: shop.example.com\r\n\r\n");
        let action = ForwardAction::new("https://backend.local/api").unwrap();
        apply(action, FilterScope::RequestHeaderReceivedFromClient, &mut ex).await;

        assert_eq!(ex.request.header.path(), "/api/users");
        assert_eq!(ex.authority, Authority::new("backend.local", 443, true));
        assert_eq!(ex.request.header.authority(), "backend.local");
        assert_eq!(ex.request.header.get("host"), Some("backend.local"));
    }

    #[tokio::test]
    async fn test_forward_to_plain_port() {
        let mut ex = exchange(b"GET /a?b=1 HTTP/1.1\r\nHost: shop.example.com\r\n\r\n");
        let action = ForwardAction::new("http://127.0.0.1:8080/").unwrap();
        apply(action, FilterScope::RequestHeaderReceivedFromClient, &mut ex).await;
        assert_eq!(ex.request.header.path(), "/a?b=1");
        assert_eq!(ex.authority, Authority::new("127.0.0.1", 8080, false));
        assert_eq!(ex.request.header.scheme(), "http");
    }

    #[test]
    fn test_forward_rejects_bad_destination() {
        assert!(matches!(
            ForwardAction::new("not a url"),
            Err(RuleExecutionFailure::InvalidDestination(_))
        ));
        assert!(ForwardAction::new("ftp://files.local/").is_err());
    }

    #[tokio::test]
    async fn test_header_actions_accumulate_alterations() {
        let mut ex = exchange(b"GET / HTTP/1.1\r\nHost: shop.example.com\r\n\r\n");
        apply(
            AddRequestHeaderAction::new("X-A", "1"),
            FilterScope::RequestHeaderReceivedFromClient,
            &mut ex,
        )
        .await;
        apply(
            DeleteResponseHeaderAction::new("Server"),
            FilterScope::RequestHeaderReceivedFromClient,
            &mut ex,
        )
        .await;
        assert_eq!(ex.context.request_header_alterations.len(), 1);
        assert!(ex.context.response_header_alterations.is_empty());

        apply(
            DeleteResponseHeaderAction::new("Server"),
            FilterScope::ResponseHeaderReceivedFromRemote,
            &mut ex,
        )
        .await;
        assert_eq!(
            ex.context.response_header_alterations,
            vec![HeaderAlteration::delete("Server")]
        );
        // Parsed header left untouched
        assert!(ex.request.header.get("x-a").is_none());
    }

    #[tokio::test]
    async fn test_context_actions() {
        let mut context = ExchangeContext::new();
        let authority = Authority::new("shop.example.com", 443, true);
        let engine = RuleEngine::new(
            Vec::new(),
            vec![
                Rule::new(AnyFilter, ForceProtocolAction::http11()),
                Rule::new(AnyFilter, SkipRemoteCertificateValidationAction),
                Rule::new(
                    AnyFilter,
                    SpoofDnsAction::new(IpAddr::from([10, 0, 0, 1]), Some(8443)),
                ),
            ],
        );
        engine
            .enforce_on_authority(FilterScope::OnAuthorityReceived, &mut context, &authority)
            .await;
        assert_eq!(
            context.ssl_application_protocols,
            Some(vec![AlpnProtocol::Http11])
        );
        assert!(context.skip_remote_certificate_validation);
        assert_eq!(context.remote_host_ip, Some(IpAddr::from([10, 0, 0, 1])));
        assert_eq!(context.remote_host_port, Some(8443));
    }

    #[tokio::test]
    async fn test_tags_comment_and_mock() {
        let mut ex = exchange(b"GET / HTTP/1.1\r\nHost: shop.example.com\r\n\r\n");
        let scope = FilterScope::RequestHeaderReceivedFromClient;
        apply(ApplyTagAction::new("checkout"), scope, &mut ex).await;
        apply(ApplyTagAction::new("checkout"), scope, &mut ex).await;
        apply(ApplyCommentAction::new("seen"), scope, &mut ex).await;
        apply(
            MockedResponseAction::new(PreMadeResponse::new(418, "text/plain", "teapot")),
            scope,
            &mut ex,
        )
        .await;
        assert_eq!(ex.tags, vec!["checkout".to_string()]);
        assert_eq!(ex.comment.as_deref(), Some("seen"));
        assert_eq!(ex.context.pre_made_response.as_ref().unwrap().status, 418);
    }

    #[tokio::test]
    async fn test_file_append_with_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        let mut ex = exchange(b"POST /cart HTTP/1.1\r\nHost: shop.example.com\r\n\r\n");
        let scope = FilterScope::RequestHeaderReceivedFromClient;

        apply(SetVariableAction::new("env", "staging", scope), scope, &mut ex).await;
        apply(
            FileAppendAction::new(
                &path,
                "${exchange.id} ${request.method} ${authority.host}${request.path} ${user.env} ${unknown.x}",
                scope,
            ),
            scope,
            &mut ex,
        )
        .await;

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "42 POST shop.example.com/cart staging \n");
    }
}
