//! YAML rule files
//!
//! ```yaml
//! rules:
//!   - filter: { type: host, pattern: example.com, operation: ends_with }
//!     action: { type: skip_ssl_tunneling }
//!   - filter:
//!       type: collection
//!       operation: or
//!       children:
//!         - { type: method, method: POST }
//!         - { type: path, pattern: /admin, operation: starts_with, inverted: true }
//!     action: { type: add_request_header, name: X-Audited, value: "1" }
//! ```
//!
//! Static misconfiguration (bad regex, unreadable certificate, bad forward URL)
//! fails here, when the file is loaded.

use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use super::actions::*;
use super::filters::*;
use super::{Action, Filter, FilterScope, Rule};
use crate::error::RuleExecutionFailure;
use crate::exchange::PreMadeResponse;

#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: Vec<RuleConfig>,
}

#[derive(Debug, Deserialize)]
struct RuleConfig {
    filter: FilterConfig,
    action: ActionConfig,
}

#[derive(Debug, Deserialize)]
struct FilterConfig {
    #[serde(flatten)]
    kind: FilterKind,
    #[serde(default)]
    inverted: bool,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum FilterKind {
    Any,
    Host {
        pattern: String,
        #[serde(default)]
        operation: SelectorOperation,
        #[serde(default)]
        case_sensitive: bool,
    },
    Authority {
        host: String,
        port: u16,
    },
    Path {
        pattern: String,
        #[serde(default)]
        operation: SelectorOperation,
        #[serde(default)]
        case_sensitive: bool,
    },
    Method {
        method: String,
    },
    RequestHeader {
        name: String,
        pattern: String,
        #[serde(default)]
        operation: SelectorOperation,
        #[serde(default)]
        case_sensitive: bool,
    },
    ResponseHeader {
        name: String,
        pattern: String,
        #[serde(default)]
        operation: SelectorOperation,
        #[serde(default)]
        case_sensitive: bool,
    },
    StatusCode {
        min: u16,
        max: Option<u16>,
    },
    IsSelf,
    Collection {
        #[serde(default)]
        operation: CollectionOperation,
        #[serde(default)]
        children: Vec<FilterConfig>,
    },
}

#[derive(Debug, Deserialize)]
struct HeaderPair {
    name: String,
    value: String,
}

fn default_content_type() -> String {
    "text/plain".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ActionConfig {
    SkipSslTunneling,
    Forward {
        url: String,
    },
    SpoofDns {
        ip: IpAddr,
        port: Option<u16>,
    },
    AddRequestHeader {
        name: String,
        value: String,
    },
    UpdateRequestHeader {
        name: String,
        value: String,
        #[serde(default)]
        add_if_missing: bool,
    },
    DeleteRequestHeader {
        name: String,
    },
    AddResponseHeader {
        name: String,
        value: String,
    },
    UpdateResponseHeader {
        name: String,
        value: String,
        #[serde(default)]
        add_if_missing: bool,
    },
    DeleteResponseHeader {
        name: String,
    },
    ForceHttp11,
    ForceHttp2,
    SetClientCertificate {
        certificate_path: PathBuf,
        key_path: PathBuf,
    },
    SkipRemoteCertificateValidation,
    ApplyTag {
        tag: String,
    },
    ApplyComment {
        comment: String,
    },
    MockedResponse {
        status: u16,
        #[serde(default = "default_content_type")]
        content_type: String,
        #[serde(default)]
        body: String,
        #[serde(default)]
        headers: Vec<HeaderPair>,
    },
    SetVariable {
        name: String,
        value: String,
        scope: Option<FilterScope>,
    },
    FileAppend {
        path: PathBuf,
        text: String,
        scope: Option<FilterScope>,
    },
}

fn selector(
    pattern: String,
    operation: SelectorOperation,
    case_sensitive: bool,
) -> Result<StringSelector, RuleExecutionFailure> {
    StringSelector::new(pattern, operation, case_sensitive)
}

fn build_filter(config: FilterConfig) -> Result<Box<dyn Filter>, RuleExecutionFailure> {
    let filter: Box<dyn Filter> = match config.kind {
        FilterKind::Any => Box::new(AnyFilter),
        FilterKind::Host {
            pattern,
            operation,
            case_sensitive,
        } => Box::new(HostFilter::new(selector(pattern, operation, case_sensitive)?)),
        FilterKind::Authority { host, port } => Box::new(AuthorityFilter::new(host, port)),
        FilterKind::Path {
            pattern,
            operation,
            case_sensitive,
        } => Box::new(PathFilter::new(selector(pattern, operation, case_sensitive)?)),
        FilterKind::Method { method } => Box::new(MethodFilter::new(method)),
        FilterKind::RequestHeader {
            name,
            pattern,
            operation,
            case_sensitive,
        } => Box::new(RequestHeaderFilter::new(
            name,
            selector(pattern, operation, case_sensitive)?,
        )),
        FilterKind::ResponseHeader {
            name,
            pattern,
            operation,
            case_sensitive,
        } => Box::new(ResponseHeaderFilter::new(
            name,
            selector(pattern, operation, case_sensitive)?,
        )),
        FilterKind::StatusCode { min, max } => {
            Box::new(StatusCodeFilter::range(min, max.unwrap_or(min)))
        }
        FilterKind::IsSelf => Box::new(IsSelfFilter),
        FilterKind::Collection {
            operation,
            children,
        } => {
            let children = children
                .into_iter()
                .map(build_filter)
                .collect::<Result<Vec<_>, _>>()?;
            Box::new(FilterCollection::new(children, operation))
        }
    };

    if config.inverted {
        return Ok(Box::new(InvertedFilter::boxed(filter)));
    }
    Ok(filter)
}

fn build_rule(config: RuleConfig) -> Result<Rule, RuleExecutionFailure> {
    let filter = build_filter(config.filter)?;
    let action: Arc<dyn Action> = match config.action {
        ActionConfig::SkipSslTunneling => Arc::new(SkipSslTunnelingAction),
        ActionConfig::Forward { url } => Arc::new(ForwardAction::new(&url)?),
        ActionConfig::SpoofDns { ip, port } => Arc::new(SpoofDnsAction::new(ip, port)),
        ActionConfig::AddRequestHeader { name, value } => {
            Arc::new(AddRequestHeaderAction::new(name, value))
        }
        ActionConfig::UpdateRequestHeader {
            name,
            value,
            add_if_missing,
        } => Arc::new(UpdateRequestHeaderAction::new(name, value, add_if_missing)),
        ActionConfig::DeleteRequestHeader { name } => {
            Arc::new(DeleteRequestHeaderAction::new(name))
        }
        ActionConfig::AddResponseHeader { name, value } => {
            Arc::new(AddResponseHeaderAction::new(name, value))
        }
        ActionConfig::UpdateResponseHeader {
            name,
            value,
            add_if_missing,
        } => Arc::new(UpdateResponseHeaderAction::new(name, value, add_if_missing)),
        ActionConfig::DeleteResponseHeader { name } => {
            Arc::new(DeleteResponseHeaderAction::new(name))
        }
        ActionConfig::ForceHttp11 => Arc::new(ForceProtocolAction::http11()),
        ActionConfig::ForceHttp2 => Arc::new(ForceProtocolAction::http2()),
        ActionConfig::SetClientCertificate {
            certificate_path,
            key_path,
        } => Arc::new(SetClientCertificateAction::new(certificate_path, key_path)?),
        ActionConfig::SkipRemoteCertificateValidation => {
            Arc::new(SkipRemoteCertificateValidationAction)
        }
        ActionConfig::ApplyTag { tag } => Arc::new(ApplyTagAction::new(tag)),
        ActionConfig::ApplyComment { comment } => {
            Arc::new(ApplyCommentAction::new(comment))
        }
        ActionConfig::MockedResponse {
            status,
            content_type,
            body,
            headers,
        } => {
            let response = headers.into_iter().fold(
                PreMadeResponse::new(status, &content_type, body),
                |response, h| response.with_header(h.name, h.value),
            );
            Arc::new(MockedResponseAction::new(response))
        }
        ActionConfig::SetVariable { name, value, scope } => Arc::new(
            SetVariableAction::new(
                name,
                value,
                scope.unwrap_or(FilterScope::RequestHeaderReceivedFromClient),
            ),
        ),
        ActionConfig::FileAppend { path, text, scope } => Arc::new(
            FileAppendAction::new(
                path,
                text,
                scope.unwrap_or(FilterScope::ResponseHeaderReceivedFromRemote),
            ),
        ),
    };

    Ok(Rule {
        filter: Arc::from(filter),
        action,
    })
}

/// Build rules from YAML content
pub fn parse_rules(content: &str) -> Result<Vec<Rule>, RuleExecutionFailure> {
    let file: RuleFile =
        serde_yaml::from_str(content).map_err(|e| RuleExecutionFailure::Parse(e.to_string()))?;
    file.rules.into_iter().map(build_rule).collect()
}

/// Load rules from a YAML file
pub fn load_rules<P: AsRef<Path>>(path: P) -> Result<Vec<Rule>, RuleExecutionFailure> {
    let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
        RuleExecutionFailure::Read(format!("{}: {}", path.as_ref().display(), e))
    })?;
    let rules = parse_rules(&content)?;
    info!(
        path = %path.as_ref().display(),
        count = rules.len(),
        "Loaded rules"
    );
    Ok(rules)
}
