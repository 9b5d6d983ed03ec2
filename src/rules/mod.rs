//! Rule engine
//!
//! A [`Rule`] pairs a [`Filter`] with an [`Action`]. Rules are evaluated in
//! declaration order (built-in rules first, then user rules) at fixed points of
//! the exchange lifecycle. An action runs only at its own scope, or at every
//! scope when it declares [`FilterScope::OutOfScope`].
//!
//! Actions never edit headers in place: they append [`HeaderAlteration`]s to the
//! context, replayed when the header is serialized.
//!
//! [`HeaderAlteration`]: crate::exchange::HeaderAlteration

pub mod actions;
pub mod config;
pub mod filters;

pub use actions::*;
pub use config::{load_rules, parse_rules};
pub use filters::*;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

use crate::authority::Authority;
use crate::connection::Connection;
use crate::error::RuleExecutionFailure;
use crate::exchange::{Exchange, ExchangeContext};

/// Points of the exchange lifecycle where rules are evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterScope {
    OnAuthorityReceived,
    RequestHeaderReceivedFromClient,
    DnsSolveDone,
    RequestBodyReceivedFromClient,
    ResponseHeaderReceivedFromRemote,
    /// Evaluated at every scope
    OutOfScope,
}

impl FilterScope {
    /// Whether an action declared with `self` runs at `current`
    pub fn runs_at(self, current: FilterScope) -> bool {
        self == current || self == FilterScope::OutOfScope
    }
}

/// What a filter can look at
pub struct FilterInput<'a> {
    pub authority: &'a Authority,
    pub context: &'a ExchangeContext,
    /// Absent at authority scopes
    pub exchange: Option<&'a Exchange>,
    pub connection: Option<&'a Connection>,
}

/// Predicate over an exchange or an authority
pub trait Filter: Send + Sync + fmt::Debug {
    fn apply(&self, input: &FilterInput<'_>) -> bool;
}

/// What an action may mutate
pub struct ActionTarget<'a> {
    pub authority: Authority,
    pub context: &'a mut ExchangeContext,
    pub exchange: Option<&'a mut Exchange>,
    pub connection: Option<&'a Connection>,
}

#[async_trait]
pub trait Action: Send + Sync + fmt::Debug {
    /// Name used in logs and failures
    fn name(&self) -> &'static str;

    fn scope(&self) -> FilterScope;

    async fn alter(&self, target: &mut ActionTarget<'_>) -> Result<(), RuleExecutionFailure>;
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub filter: Arc<dyn Filter>,
    pub action: Arc<dyn Action>,
}

impl Rule {
    pub fn new(filter: impl Filter + 'static, action: impl Action + 'static) -> Self {
        Self {
            filter: Arc::new(filter),
            action: Arc::new(action),
        }
    }
}

/// Ordered rule set shared by every connection
pub struct RuleEngine {
    fixed: Vec<Rule>,
    user: Vec<Rule>,
    effective: OnceLock<Vec<Rule>>,
}

impl fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleEngine")
            .field("fixed", &self.fixed.len())
            .field("user", &self.user.len())
            .finish()
    }
}

impl RuleEngine {
    pub fn new(fixed: Vec<Rule>, user: Vec<Rule>) -> Self {
        Self {
            fixed,
            user,
            effective: OnceLock::new(),
        }
    }

    /// Built-in rules followed by user rules
    pub fn effective(&self) -> &[Rule] {
        self.effective
            .get_or_init(|| self.fixed.iter().chain(self.user.iter()).cloned().collect())
    }

    /// Evaluate rules where no exchange exists yet (CONNECT, DNS resolution)
    pub async fn enforce_on_authority(
        &self,
        scope: FilterScope,
        context: &mut ExchangeContext,
        authority: &Authority,
    ) {
        for rule in self.effective() {
            if !rule.action.scope().runs_at(scope) {
                continue;
            }
            let input = FilterInput {
                authority,
                context,
                exchange: None,
                connection: None,
            };
            if !rule.filter.apply(&input) {
                continue;
            }

            let mut target = ActionTarget {
                authority: authority.clone(),
                context: &mut *context,
                exchange: None,
                connection: None,
            };
            run(rule, scope, &mut target).await;
        }
    }

    /// Evaluate rules against an exchange. The context is moved out during
    /// evaluation so actions can mutate it next to the exchange.
    pub async fn enforce_on_exchange(
        &self,
        scope: FilterScope,
        exchange: &mut Exchange,
        connection: Option<&Connection>,
    ) {
        let mut context = std::mem::take(&mut exchange.context);
        for rule in self.effective() {
            if !rule.action.scope().runs_at(scope) {
                continue;
            }
            let matched = {
                let input = FilterInput {
                    authority: &exchange.authority,
                    context: &context,
                    exchange: Some(&*exchange),
                    connection,
                };
                rule.filter.apply(&input)
            };
            if !matched {
                continue;
            }

            let mut target = ActionTarget {
                authority: exchange.authority.clone(),
                context: &mut context,
                exchange: Some(&mut *exchange),
                connection,
            };
            run(rule, scope, &mut target).await;
        }
        exchange.context = context;
    }
}

async fn run(rule: &Rule, scope: FilterScope, target: &mut ActionTarget<'_>) {
    debug!(
        action = rule.action.name(),
        scope = ?scope,
        authority = %target.authority,
        "Applying rule"
    );
    if let Err(e) = rule.action.alter(target).await {
        warn!(
            action = rule.action.name(),
            authority = %target.authority,
            error = %e,
            "Rule action failed"
        );
    }
}

/// Rules every runtime carries ahead of user rules
pub fn builtin_rules(skip_global_ssl_decryption: bool, ca_certificate_pem: String) -> Vec<Rule> {
    let mut rules = Vec::new();
    if skip_global_ssl_decryption {
        rules.push(Rule::new(AnyFilter, SkipSslTunnelingAction));
    }

    let metrics_path = || PathFilter::new(StringSelector::exact("/metrics"));
    rules.push(Rule::new(
        FilterCollection::and(vec![
            Box::new(IsSelfFilter) as Box<dyn Filter>,
            Box::new(InvertedFilter::new(metrics_path())),
        ]),
        MountCertificateAuthorityAction::new(ca_certificate_pem),
    ));
    rules.push(Rule::new(
        FilterCollection::and(vec![
            Box::new(IsSelfFilter) as Box<dyn Filter>,
            Box::new(metrics_path()),
        ]),
        ServeMetricsAction,
    ));
    rules
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Request;
    use crate::http::body::Body;
    use crate::http::header::RequestHeader;

    fn exchange(raw: &[u8]) -> Exchange {
        let header = RequestHeader::parse(raw, false, None).unwrap();
        Exchange::new(
            1,
            Authority::new("example.com", 80, false),
            ExchangeContext::new(),
            Request::new(header, Body::empty()),
        )
    }

    #[derive(Debug)]
    struct Failing;

    #[async_trait]
    impl Action for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn scope(&self) -> FilterScope {
            FilterScope::OutOfScope
        }

        async fn alter(&self, _target: &mut ActionTarget<'_>) -> Result<(), RuleExecutionFailure> {
            Err(RuleExecutionFailure::action("failing", "always"))
        }
    }

    #[test]
    fn test_scope_matching() {
        assert!(FilterScope::DnsSolveDone.runs_at(FilterScope::DnsSolveDone));
        assert!(FilterScope::OutOfScope.runs_at(FilterScope::OnAuthorityReceived));
        assert!(!FilterScope::OnAuthorityReceived.runs_at(FilterScope::DnsSolveDone));
    }

    #[tokio::test]
    async fn test_skip_ssl_rule_at_authority_scope() {
        let engine = RuleEngine::new(
            Vec::new(),
            vec![Rule::new(
                HostFilter::new(StringSelector::exact("example.com")),
                SkipSslTunnelingAction,
            )],
        );
        let mut context = ExchangeContext::new();
        engine
            .enforce_on_authority(
                FilterScope::RequestHeaderReceivedFromClient,
                &mut context,
                &Authority::new("example.com", 443, true),
            )
            .await;
        assert!(!context.blind_mode);

        engine
            .enforce_on_authority(
                FilterScope::OnAuthorityReceived,
                &mut context,
                &Authority::new("EXAMPLE.com", 443, true),
            )
            .await;
        assert!(context.blind_mode);

        let mut other = ExchangeContext::new();
        engine
            .enforce_on_authority(
                FilterScope::OnAuthorityReceived,
                &mut other,
                &Authority::new("other.com", 443, true),
            )
            .await;
        assert!(!other.blind_mode);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_later_rules() {
        let engine = RuleEngine::new(
            Vec::new(),
            vec![
                Rule::new(AnyFilter, Failing),
                Rule::new(AnyFilter, AddRequestHeaderAction::new("X-After", "1")),
            ],
        );
        let mut ex = exchange(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");
        engine
            .enforce_on_exchange(FilterScope::RequestHeaderReceivedFromClient, &mut ex, None)
            .await;
        assert_eq!(ex.context.request_header_alterations.len(), 1);
    }

    #[tokio::test]
    async fn test_builtin_rules_order() {
        let engine = RuleEngine::new(builtin_rules(true, "PEM".into()), Vec::new());
        assert_eq!(engine.effective().len(), 3);
        assert_eq!(engine.effective()[0].action.name(), "skip_ssl_tunneling");

        let mut ex = exchange(b"GET / HTTP/1.1\r\nHost: 127.0.0.1:44344\r\n\r\n");
        ex.context.is_self = true;
        engine
            .enforce_on_exchange(FilterScope::RequestHeaderReceivedFromClient, &mut ex, None)
            .await;
        let response = ex.context.pre_made_response.as_ref().unwrap();
        assert_eq!(&response.body[..], b"PEM");

        let mut metrics = exchange(b"GET /metrics HTTP/1.1\r\nHost: 127.0.0.1:44344\r\n\r\n");
        metrics.context.is_self = true;
        engine
            .enforce_on_exchange(FilterScope::RequestHeaderReceivedFromClient, &mut metrics, None)
            .await;
        let response = metrics.context.pre_made_response.as_ref().unwrap();
        assert!(response
            .headers
            .iter()
            .any(|(n, v)| n == "Content-Type" && v.starts_with("text/plain")));
    }
}
