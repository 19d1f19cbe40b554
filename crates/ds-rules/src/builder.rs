//! Rule builders
//!
//! Pure functions from settings to rules. Nothing here touches the store or
//! the engine.

use ds_core::config::{global_ids, priority, site_bases, static_ids, DERIVED_ID_FLOOR, LOOP_MARKER, MAX_BLOCK_RULES, SITE_OFFSET_SPACE};
use ds_core::rule::{HeaderInfo, Redirect};
use ds_core::settings::{
    BlockSettings, BlockTarget, CompressionEndpoint, CompressionMode, CompressionSettings, GeneralSettings,
    ProxySettings,
};
use ds_core::{derive_rule_ids, Capabilities, Origin, ResourceType, Rule, RuleAction, RuleCondition};
use serde::{Deserialize, Serialize};

use crate::redirect::{endpoint_template, proxy_template, CAPTURE_REGEX};

// =============================================================================
// Capabilities
// =============================================================================

/// A single-rule capability with one global slot and one per-site range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    CompressionSimple,
    CompressionProxy,
    CompressionWebRequest,
    BypassCsp,
    SaveData,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::CompressionSimple,
        Capability::CompressionProxy,
        Capability::CompressionWebRequest,
        Capability::BypassCsp,
        Capability::SaveData,
    ];

    pub fn group(self) -> Capabilities {
        match self {
            Capability::CompressionSimple | Capability::CompressionProxy | Capability::CompressionWebRequest => {
                Capabilities::COMPRESSION
            }
            Capability::BypassCsp => Capabilities::BYPASS_CSP,
            Capability::SaveData => Capabilities::SAVE_DATA,
        }
    }

    /// Capabilities reconciled as part of `group`.
    pub fn in_group(group: Capabilities) -> impl Iterator<Item = Capability> {
        Self::ALL.into_iter().filter(move |c| group.contains(c.group()))
    }

    pub fn global_id(self) -> u32 {
        match self {
            Capability::CompressionSimple => global_ids::COMPRESSION_SIMPLE,
            Capability::CompressionProxy => global_ids::COMPRESSION_PROXY,
            Capability::CompressionWebRequest => global_ids::COMPRESSION_WEB_REQUEST,
            Capability::BypassCsp => global_ids::BYPASS_CSP,
            Capability::SaveData => global_ids::SAVE_DATA,
        }
    }

    pub fn site_base(self) -> u32 {
        match self {
            Capability::CompressionSimple => site_bases::COMPRESSION_SIMPLE,
            Capability::CompressionProxy => site_bases::COMPRESSION_PROXY,
            Capability::CompressionWebRequest => site_bases::COMPRESSION_WEB_REQUEST,
            Capability::BypassCsp => site_bases::BYPASS_CSP,
            Capability::SaveData => site_bases::SAVE_DATA,
        }
    }

    pub fn site_id(self, offset: u32) -> u32 {
        self.site_base() + offset
    }

    /// Whether `id` lies in this capability's per-site range.
    pub fn owns_site_id(self, id: u32) -> bool {
        (self.site_base()..self.site_base() + SITE_OFFSET_SPACE).contains(&id)
    }

    fn compression_mode(self) -> Option<CompressionMode> {
        match self {
            Capability::CompressionSimple => Some(CompressionMode::Simple),
            Capability::CompressionProxy => Some(CompressionMode::Proxy),
            Capability::CompressionWebRequest => Some(CompressionMode::WebRequest),
            Capability::BypassCsp | Capability::SaveData => None,
        }
    }

    /// Whether the capability should have a live rule under these settings.
    pub fn is_active(self, settings: &ScopeSettings) -> bool {
        let general = &settings.general;
        if !general.enabled {
            return false;
        }
        match self {
            Capability::BypassCsp => general.bypass_csp,
            Capability::SaveData => general.save_data,
            // Web-request mode redirects from a blocking listener, not a
            // declarative rule.
            Capability::CompressionWebRequest => false,
            _ => general.compression && self.compression_mode() == Some(settings.compression.mode),
        }
    }

    /// Build the rule for one scope, or None when the capability is inactive.
    pub fn build(self, id: u32, scope: &RuleScope, settings: &ScopeSettings) -> Option<Rule> {
        if !self.is_active(settings) {
            return None;
        }
        let priority = scope.redirect_priority();
        match self {
            Capability::CompressionSimple => Some(simple_compression_rule(
                id,
                priority,
                scope,
                &settings.compression,
            )),
            Capability::CompressionProxy => Some(proxy_compression_rule(
                id,
                priority,
                scope,
                &settings.proxy,
                &settings.compression,
            )),
            Capability::CompressionWebRequest => None,
            Capability::BypassCsp => Some(bypass_csp_rule(id, scope)),
            Capability::SaveData => Some(save_data_rule(id, scope)),
        }
    }
}

/// Group owning a rule ID, or None for IDs no group manages.
pub fn owning_group(id: u32) -> Option<Capabilities> {
    if (1..=static_ids::LAST).contains(&id) {
        return Some(Capabilities::EXEMPTIONS);
    }
    if let Some(cap) = Capability::ALL
        .into_iter()
        .find(|c| c.global_id() == id || c.owns_site_id(id))
    {
        return Some(cap.group());
    }
    if global_block_ids().contains(&id) || id >= DERIVED_ID_FLOOR {
        return Some(Capabilities::BLOCK);
    }
    None
}

// =============================================================================
// Scopes
// =============================================================================

/// The settings that shape one scope's rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeSettings {
    pub general: GeneralSettings,
    pub compression: CompressionSettings,
    pub proxy: ProxySettings,
    #[serde(rename = "blockRules")]
    pub block: BlockSettings,
}

/// Which initiators a rule applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleScope {
    /// Every initiator except the listed hosts.
    Global { excluded: Vec<String> },
    /// Only requests initiated by this host.
    Site { host: String },
}

impl RuleScope {
    fn apply(&self, condition: RuleCondition) -> RuleCondition {
        match self {
            RuleScope::Global { excluded } => condition.excluding_initiators(excluded.clone()),
            RuleScope::Site { host } => condition.with_initiators(vec![host.clone()]),
        }
    }

    fn redirect_priority(&self) -> u32 {
        match self {
            RuleScope::Global { .. } => priority::GLOBAL_REDIRECT,
            RuleScope::Site { .. } => priority::SITE_REDIRECT,
        }
    }
}

// =============================================================================
// Capability Rules
// =============================================================================

fn regex_redirect(substitution: String) -> RuleAction {
    RuleAction::Redirect {
        redirect: Redirect {
            url: None,
            regex_substitution: Some(substitution),
        },
    }
}

pub fn simple_compression_rule(id: u32, priority: u32, scope: &RuleScope, compression: &CompressionSettings) -> Rule {
    let template = endpoint_template(compression.preferred_endpoint, compression);
    Rule {
        id,
        priority,
        condition: scope.apply(
            RuleCondition::default()
                .with_regex(CAPTURE_REGEX)
                .with_resource_types(&[ResourceType::Image]),
        ),
        action: regex_redirect(template.to_substitution()),
    }
}

pub fn proxy_compression_rule(
    id: u32,
    priority: u32,
    scope: &RuleScope,
    proxy: &ProxySettings,
    compression: &CompressionSettings,
) -> Rule {
    let template = proxy_template(proxy, compression);
    Rule {
        id,
        priority,
        condition: scope.apply(
            RuleCondition::default()
                .with_regex(CAPTURE_REGEX)
                .with_resource_types(&[ResourceType::Image]),
        ),
        action: regex_redirect(template.to_substitution()),
    }
}

pub fn bypass_csp_rule(id: u32, scope: &RuleScope) -> Rule {
    Rule {
        id,
        priority: priority::HEADERS,
        condition: scope.apply(
            RuleCondition::default().with_resource_types(&[ResourceType::MainFrame, ResourceType::SubFrame]),
        ),
        action: RuleAction::ModifyHeaders {
            request_headers: None,
            response_headers: Some(vec![
                HeaderInfo::remove("content-security-policy"),
                HeaderInfo::remove("content-security-policy-report-only"),
            ]),
        },
    }
}

pub fn save_data_rule(id: u32, scope: &RuleScope) -> Rule {
    Rule {
        id,
        priority: priority::HEADERS,
        condition: scope.apply(RuleCondition::default()),
        action: RuleAction::ModifyHeaders {
            request_headers: Some(vec![HeaderInfo::set("Save-Data", "on")]),
            response_headers: None,
        },
    }
}

// =============================================================================
// Block Rules
// =============================================================================

pub fn global_block_ids() -> std::ops::Range<u32> {
    global_ids::BLOCK_FIRST..global_ids::BLOCK_FIRST + MAX_BLOCK_RULES as u32
}

/// Rule IDs reserved for one site's block list. Hash-derived, so they are
/// stable without any allocation state.
pub fn site_block_ids(origin: &Origin) -> Vec<u32> {
    let mut seen = std::collections::BTreeSet::new();
    derive_rule_ids(origin.as_str(), MAX_BLOCK_RULES * 2)
        .into_iter()
        .filter(|&id| id >= DERIVED_ID_FLOOR && seen.insert(id))
        .take(MAX_BLOCK_RULES)
        .collect()
}

fn block_condition(target: &BlockTarget) -> Option<RuleCondition> {
    match target {
        BlockTarget::ResourceType { category } => {
            Some(RuleCondition::default().with_resource_types(category.resource_types()))
        }
        BlockTarget::Extension { extension } => {
            let ext = extension.trim_start_matches('.').to_ascii_lowercase();
            Some(RuleCondition::default().with_regex(format!(r"^https?://[^?#]*\.{ext}(?:[?#].*)?$")))
        }
        BlockTarget::UrlPattern { pattern } => Some(RuleCondition::default().with_url_filter(pattern.trim())),
        BlockTarget::Mime { pattern } => {
            log::debug!("Skipping MIME block rule '{pattern}': not expressible before the response");
            None
        }
    }
}

/// Compile the enabled, expressible entries of a block list onto `ids`.
pub fn block_rules(ids: &[u32], scope: &RuleScope, block: &BlockSettings) -> Vec<Rule> {
    block
        .rules
        .iter()
        .filter(|r| r.enabled)
        .filter_map(|r| block_condition(&r.target))
        .zip(ids)
        .map(|(condition, &id)| Rule {
            id,
            priority: priority::BLOCK,
            condition: scope.apply(condition),
            action: RuleAction::Block,
        })
        .collect()
}

// =============================================================================
// Exemption Rules
// =============================================================================

fn allow(id: u32, condition: RuleCondition) -> Rule {
    Rule {
        id,
        priority: priority::EXEMPTION,
        condition,
        action: RuleAction::Allow,
    }
}

/// Static allow rules that outrank every redirect and header rule, but not
/// user block rules: the loop marker, formats that must not be recompressed,
/// compression endpoints themselves, and the user's denylist.
pub fn exemption_rules(compression: &CompressionSettings, proxy: &ProxySettings) -> Vec<Rule> {
    let mut rules = vec![
        allow(
            static_ids::LOOP_PREVENTION,
            RuleCondition::default().with_regex(format!("#{LOOP_MARKER}$")),
        ),
        allow(
            static_ids::FAVICON_EXEMPTION,
            RuleCondition::default()
                .with_regex(r"/favicon[^/?#]*$|/favicon[^/]*[?#]")
                .with_resource_types(&[ResourceType::Image]),
        ),
        allow(
            static_ids::SVG_EXEMPTION,
            RuleCondition::default()
                .with_regex(r"^[^?#]*\.svg(?:[?#].*)?$")
                .with_resource_types(&[ResourceType::Image]),
        ),
    ];

    let mut endpoint_hosts: Vec<String> = CompressionEndpoint::ALL.iter().map(|e| e.host().to_string()).collect();
    if proxy.origin().is_some() {
        endpoint_hosts.push(proxy.host.clone());
    }
    rules.push(allow(
        static_ids::ENDPOINT_EXEMPTION,
        RuleCondition::default().with_request_domains(endpoint_hosts),
    ));

    if !compression.denylist.is_empty() {
        rules.push(allow(
            static_ids::DENYLIST_EXEMPTION,
            RuleCondition::default()
                .with_request_domains(compression.denylist.clone())
                .with_resource_types(&[ResourceType::Image]),
        ));
    }
    rules
}

#[cfg(test)]
mod tests {
    use super::*;
    use ds_core::settings::{BlockRule, ImageFormat};
    use ds_core::AssetCategory;
    use serde_json::json;

    fn global() -> RuleScope {
        RuleScope::Global {
            excluded: vec!["optout.com".to_string()],
        }
    }

    fn site() -> RuleScope {
        RuleScope::Site {
            host: "news.example.com".to_string(),
        }
    }

    #[test]
    fn test_capability_ranges() {
        assert_eq!(Capability::CompressionSimple.site_id(5), 10_005);
        assert!(Capability::BypassCsp.owns_site_id(49_999));
        assert!(!Capability::BypassCsp.owns_site_id(50_000));
        assert_eq!(owning_group(3), Some(Capabilities::EXEMPTIONS));
        assert_eq!(owning_group(101), Some(Capabilities::COMPRESSION));
        assert_eq!(owning_group(20_500), Some(Capabilities::COMPRESSION));
        assert_eq!(owning_group(104), Some(Capabilities::SAVE_DATA));
        assert_eq!(owning_group(250), Some(Capabilities::BLOCK));
        assert_eq!(owning_group(DERIVED_ID_FLOOR + 7), Some(Capabilities::BLOCK));
        assert_eq!(owning_group(150), None);
        assert_eq!(owning_group(0), None);
    }

    #[test]
    fn test_compression_activation_follows_mode() {
        let mut settings = ScopeSettings::default();
        assert!(Capability::CompressionSimple.is_active(&settings));
        assert!(!Capability::CompressionProxy.is_active(&settings));

        settings.compression.mode = CompressionMode::Proxy;
        assert!(!Capability::CompressionSimple.is_active(&settings));
        assert!(Capability::CompressionProxy.is_active(&settings));

        settings.compression.mode = CompressionMode::WebRequest;
        assert!(Capability::ALL[..3].iter().all(|c| !c.is_active(&settings)));

        settings.compression.mode = CompressionMode::Simple;
        settings.general.enabled = false;
        assert!(Capability::ALL.iter().all(|c| !c.is_active(&settings)));
    }

    #[test]
    fn test_global_simple_rule() {
        let settings = ScopeSettings::default();
        let rule = Capability::CompressionSimple
            .build(global_ids::COMPRESSION_SIMPLE, &global(), &settings)
            .unwrap();
        assert_eq!(rule.priority, priority::GLOBAL_REDIRECT);
        assert_eq!(rule.condition.excluded_initiator_domains, Some(vec!["optout.com".to_string()]));
        assert_eq!(rule.condition.resource_types, Some(vec![ResourceType::Image]));
        let RuleAction::Redirect { redirect } = &rule.action else {
            panic!("expected redirect");
        };
        let sub = redirect.regex_substitution.as_deref().unwrap();
        assert!(sub.starts_with("https://wsrv.nl/?q=60&output=webp"));
        assert!(sub.ends_with("#ds-loop"));
    }

    #[test]
    fn test_site_rule_is_scoped_and_outranks_global() {
        let mut settings = ScopeSettings::default();
        settings.compression.format = ImageFormat::Avif;
        let rule = Capability::CompressionSimple.build(10_005, &site(), &settings).unwrap();
        assert_eq!(rule.id, 10_005);
        assert_eq!(rule.condition.initiator_domains, Some(vec!["news.example.com".to_string()]));
        assert!(rule.condition.excluded_initiator_domains.is_none());
        assert!(rule.priority > priority::GLOBAL_REDIRECT);
    }

    #[test]
    fn test_header_rules() {
        let csp = bypass_csp_rule(global_ids::BYPASS_CSP, &global());
        let value = serde_json::to_value(&csp.action).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "modifyHeaders",
                "responseHeaders": [
                    { "header": "content-security-policy", "operation": "remove" },
                    { "header": "content-security-policy-report-only", "operation": "remove" }
                ]
            })
        );

        let save = save_data_rule(50_001, &site());
        assert_eq!(save.condition.initiator_domains, Some(vec!["news.example.com".to_string()]));
    }

    #[test]
    fn test_block_rules_skip_disabled_and_mime() {
        let block = BlockSettings {
            rules: vec![
                BlockRule {
                    target: BlockTarget::ResourceType {
                        category: AssetCategory::Video,
                    },
                    enabled: true,
                    min_size: 0,
                },
                BlockRule {
                    target: BlockTarget::Mime {
                        pattern: "image/*".to_string(),
                    },
                    enabled: true,
                    min_size: 0,
                },
                BlockRule {
                    target: BlockTarget::Extension {
                        extension: ".GIF".to_string(),
                    },
                    enabled: false,
                    min_size: 0,
                },
                BlockRule {
                    target: BlockTarget::UrlPattern {
                        pattern: "||ads.example^".to_string(),
                    },
                    enabled: true,
                    min_size: 0,
                },
            ],
        };
        let ids: Vec<u32> = global_block_ids().collect();
        let rules = block_rules(&ids, &global(), &block);
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].id, 200);
        assert_eq!(rules[0].condition.resource_types, Some(vec![ResourceType::Media]));
        assert_eq!(rules[1].id, 201);
        assert_eq!(rules[1].condition.url_filter.as_deref(), Some("||ads.example^"));
        assert!(rules.iter().all(|r| r.action == RuleAction::Block));
    }

    #[test]
    fn test_extension_regex() {
        let condition = block_condition(&BlockTarget::Extension {
            extension: "gif".to_string(),
        })
        .unwrap();
        let re = regex::Regex::new(condition.regex_filter.as_deref().unwrap()).unwrap();
        assert!(re.is_match("https://a.com/x/y.gif"));
        assert!(re.is_match("https://a.com/y.gif?v=1"));
        assert!(!re.is_match("https://a.com/y.gif.png"));
        assert!(!re.is_match("https://a.com/?file=y.gif"));
    }

    #[test]
    fn test_site_block_ids_stable_and_clear_of_fixed_ranges() {
        let origin = Origin::parse("https://example.com").unwrap();
        let ids = site_block_ids(&origin);
        assert_eq!(ids.len(), MAX_BLOCK_RULES);
        assert_eq!(ids, site_block_ids(&origin));
        assert!(ids.iter().all(|&id| owning_group(id) == Some(Capabilities::BLOCK)));
        assert!(ids.iter().all(|&id| id >= DERIVED_ID_FLOOR));
    }

    #[test]
    fn test_exemptions() {
        let compression = CompressionSettings {
            denylist: vec!["nocompress.com".to_string()],
            ..CompressionSettings::default()
        };
        let rules = exemption_rules(&compression, &ProxySettings::default());
        let ids: Vec<u32> = rules.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert!(rules.iter().all(|r| r.priority == priority::EXEMPTION));
        assert_eq!(
            rules[3].condition.request_domains,
            Some(vec!["wsrv.nl".to_string(), "i0.wp.com".to_string(), "localhost".to_string()])
        );

        let loop_re = regex::Regex::new(rules[0].condition.regex_filter.as_deref().unwrap()).unwrap();
        assert!(loop_re.is_match("https://a.com/x.png#ds-loop"));
        assert!(!loop_re.is_match("https://a.com/x.png"));

        let svg_re = regex::Regex::new(rules[2].condition.regex_filter.as_deref().unwrap()).unwrap();
        assert!(svg_re.is_match("https://a.com/logo.svg?x=1"));
        assert!(!svg_re.is_match("https://a.com/logo.png?f=a.svg"));

        let without_denylist = exemption_rules(&CompressionSettings::default(), &ProxySettings::default());
        assert_eq!(without_denylist.len(), 4);
    }
}
