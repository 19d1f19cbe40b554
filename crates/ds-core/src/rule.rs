//! Declarative rule model
//!
//! Rules are plain data evaluated by the host's interception engine. The
//! serialized shape follows the engine's JSON: camelCase fields, a `type`
//! tag on actions, absent optional fields omitted.

use serde::{Deserialize, Serialize};

use crate::types::ResourceType;

/// A single declarative rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: u32,
    pub priority: u32,
    pub condition: RuleCondition,
    pub action: RuleAction,
}

/// Conditions a request must satisfy for a rule to apply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleCondition {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub url_filter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub regex_filter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub initiator_domains: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub excluded_initiator_domains: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub request_domains: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub resource_types: Option<Vec<ResourceType>>,
}

impl RuleCondition {
    pub fn with_regex(mut self, regex: impl Into<String>) -> Self {
        self.regex_filter = Some(regex.into());
        self
    }

    pub fn with_url_filter(mut self, filter: impl Into<String>) -> Self {
        self.url_filter = Some(filter.into());
        self
    }

    pub fn with_resource_types(mut self, types: &[ResourceType]) -> Self {
        self.resource_types = Some(types.to_vec());
        self
    }

    pub fn with_initiators(mut self, domains: Vec<String>) -> Self {
        self.initiator_domains = Some(domains);
        self
    }

    pub fn with_request_domains(mut self, domains: Vec<String>) -> Self {
        self.request_domains = Some(domains);
        self
    }

    /// Exclude the given initiator domains. An empty list leaves the field
    /// unset, since the engine rejects empty exclusion arrays.
    pub fn excluding_initiators(mut self, domains: Vec<String>) -> Self {
        self.excluded_initiator_domains = if domains.is_empty() { None } else { Some(domains) };
        self
    }
}

/// What a matching rule does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RuleAction {
    Allow,
    Block,
    Redirect {
        redirect: Redirect,
    },
    ModifyHeaders {
        #[serde(rename = "requestHeaders", skip_serializing_if = "Option::is_none", default)]
        request_headers: Option<Vec<HeaderInfo>>,
        #[serde(rename = "responseHeaders", skip_serializing_if = "Option::is_none", default)]
        response_headers: Option<Vec<HeaderInfo>>,
    },
}

/// Redirect target: either a fixed URL or a regex substitution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Redirect {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub regex_substitution: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderOperation {
    Append,
    Set,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderInfo {
    pub header: String,
    pub operation: HeaderOperation,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<String>,
}

impl HeaderInfo {
    pub fn set(header: &str, value: &str) -> Self {
        Self {
            header: header.to_string(),
            operation: HeaderOperation::Set,
            value: Some(value.to_string()),
        }
    }

    pub fn remove(header: &str) -> Self {
        Self {
            header: header.to_string(),
            operation: HeaderOperation::Remove,
            value: None,
        }
    }
}

// =============================================================================
// Rule Updates
// =============================================================================

/// One call's worth of changes for the interception engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleUpdate {
    pub add_rules: Vec<Rule>,
    pub remove_rule_ids: Vec<u32>,
}

impl RuleUpdate {
    /// Replace whatever occupies `rule.id` with `rule`.
    pub fn replace(rule: Rule) -> Self {
        Self {
            remove_rule_ids: vec![rule.id],
            add_rules: vec![rule],
        }
    }

    /// Remove the given IDs.
    pub fn remove(ids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            add_rules: Vec::new(),
            remove_rule_ids: ids.into_iter().collect(),
        }
    }

    /// Fold another update into this one. Removals are deduplicated.
    pub fn merge(&mut self, other: RuleUpdate) {
        for id in other.remove_rule_ids {
            if !self.remove_rule_ids.contains(&id) {
                self.remove_rule_ids.push(id);
            }
        }
        self.add_rules.extend(other.add_rules);
    }

    pub fn is_empty(&self) -> bool {
        self.add_rules.is_empty() && self.remove_rule_ids.is_empty()
    }

    /// Every rule ID this update touches.
    pub fn touched_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.remove_rule_ids
            .iter()
            .copied()
            .chain(self.add_rules.iter().map(|r| r.id))
    }
}
