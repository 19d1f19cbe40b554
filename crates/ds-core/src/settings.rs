//! Settings model and storage keys
//!
//! Every persisted item implements [`SettingsItem`], which ties the type to
//! its [`SettingsKind`] at compile time. The kind determines the storage area
//! and key name; the type's `Default` is the fallback for missing or invalid
//! values.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::{MAX_BLOCK_RULES, SITE_OFFSET_SPACE};
use crate::error::ValidationError;
use crate::types::AssetCategory;
use crate::url::Origin;

// =============================================================================
// Scopes and Keys
// =============================================================================

/// Which settings a value applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    Global,
    Site(Origin),
}

impl Scope {
    pub fn origin(&self) -> Option<&Origin> {
        match self {
            Scope::Global => None,
            Scope::Site(origin) => Some(origin),
        }
    }
}

/// Persistence/sync semantics, delegated to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageArea {
    Local,
    Sync,
    Session,
    Managed,
}

impl StorageArea {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageArea::Local => "local",
            StorageArea::Sync => "sync",
            StorageArea::Session => "session",
            StorageArea::Managed => "managed",
        }
    }

    fn from_name(s: &str) -> Option<Self> {
        match s {
            "local" => Some(Self::Local),
            "sync" => Some(Self::Sync),
            "session" => Some(Self::Session),
            "managed" => Some(Self::Managed),
            _ => None,
        }
    }
}

/// Every kind of persisted item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingsKind {
    General,
    Compression,
    Proxy,
    BlockRules,
    Statistics,
}

impl SettingsKind {
    pub const ALL: [SettingsKind; 5] = [
        SettingsKind::General,
        SettingsKind::Compression,
        SettingsKind::Proxy,
        SettingsKind::BlockRules,
        SettingsKind::Statistics,
    ];

    pub fn area(self) -> StorageArea {
        match self {
            SettingsKind::Statistics => StorageArea::Local,
            _ => StorageArea::Sync,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SettingsKind::General => "general",
            SettingsKind::Compression => "compression",
            SettingsKind::Proxy => "proxy",
            SettingsKind::BlockRules => "block-rules",
            SettingsKind::Statistics => "statistics",
        }
    }
}

/// A fully-qualified storage key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SettingsKey {
    pub kind: SettingsKind,
    pub scope: Scope,
}

impl SettingsKey {
    pub fn global(kind: SettingsKind) -> Self {
        Self {
            kind,
            scope: Scope::Global,
        }
    }

    pub fn site(kind: SettingsKind, origin: Origin) -> Self {
        Self {
            kind,
            scope: Scope::Site(origin),
        }
    }

    /// Parse a rendered key. Unknown areas, names or origins yield None.
    pub fn parse(key: &str) -> Option<Self> {
        let (area, rest) = key.split_once(':')?;
        let area = StorageArea::from_name(area)?;

        for kind in SettingsKind::ALL {
            if kind.area() != area {
                continue;
            }
            let Some(tail) = rest.strip_prefix(kind.name()) else {
                continue;
            };
            if tail.is_empty() {
                return Some(Self::global(kind));
            }
            if let Some(origin) = tail.strip_prefix('-') {
                return Origin::parse(origin).map(|origin| Self::site(kind, origin));
            }
        }
        None
    }
}

impl fmt::Display for SettingsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Scope::Global => write!(f, "{}:{}", self.kind.area().as_str(), self.kind.name()),
            Scope::Site(origin) => write!(
                f,
                "{}:{}-{}",
                self.kind.area().as_str(),
                self.kind.name(),
                origin
            ),
        }
    }
}

/// A value persisted in the settings store.
pub trait SettingsItem:
    Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static
{
    const KIND: SettingsKind;

    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }
}

// =============================================================================
// General Settings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GeneralSettings {
    pub enabled: bool,
    pub compression: bool,
    pub bypass_csp: bool,
    pub no_autoplay: bool,
    pub lazy_load: bool,
    pub save_data: bool,
    /// Private rule-ID offset. `Some` opts the site out of the global rules.
    pub rule_id_offset: Option<u32>,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            compression: true,
            bypass_csp: false,
            no_autoplay: false,
            lazy_load: true,
            save_data: true,
            rule_id_offset: None,
        }
    }
}

impl SettingsItem for GeneralSettings {
    const KIND: SettingsKind = SettingsKind::General;

    fn validate(&self) -> Result<(), ValidationError> {
        match self.rule_id_offset {
            Some(offset) if offset >= SITE_OFFSET_SPACE => Err(ValidationError(format!(
                "ruleIdOffset {offset} outside 0..{SITE_OFFSET_SPACE}"
            ))),
            _ => Ok(()),
        }
    }
}

// =============================================================================
// Compression Settings
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Auto,
    Avif,
    Jpg,
    Webp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompressionMode {
    Simple,
    Proxy,
    WebRequest,
}

/// Public image-resizing endpoints usable in simple mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompressionEndpoint {
    #[serde(rename = "wsrv.nl")]
    WsrvNl,
    #[serde(rename = "i0.wp.com")]
    Jetpack,
}

impl CompressionEndpoint {
    pub const ALL: [CompressionEndpoint; 2] = [CompressionEndpoint::WsrvNl, CompressionEndpoint::Jetpack];

    pub fn host(self) -> &'static str {
        match self {
            CompressionEndpoint::WsrvNl => "wsrv.nl",
            CompressionEndpoint::Jetpack => "i0.wp.com",
        }
    }

    pub fn origin(self) -> Origin {
        Origin::from_normalized(format!("https://{}", self.host()))
    }

    /// The endpoint used when this one fails.
    pub fn fallback(self) -> Option<CompressionEndpoint> {
        match self {
            CompressionEndpoint::WsrvNl => Some(CompressionEndpoint::Jetpack),
            CompressionEndpoint::Jetpack => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CompressionSettings {
    pub format: ImageFormat,
    pub mode: CompressionMode,
    pub preferred_endpoint: CompressionEndpoint,
    pub preserve_anim: bool,
    pub quality: u8,
    /// Hosts whose images are never compressed.
    pub denylist: Vec<String>,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            format: ImageFormat::Webp,
            mode: CompressionMode::Simple,
            preferred_endpoint: CompressionEndpoint::WsrvNl,
            preserve_anim: true,
            quality: 60,
            denylist: Vec::new(),
        }
    }
}

impl SettingsItem for CompressionSettings {
    const KIND: SettingsKind = SettingsKind::Compression;

    fn validate(&self) -> Result<(), ValidationError> {
        if !(1..=100).contains(&self.quality) {
            return Err(ValidationError(format!("quality {} outside 1..=100", self.quality)));
        }
        if let Some(bad) = self.denylist.iter().find(|h| !is_valid_host(h)) {
            return Err(ValidationError(format!("invalid denylist host '{bad}'")));
        }
        Ok(())
    }
}

// =============================================================================
// Proxy Settings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub host: String,
    pub port: u16,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 9090,
        }
    }
}

impl ProxySettings {
    /// Origin of the companion proxy, if the settings describe one.
    pub fn origin(&self) -> Option<Origin> {
        Origin::parse(&format!("http://{}:{}", self.host.trim(), self.port))
    }
}

impl SettingsItem for ProxySettings {
    const KIND: SettingsKind = SettingsKind::Proxy;

    fn validate(&self) -> Result<(), ValidationError> {
        let host = self.host.trim();
        if host.is_empty() || host != self.host {
            return Err(ValidationError("proxy host must be a non-empty trimmed string".into()));
        }
        if self.port == 0 {
            return Err(ValidationError("proxy port must be in 1..=65535".into()));
        }
        if self.origin().is_none() {
            return Err(ValidationError(format!("invalid proxy host '{host}'")));
        }
        Ok(())
    }
}

// =============================================================================
// Block Rules
// =============================================================================

/// What a block rule matches on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BlockTarget {
    ResourceType { category: AssetCategory },
    Extension { extension: String },
    Mime { pattern: String },
    UrlPattern { pattern: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockRule {
    #[serde(flatten)]
    pub target: BlockTarget,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Informational; byte size is unknown before the fetch.
    #[serde(default)]
    pub min_size: u64,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockSettings {
    pub rules: Vec<BlockRule>,
}

impl SettingsItem for BlockSettings {
    const KIND: SettingsKind = SettingsKind::BlockRules;

    fn validate(&self) -> Result<(), ValidationError> {
        if self.rules.len() > MAX_BLOCK_RULES {
            return Err(ValidationError(format!(
                "{} block rules exceeds the limit of {MAX_BLOCK_RULES}",
                self.rules.len()
            )));
        }
        for rule in &self.rules {
            match &rule.target {
                BlockTarget::Extension { extension } => {
                    let ext = extension.trim_start_matches('.');
                    if ext.is_empty() || !ext.bytes().all(|b| b.is_ascii_alphanumeric()) {
                        return Err(ValidationError(format!("invalid extension '{extension}'")));
                    }
                }
                BlockTarget::Mime { pattern } | BlockTarget::UrlPattern { pattern } => {
                    if pattern.trim().is_empty() {
                        return Err(ValidationError("empty block pattern".into()));
                    }
                }
                BlockTarget::ResourceType { .. } => {}
            }
        }
        Ok(())
    }
}

fn is_valid_host(host: &str) -> bool {
    !host.is_empty()
        && host
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn origin(s: &str) -> Origin {
        Origin::parse(s).unwrap()
    }

    #[test]
    fn test_key_rendering() {
        assert_eq!(SettingsKey::global(SettingsKind::General).to_string(), "sync:general");
        assert_eq!(
            SettingsKey::site(SettingsKind::Statistics, origin("https://a.com")).to_string(),
            "local:statistics-https://a.com"
        );
    }

    #[test]
    fn test_key_parse_roundtrip() {
        let keys = [
            SettingsKey::global(SettingsKind::BlockRules),
            SettingsKey::site(SettingsKind::BlockRules, origin("https://my-site.com")),
            SettingsKey::site(SettingsKind::Compression, origin("http://localhost:3000")),
        ];
        for key in keys {
            assert_eq!(SettingsKey::parse(&key.to_string()), Some(key));
        }
    }

    #[test]
    fn test_key_parse_rejects_mismatch() {
        assert_eq!(SettingsKey::parse("local:general"), None);
        assert_eq!(SettingsKey::parse("sync:generalx"), None);
        assert_eq!(SettingsKey::parse("sync:general-not an origin"), None);
        assert_eq!(SettingsKey::parse("nope"), None);
    }

    #[test]
    fn test_general_defaults_from_partial_json() {
        let settings: GeneralSettings =
            serde_json::from_value(json!({ "enabled": false, "ruleIdOffset": 5 })).unwrap();
        assert!(!settings.enabled);
        assert!(settings.compression);
        assert_eq!(settings.rule_id_offset, Some(5));
        assert!(settings.validate().is_ok());

        let bad = GeneralSettings {
            rule_id_offset: Some(SITE_OFFSET_SPACE),
            ..GeneralSettings::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_compression_serde_names() {
        let settings: CompressionSettings = serde_json::from_value(json!({
            "format": "avif",
            "mode": "WEB_REQUEST",
            "preferredEndpoint": "i0.wp.com",
            "quality": 40
        }))
        .unwrap();
        assert_eq!(settings.format, ImageFormat::Avif);
        assert_eq!(settings.mode, CompressionMode::WebRequest);
        assert_eq!(settings.preferred_endpoint, CompressionEndpoint::Jetpack);
        assert!(settings.denylist.is_empty());
    }

    #[test]
    fn test_compression_quality_bounds() {
        let mut settings = CompressionSettings::default();
        settings.quality = 0;
        assert!(settings.validate().is_err());
        settings.quality = 100;
        assert!(settings.validate().is_ok());
        settings.quality = 101;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_proxy_validation() {
        assert!(ProxySettings::default().validate().is_ok());
        let padded = ProxySettings {
            host: " proxy.lan".into(),
            port: 80,
        };
        assert!(padded.validate().is_err());
        let zero = ProxySettings {
            host: "proxy.lan".into(),
            port: 0,
        };
        assert!(zero.validate().is_err());
        assert_eq!(
            ProxySettings::default().origin().unwrap().as_str(),
            "http://localhost:9090"
        );
    }

    #[test]
    fn test_block_rule_tagged_json() {
        let settings: BlockSettings = serde_json::from_value(json!({
            "rules": [
                { "kind": "resourceType", "category": "font" },
                { "kind": "extension", "extension": "gif", "enabled": false, "minSize": 1024 },
                { "kind": "urlPattern", "pattern": "||ads.example^" }
            ]
        }))
        .unwrap();
        assert_eq!(settings.rules.len(), 3);
        assert!(settings.rules[0].enabled);
        assert_eq!(
            settings.rules[0].target,
            BlockTarget::ResourceType {
                category: AssetCategory::Font
            }
        );
        assert_eq!(settings.rules[1].min_size, 1024);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_endpoint_origins() {
        assert_eq!(CompressionEndpoint::WsrvNl.origin().as_str(), "https://wsrv.nl");
        assert_eq!(CompressionEndpoint::WsrvNl.fallback(), Some(CompressionEndpoint::Jetpack));
    }
}
