//! Core type definitions for DataSaver
//!
//! Resource types mirror the declarative engine's vocabulary; asset categories
//! are the coarser buckets statistics are kept in.

use serde::{Deserialize, Serialize};

// =============================================================================
// Resource Types
// =============================================================================

/// Resource type as understood by the interception engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    MainFrame,
    SubFrame,
    Stylesheet,
    Script,
    Image,
    Font,
    Object,
    Xmlhttprequest,
    Ping,
    CspReport,
    Media,
    Websocket,
    Webtransport,
    Webbundle,
    Other,
}

impl ResourceType {
    /// Every resource type, in engine order.
    pub const ALL: [ResourceType; 15] = [
        ResourceType::MainFrame,
        ResourceType::SubFrame,
        ResourceType::Stylesheet,
        ResourceType::Script,
        ResourceType::Image,
        ResourceType::Font,
        ResourceType::Object,
        ResourceType::Xmlhttprequest,
        ResourceType::Ping,
        ResourceType::CspReport,
        ResourceType::Media,
        ResourceType::Websocket,
        ResourceType::Webtransport,
        ResourceType::Webbundle,
        ResourceType::Other,
    ];

    /// Parse from browser request type string.
    pub fn from_name(s: &str) -> Self {
        match s {
            "main_frame" | "document" => Self::MainFrame,
            "sub_frame" | "subdocument" => Self::SubFrame,
            "stylesheet" | "css" => Self::Stylesheet,
            "script" => Self::Script,
            "image" | "imageset" => Self::Image,
            "font" => Self::Font,
            "object" => Self::Object,
            "xmlhttprequest" | "xhr" | "fetch" => Self::Xmlhttprequest,
            "ping" | "beacon" => Self::Ping,
            "csp_report" => Self::CspReport,
            "media" => Self::Media,
            "websocket" => Self::Websocket,
            "webtransport" => Self::Webtransport,
            "webbundle" => Self::Webbundle,
            _ => Self::Other,
        }
    }
}

// =============================================================================
// Asset Categories
// =============================================================================

/// Statistics bucket for an observed asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetCategory {
    Audio,
    Font,
    Html,
    Image,
    Other,
    Script,
    Style,
    Video,
}

impl AssetCategory {
    pub const ALL: [AssetCategory; 8] = [
        AssetCategory::Audio,
        AssetCategory::Font,
        AssetCategory::Html,
        AssetCategory::Image,
        AssetCategory::Other,
        AssetCategory::Script,
        AssetCategory::Style,
        AssetCategory::Video,
    ];

    /// Category from a network-layer resource type.
    pub fn from_resource_type(resource_type: ResourceType) -> Self {
        match resource_type {
            ResourceType::MainFrame | ResourceType::SubFrame => Self::Html,
            ResourceType::Stylesheet => Self::Style,
            ResourceType::Script => Self::Script,
            ResourceType::Image => Self::Image,
            ResourceType::Font => Self::Font,
            ResourceType::Media => Self::Video,
            _ => Self::Other,
        }
    }

    /// Category from a performance-timing `initiatorType`. Coarser than the
    /// network layer: `link` and `fetch` carry no type information.
    pub fn from_initiator_type(initiator: &str) -> Self {
        match initiator {
            "img" | "image" | "input" => Self::Image,
            "css" => Self::Style,
            "script" => Self::Script,
            "audio" => Self::Audio,
            "video" | "track" => Self::Video,
            "iframe" | "frame" | "navigation" => Self::Html,
            _ => Self::Other,
        }
    }

    /// Refine a category using a response `content-type`.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        let (top, sub) = mime.split_once('/')?;
        let category = match (top, sub) {
            ("image", _) => Self::Image,
            ("audio", _) => Self::Audio,
            ("video", _) => Self::Video,
            ("font", _) => Self::Font,
            ("text", "html") | ("application", "xhtml+xml") => Self::Html,
            ("text", "css") => Self::Style,
            ("text", "javascript") | ("application", "javascript") => Self::Script,
            ("application", s) if s.starts_with("font") || s.starts_with("x-font") => Self::Font,
            _ => Self::Other,
        };
        Some(category)
    }

    /// Resource types this category covers, used when a block rule targets a
    /// whole category.
    pub fn resource_types(self) -> &'static [ResourceType] {
        match self {
            Self::Audio | Self::Video => &[ResourceType::Media],
            Self::Font => &[ResourceType::Font],
            Self::Html => &[ResourceType::SubFrame],
            Self::Image => &[ResourceType::Image],
            Self::Script => &[ResourceType::Script],
            Self::Style => &[ResourceType::Stylesheet],
            Self::Other => &[
                ResourceType::Object,
                ResourceType::Xmlhttprequest,
                ResourceType::Ping,
                ResourceType::Websocket,
                ResourceType::Other,
            ],
        }
    }
}

// =============================================================================
// Capability Groups
// =============================================================================

bitflags::bitflags! {
    /// Groups of rules reconciled together. Each group owns a disjoint set
    /// of rule IDs and is serialized independently.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u8 {
        /// Image compression (simple, proxy and web-request modes)
        const COMPRESSION = 1 << 0;
        /// Content-Security-Policy header removal
        const BYPASS_CSP = 1 << 1;
        /// Save-Data request header
        const SAVE_DATA = 1 << 2;
        /// User block lists
        const BLOCK = 1 << 3;
        /// Loop prevention and format exemptions
        const EXEMPTIONS = 1 << 4;

        const ALL = Self::COMPRESSION.bits()
            | Self::BYPASS_CSP.bits()
            | Self::SAVE_DATA.bits()
            | Self::BLOCK.bits()
            | Self::EXEMPTIONS.bits();
    }
}
