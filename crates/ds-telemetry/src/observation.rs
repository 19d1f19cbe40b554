//! Raw observations from the two network sources, and the merged record
//! handed to the aggregator.

use serde::{Deserialize, Serialize};

use ds_core::{AssetCategory, Origin, ResourceType};

/// One completed resource load as reported by the resource-timing source.
/// Exact byte count, weak type classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceObservation {
    pub url: String,
    /// The timing entry's initiator type (`img`, `script`, `css`, ...).
    pub initiator_type: String,
    /// Zero means the resource came from cache.
    pub transfer_size: u64,
    #[serde(default)]
    pub page_origin: Option<Origin>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpHeader {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// One completed request as reported by the request-completion source.
/// Reliable type classification, byte count only via headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkObservation {
    pub url: String,
    #[serde(default)]
    pub response_headers: Vec<HttpHeader>,
    #[serde(alias = "resourceCategory")]
    pub resource_type: ResourceType,
    #[serde(default)]
    pub from_cache: bool,
    #[serde(default, alias = "initiatorOrigin")]
    pub initiator: Option<Origin>,
}

impl NetworkObservation {
    /// First header named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.response_headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.trim())
    }

    fn header_u64(&self, name: &str) -> Option<u64> {
        self.header(name)?.parse().ok()
    }

    fn category(&self) -> AssetCategory {
        self.header("content-type")
            .and_then(AssetCategory::from_content_type)
            .unwrap_or_else(|| AssetCategory::from_resource_type(self.resource_type))
    }

    /// Bytes on the wire, or zero when served from cache or unknown.
    fn bytes(&self) -> u64 {
        if self.from_cache {
            return 0;
        }
        self.header_u64("content-length").unwrap_or(0)
    }
}

/// A settled observation of one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BandwidthObservation {
    pub url: String,
    pub category: AssetCategory,
    pub bytes: u64,
    /// Bytes the compression step saved, when the response says so.
    pub bytes_saved: Option<u64>,
    /// Origin of the asset itself.
    pub asset_origin: Option<Origin>,
    /// Origin of the page that loaded the asset.
    pub page_origin: Option<Origin>,
}

/// Merge whatever the two sources reported for one URL.
///
/// The network source decides the category, the timing source the byte
/// count. Records without a usable byte count are dropped.
pub fn merge(
    url: &str,
    performance: Option<&PerformanceObservation>,
    network: Option<&NetworkObservation>,
) -> Option<BandwidthObservation> {
    let category = match (network, performance) {
        (Some(net), _) => net.category(),
        (None, Some(perf)) => AssetCategory::from_initiator_type(&perf.initiator_type),
        (None, None) => return None,
    };

    let bytes = performance
        .map(|p| p.transfer_size)
        .filter(|&b| b > 0)
        .or_else(|| network.map(NetworkObservation::bytes))
        .unwrap_or(0);
    if bytes == 0 {
        return None;
    }

    let bytes_saved = network.and_then(|net| {
        net.header_u64("x-bytes-saved").or_else(|| {
            net.header_u64("x-original-size")
                .map(|original| original.saturating_sub(bytes))
        })
    });

    Some(BandwidthObservation {
        url: url.to_string(),
        category,
        bytes,
        bytes_saved: bytes_saved.filter(|&s| s > 0),
        asset_origin: Origin::parse(url),
        page_origin: performance
            .and_then(|p| p.page_origin.clone())
            .or_else(|| network.and_then(|n| n.initiator.clone())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://cdn.example.com/a.png";

    fn perf(size: u64) -> PerformanceObservation {
        PerformanceObservation {
            url: URL.to_string(),
            initiator_type: "script".to_string(),
            transfer_size: size,
            page_origin: Origin::parse("https://example.com"),
        }
    }

    fn net(headers: &[(&str, &str)]) -> NetworkObservation {
        NetworkObservation {
            url: URL.to_string(),
            response_headers: headers
                .iter()
                .map(|(n, v)| HttpHeader {
                    name: n.to_string(),
                    value: v.to_string(),
                })
                .collect(),
            resource_type: ResourceType::Image,
            from_cache: false,
            initiator: Origin::parse("https://other.com"),
        }
    }

    #[test]
    fn test_performance_only() {
        let merged = merge(URL, Some(&perf(1200)), None).unwrap();
        assert_eq!(merged.bytes, 1200);
        assert_eq!(merged.category, AssetCategory::Script);
        assert_eq!(merged.bytes_saved, None);
        assert_eq!(merged.page_origin.unwrap().as_str(), "https://example.com");
        assert_eq!(merged.asset_origin.unwrap().as_str(), "https://cdn.example.com");
    }

    #[test]
    fn test_both_sources_prefer_network_type_and_timing_bytes() {
        let n = net(&[("Content-Length", "999"), ("Content-Type", "image/webp")]);
        let merged = merge(URL, Some(&perf(1200)), Some(&n)).unwrap();
        assert_eq!(merged.category, AssetCategory::Image);
        assert_eq!(merged.bytes, 1200);
        assert_eq!(merged.page_origin.unwrap().as_str(), "https://example.com");
    }

    #[test]
    fn test_cached_timing_falls_back_to_content_length() {
        let n = net(&[("content-length", "640")]);
        let merged = merge(URL, Some(&perf(0)), Some(&n)).unwrap();
        assert_eq!(merged.bytes, 640);
        assert_eq!(merged.category, AssetCategory::Image);
    }

    #[test]
    fn test_no_usable_bytes_is_dropped() {
        assert!(merge(URL, Some(&perf(0)), None).is_none());
        let mut cached = net(&[("content-length", "640")]);
        cached.from_cache = true;
        assert!(merge(URL, None, Some(&cached)).is_none());
        assert!(merge(URL, None, Some(&net(&[]))).is_none());
        assert!(merge(URL, None, None).is_none());
    }

    #[test]
    fn test_bytes_saved_from_headers() {
        let n = net(&[("content-length", "400"), ("X-Original-Size", "1000")]);
        assert_eq!(merge(URL, None, Some(&n)).unwrap().bytes_saved, Some(600));

        let n = net(&[("content-length", "400"), ("x-bytes-saved", "50"), ("x-original-size", "1000")]);
        assert_eq!(merge(URL, None, Some(&n)).unwrap().bytes_saved, Some(50));

        let n = net(&[("content-length", "400"), ("x-original-size", "100")]);
        assert_eq!(merge(URL, None, Some(&n)).unwrap().bytes_saved, None);
    }

    #[test]
    fn test_network_json_shape() {
        let json = r#"{
            "url": "https://a.com/x.js",
            "responseHeaders": [{ "name": "content-length", "value": "10" }],
            "resourceType": "script",
            "initiator": "https://b.com"
        }"#;
        let n: NetworkObservation = serde_json::from_str(json).unwrap();
        assert_eq!(n.resource_type, ResourceType::Script);
        assert!(!n.from_cache);
        assert_eq!(n.header("Content-Length"), Some("10"));
    }

    #[test]
    fn test_network_json_source_field_names() {
        let json = r#"{
            "url": "https://a.com/x.png",
            "resourceCategory": "image",
            "fromCache": true,
            "initiatorOrigin": "https://b.com"
        }"#;
        let n: NetworkObservation = serde_json::from_str(json).unwrap();
        assert_eq!(n.resource_type, ResourceType::Image);
        assert!(n.from_cache);
        assert_eq!(n.initiator.unwrap().as_str(), "https://b.com");
    }
}
