//! Redirect target templates
//!
//! A template is built once from settings as a list of literal text and
//! placeholders for parts of the original request URL. It renders two ways:
//! as the engine's regex substitution string, or as the concrete target for
//! one URL. Both come from the same pieces, so they cannot drift apart.

use ds_core::config::LOOP_MARKER;
use ds_core::settings::{CompressionEndpoint, CompressionSettings, ImageFormat, ProxySettings};
use ds_core::url::{strip_loop_marker, UrlParts};

/// Matches any http(s) URL and captures scheme, host with path, and query.
/// A trailing fragment is consumed so the substitution replaces the whole URL.
pub const CAPTURE_REGEX: &str = r"^(https?)://([^?#]+)(\?[^#]*)?(?:#.*)?$";

/// Part of the original URL a placeholder stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    /// The full URL without its fragment.
    OriginalUrl,
    /// Host with port followed by the path.
    HostAndPath,
}

impl Capture {
    fn substitution(self) -> &'static str {
        match self {
            Capture::OriginalUrl => r"\1://\2\3",
            Capture::HostAndPath => r"\2",
        }
    }

    fn render(self, parts: &UrlParts<'_>) -> String {
        match self {
            Capture::OriginalUrl => parts.without_fragment(),
            Capture::HostAndPath => parts.host_and_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Text(String),
    Capture(Capture),
}

/// A redirect target with placeholders for the original request URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RedirectTemplate {
    pieces: Vec<Piece>,
}

impl RedirectTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        let text = text.into();
        match self.pieces.last_mut() {
            Some(Piece::Text(prev)) => prev.push_str(&text),
            _ => self.pieces.push(Piece::Text(text)),
        }
        self
    }

    pub fn capture(mut self, capture: Capture) -> Self {
        self.pieces.push(Piece::Capture(capture));
        self
    }

    /// Append a `name=value` query parameter, with the separator.
    pub fn param(self, name: &str, value: impl std::fmt::Display) -> Self {
        let sep = self.separator();
        self.text(format!("{sep}{name}={value}"))
    }

    /// Append a query parameter whose value is a captured URL part.
    pub fn capture_param(self, name: &str, capture: Capture) -> Self {
        let sep = self.separator();
        self.text(format!("{sep}{name}=")).capture(capture)
    }

    /// Append a query parameter whose value is another template.
    pub fn nested_param(mut self, name: &str, nested: RedirectTemplate) -> Self {
        let sep = self.separator();
        self = self.text(format!("{sep}{name}="));
        for piece in nested.pieces {
            self = match piece {
                Piece::Text(text) => self.text(text),
                Piece::Capture(capture) => self.capture(capture),
            };
        }
        self
    }

    fn separator(&self) -> char {
        let has_query = self.pieces.iter().any(|p| matches!(p, Piece::Text(t) if t.contains('?')));
        if has_query {
            '&'
        } else {
            '?'
        }
    }

    /// Terminate with the loop marker so a failed fetch of the target is
    /// recognized and left alone.
    pub fn with_marker(self) -> Self {
        self.text(format!("#{LOOP_MARKER}"))
    }

    /// Serialize as a regex substitution for `CAPTURE_REGEX`.
    pub fn to_substitution(&self) -> String {
        self.pieces
            .iter()
            .map(|piece| match piece {
                Piece::Text(text) => text.replace('\\', r"\\"),
                Piece::Capture(capture) => capture.substitution().to_string(),
            })
            .collect()
    }

    /// Concrete target for `url`. Any loop marker on `url` is stripped first.
    /// Returns None for URLs the capture regex would not match.
    pub fn render_for(&self, url: &str) -> Option<String> {
        let parts = UrlParts::parse(strip_loop_marker(url))?;
        Some(
            self.pieces
                .iter()
                .map(|piece| match piece {
                    Piece::Text(text) => text.clone(),
                    Piece::Capture(capture) => capture.render(&parts),
                })
                .collect(),
        )
    }
}

// =============================================================================
// Targets
// =============================================================================

fn output_format(format: ImageFormat) -> Option<&'static str> {
    match format {
        ImageFormat::Auto => None,
        ImageFormat::Avif => Some("avif"),
        ImageFormat::Jpg => Some("jpg"),
        ImageFormat::Webp => Some("webp"),
    }
}

/// Target for a public resizing endpoint. The fallback endpoint, if any, is
/// embedded so the first endpoint can hand over when it cannot serve the
/// image.
pub fn endpoint_template(endpoint: CompressionEndpoint, settings: &CompressionSettings) -> RedirectTemplate {
    endpoint_target(endpoint, settings, true).with_marker()
}

fn endpoint_target(endpoint: CompressionEndpoint, settings: &CompressionSettings, embed_fallback: bool) -> RedirectTemplate {
    let base = RedirectTemplate::new().text(format!("https://{}/", endpoint.host()));
    match endpoint {
        CompressionEndpoint::WsrvNl => {
            let mut t = base.param("q", settings.quality);
            if let Some(output) = output_format(settings.format) {
                t = t.param("output", output);
            }
            if settings.preserve_anim {
                t = t.param("n", -1);
            }
            if embed_fallback {
                if let Some(fallback) = endpoint.fallback() {
                    t = t.nested_param("default", endpoint_target(fallback, settings, false));
                }
            }
            // Captures cannot be percent-encoded, so `&` pairs in the
            // original's query and the fallback's own `&strip=all` reach the
            // endpoint as top-level parameters. Keeping `url` last at least
            // keeps the original's path and first query pair intact.
            t.capture_param("url", Capture::OriginalUrl)
        }
        CompressionEndpoint::Jetpack => base
            .capture(Capture::HostAndPath)
            .param("quality", settings.quality)
            .param("strip", "all"),
    }
}

/// Target for the companion compression proxy.
pub fn proxy_template(proxy: &ProxySettings, settings: &CompressionSettings) -> RedirectTemplate {
    let jpeg = u8::from(settings.format == ImageFormat::Jpg);
    RedirectTemplate::new()
        .text(format!("http://{}:{}/", proxy.host, proxy.port))
        .param("l", settings.quality)
        .param("jpeg", jpeg)
        .param("bw", 0)
        .capture_param("url", Capture::OriginalUrl)
        .with_marker()
}
