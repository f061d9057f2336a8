//! Derivation of download and result cache keys.
//!
//! Keys are plain strings built from escaped fields separated by `|`, so
//! distinct field values can never produce the same key. Every key starts
//! with the scheme version; bumping it orphans old entries instead of
//! letting them collide with new ones.

use std::fmt::Write as _;

use crate::domain::entities::{
    CacheKey, ImageRequest, Precision, RequestKeys, RequestOptions, Scale, Size,
};

/// Version tag prefixed to every derived key.
pub const KEY_SCHEME_VERSION: &str = "v1";

/// Derives cache keys from requests.
///
/// Pure: the same request always yields the same keys, and fields that
/// cannot change the output (listeners, headers, cache policies) are left
/// out.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheKeyCodec;

impl CacheKeyCodec {
    /// Creates a codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Key identifying the raw fetched bytes; decode options are ignored.
    #[must_use]
    pub fn download_key(&self, request: &ImageRequest) -> CacheKey {
        let key = match &request.options().disk_cache_key {
            Some(custom) => format!("{KEY_SCHEME_VERSION}|download-custom|{}", escape(custom)),
            None => format!("{KEY_SCHEME_VERSION}|download|{}", escape(request.data())),
        };
        CacheKey::new(key)
    }

    /// Key identifying the fully processed artifact.
    #[must_use]
    pub fn result_key(&self, request: &ImageRequest) -> CacheKey {
        let options = request.options();
        let mut key = String::with_capacity(request.data().len() + 64);

        if let Some(custom) = &options.memory_cache_key {
            let _ = write!(key, "{KEY_SCHEME_VERSION}|result-custom|{}", escape(custom));
        } else {
            let _ = write!(key, "{KEY_SCHEME_VERSION}|result|{}", escape(request.data()));
            write_decode_options(&mut key, options);
        }

        if !options.memory_cache_key_extras.is_empty() {
            key.push_str("|x=");
            let extras: Vec<String> = options
                .memory_cache_key_extras
                .iter()
                .map(|(k, v)| format!("{}:{}", escape(k), escape(v)))
                .collect();
            key.push_str(&extras.join(","));
        }

        CacheKey::new(key)
    }

    /// Derives both keys.
    #[must_use]
    pub fn keys(&self, request: &ImageRequest) -> RequestKeys {
        RequestKeys {
            download: self.download_key(request),
            result: self.result_key(request),
        }
    }
}

fn write_decode_options(key: &mut String, options: &RequestOptions) {
    match options.size {
        Size::Original => key.push_str("|size=original"),
        Size::Exact { width, height } => {
            let scale = match options.scale {
                Scale::Fit => "fit",
                Scale::Fill => "fill",
            };
            let precision = match options.effective_precision() {
                Precision::Exact => "exact",
                // Automatic is resolved above.
                Precision::Inexact | Precision::Automatic => "inexact",
            };
            let _ = write!(
                key,
                "|size={width}x{height}|scale={scale}|precision={precision}"
            );
        }
    }

    let _ = write!(key, "|color={}", color_tag(options));

    let transformations = options.transformation_keys();
    if !transformations.is_empty() {
        key.push_str("|t=");
        let escaped: Vec<String> = transformations.iter().map(|t| escape(t)).collect();
        key.push_str(&escaped.join(","));
    }
}

const fn color_tag(options: &RequestOptions) -> &'static str {
    use crate::domain::entities::ColorPolicy;
    match options.color {
        ColorPolicy::Native => "native",
        ColorPolicy::Rgba8 => "rgba8",
        ColorPolicy::Rgb8 => "rgb8",
        ColorPolicy::Luma8 => "luma8",
    }
}

/// Percent-escapes the separator characters used in keys.
fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '%' => out.push_str("%25"),
            '|' => out.push_str("%7C"),
            ',' => out.push_str("%2C"),
            ':' => out.push_str("%3A"),
            '=' => out.push_str("%3D"),
            _ => out.push(c),
        }
    }
    out
}
