//! Media URLs embedded in a rendered conversation page.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::MediaKind;

static MEDIA_TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<(?:video|source)\b[^>]*?\bsrc\s*=\s*["']([^"']+)["']"#).unwrap()
});

static SCRIPT_VIDEO_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https:(?:\\/\\/|//)video-[^"'\s<>]+?\.mp4[^"'\s<>]*"#).unwrap());

static CDN_VIDEO_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"https://video-[a-z0-9-]+\.xx\.fbcdn\.net/[^\s"'<>]+\.mp4[^\s"'<>]*"#).unwrap()
});

static CDN_IMAGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"https:(?:\\/\\/|//)scontent[^"'\s<>]*?\.fbcdn\.net(?:\\/|/)[^"'\s<>]+?\.(?:jpe?g|png|webp)[^"'\s<>]*"#)
        .unwrap()
});

/// Undoes the JSON and HTML escaping commonly found around embedded urls.
fn unescape(url: &str) -> String {
    url.replace("\\/", "/")
        .replace("\\u0025", "%")
        .replace("&amp;", "&")
        .trim_end_matches('\\')
        .to_string()
}

/// Every media url of `kind` found in `html`, in page order and without duplicates.
pub fn scrape_media_urls(html: &str, kind: MediaKind) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    let mut push = |url: String| {
        if !found.contains(&url) {
            found.push(url);
        }
    };

    match kind {
        MediaKind::Video => {
            for caps in MEDIA_TAG_RE.captures_iter(html) {
                let src = unescape(&caps[1]);
                if src.contains("fbcdn.net") {
                    push(src);
                }
            }
            for m in SCRIPT_VIDEO_RE.find_iter(html) {
                push(unescape(m.as_str()));
            }
            for m in CDN_VIDEO_RE.find_iter(html) {
                push(unescape(m.as_str()));
            }
        }
        MediaKind::Image => {
            for m in CDN_IMAGE_RE.find_iter(html) {
                push(unescape(m.as_str()));
            }
        }
    }
    found
}
