//! Resource-URL rewriting for stored post HTML.
//!
//! Stored content keeps image and attachment paths relative; the render
//! transform makes them absolute under the configured resource server and the
//! upload transform strips that prefix back off, so the pair round-trips.
//! Already-absolute, `data:`, `file:` and fragment/query-prefixed sources
//! pass through untouched.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use url::Url;

use crate::models::Id;

static RE_PASSTHROUGH_SRC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(https?:|data:|file:|/|\.|#|\?)").unwrap());
static RE_CARET_ALT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\^.*\^$").unwrap());
static RE_QUERY_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\?.*").unwrap());
static RE_VIDEO_HREF: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.(mp4|avi)$").unwrap());
static RE_HTTP_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^https?:").unwrap());

static RE_IMG_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<img\b[^>]*>").unwrap());
static RE_A_ELEMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<a\b[^>]*>.*?</a>").unwrap());
static RE_A_OPEN_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<a\b[^>]*>").unwrap());

static RE_ATTR_SRC: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\ssrc\s*=\s*"([^"]*)""#).unwrap());
static RE_ATTR_DATA_SRC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\sdata-src\s*=\s*"([^"]*)""#).unwrap());
static RE_ATTR_ALT: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\salt\s*=\s*"([^"]*)""#).unwrap());
static RE_ATTR_HREF: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\shref\s*=\s*"([^"]*)""#).unwrap());
static RE_ATTR_STYLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\sstyle\s*=\s*"([^"]*)""#).unwrap());

/// Marker span (kept empty by the editor) whose inline style applies to the
/// element that follows it. A markdown authoring extension for
/// font/color/alignment.
static RE_NEXT_NODE_STYLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<span([^>]*\bdata-next-node-style\b[^>]*)>\s*</span>\s*<(\w+)([^>]*)>"#)
        .unwrap()
});
static RE_EMPTY_STYLE_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<span[^>]*\bdata-next-node-style\b[^>]*>\s*</span>"#).unwrap()
});
static RE_EMPTY_PARAGRAPH: Lazy<Regex> = Lazy::new(|| Regex::new(r"<p>\s*</p>").unwrap());

/// Short-lived credential appended to attachment links so the resource
/// server can authorize the download. The token is the first 8 characters of
/// the viewer's login token.
#[derive(Debug, Clone)]
pub struct ResourceAuth {
    pub uid: Id,
    pub token: String,
}

#[derive(Debug, Clone, Default)]
pub struct RenderOptions {
    pub transform_attachment_link: bool,
    pub auth: Option<ResourceAuth>,
}

#[derive(Debug, Clone)]
pub struct ResourceUrlConfig {
    base_url: String,
}

impl ResourceUrlConfig {
    pub fn new(base_url: &str) -> Self {
        let mut base_url = base_url.to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self { base_url }
    }

    pub fn from_env() -> Self {
        let raw = std::env::var("MBBS_RESOURCE_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:8080/resources/".to_string());
        if Url::parse(&raw).is_err() {
            tracing::warn!("MBBS_RESOURCE_BASE_URL is not a valid absolute url: {raw}");
        }
        Self::new(&raw)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

fn append_resource_base_url(
    cfg: &ResourceUrlConfig,
    src: &str,
    auth: Option<&ResourceAuth>,
) -> String {
    if src.is_empty() {
        return String::new();
    }
    if RE_PASSTHROUGH_SRC.is_match(src) {
        return src.to_string();
    }
    let mut absolute = format!("{}{}", cfg.base_url, src);
    if let Some(auth) = auth {
        absolute = RE_QUERY_SUFFIX.replace(&absolute, "").into_owned();
        let token: String = auth.token.chars().take(8).collect();
        absolute.push_str(&format!("?uid={}&token={}", auth.uid, token));
    }
    absolute
}

fn remove_resource_base_url(cfg: &ResourceUrlConfig, src: &str) -> String {
    match src.strip_prefix(&cfg.base_url) {
        Some(rest) => rest.to_string(),
        None => src.to_string(),
    }
}

fn get_attr(re: &Regex, tag: &str) -> Option<String> {
    re.captures(tag).map(|c| c[1].to_string())
}

fn set_attr(re: &Regex, tag: &str, name: &str, value: &str) -> String {
    if re.is_match(tag) {
        re.replace(tag, |_: &Captures| format!(" {name}=\"{value}\""))
            .into_owned()
    } else if let Some(stripped) = tag.strip_suffix("/>") {
        format!("{} {name}=\"{value}\"/>", stripped.trim_end())
    } else if let Some(stripped) = tag.strip_suffix('>') {
        format!("{stripped} {name}=\"{value}\">")
    } else {
        tag.to_string()
    }
}

fn remove_attr(re: &Regex, tag: &str) -> String {
    re.replace(tag, "").into_owned()
}

/// Prepares stored HTML for rendering: image sources become absolute under
/// the resource base, marker images skip lazy loading, attachment links get
/// the base prefix plus an auth token, and `data-next-node-style` markers
/// push their style onto the following element.
pub fn transform_will_render_html(
    cfg: &ResourceUrlConfig,
    html: &str,
    opts: &RenderOptions,
) -> String {
    let mut out = RE_IMG_TAG
        .replace_all(html, |caps: &Captures| {
            let tag = &caps[0];
            let src = get_attr(&RE_ATTR_SRC, tag);
            let data_src = get_attr(&RE_ATTR_DATA_SRC, tag);
            let alt = get_attr(&RE_ATTR_ALT, tag).unwrap_or_default();

            let is_inline_data = data_src
                .as_deref()
                .map(|s| s.starts_with("data:image"))
                .unwrap_or(false);
            // marker images (alt="^...^") render eagerly, no lazy loading
            if is_inline_data || RE_CARET_ALT.is_match(&alt) {
                let eager = data_src.or(src).unwrap_or_default();
                let tag = remove_attr(&RE_ATTR_DATA_SRC, tag);
                return set_attr(&RE_ATTR_SRC, &tag, "src", &eager);
            }

            let mut tag = tag.to_string();
            if let Some(src) = src {
                let abs = append_resource_base_url(cfg, &src, None);
                tag = set_attr(&RE_ATTR_SRC, &tag, "src", &abs);
            }
            if let Some(data_src) = data_src {
                let abs = append_resource_base_url(cfg, &data_src, None);
                tag = set_attr(&RE_ATTR_DATA_SRC, &tag, "data-src", &abs);
            }
            tag
        })
        .into_owned();

    out = RE_NEXT_NODE_STYLE
        .replace_all(&out, |caps: &Captures| {
            let marker_attrs = &caps[1];
            let next_tag = &caps[2];
            let next_attrs = &caps[3];
            let style = RE_ATTR_STYLE
                .captures(&format!(" {marker_attrs}"))
                .map(|c| c[1].to_string())
                .unwrap_or_default();
            if style.is_empty() {
                return caps[0].to_string();
            }
            let next_open = format!("<{next_tag}{next_attrs}>");
            let styled = set_attr(&RE_ATTR_STYLE, &next_open, "style", &style);
            format!("<span{marker_attrs}></span>{styled}")
        })
        .into_owned();

    if opts.transform_attachment_link {
        out = RE_A_ELEMENT
            .replace_all(&out, |caps: &Captures| {
                let element = &caps[0];
                let open_tag = match RE_A_OPEN_TAG.find(element) {
                    Some(m) => m.as_str(),
                    None => return element.to_string(),
                };
                let href = match get_attr(&RE_ATTR_HREF, open_tag) {
                    Some(h) => h,
                    None => return element.to_string(),
                };
                let is_video = RE_VIDEO_HREF.is_match(&href);
                let absolute = append_resource_base_url(cfg, &href, opts.auth.as_ref());
                if is_video {
                    return format!(
                        "<video src=\"{absolute}\" controls preload=\"none\"></video>"
                    );
                }
                let rewritten = set_attr(&RE_ATTR_HREF, open_tag, "href", &absolute);
                element.replacen(open_tag, &rewritten, 1)
            })
            .into_owned();
    }

    out
}

/// Normalizes editor HTML for storage: strips the resource base prefix from
/// image and link targets, prefixes bare-domain links with http://, and drops
/// marker elements whose style ended up empty.
pub fn transform_render_html_for_upload(cfg: &ResourceUrlConfig, html: &str) -> String {
    let mut out = RE_IMG_TAG
        .replace_all(html, |caps: &Captures| {
            let mut tag = caps[0].to_string();
            if let Some(src) = get_attr(&RE_ATTR_SRC, &tag) {
                let rel = remove_resource_base_url(cfg, &src);
                tag = set_attr(&RE_ATTR_SRC, &tag, "src", &rel);
            }
            if let Some(data_src) = get_attr(&RE_ATTR_DATA_SRC, &tag) {
                let rel = remove_resource_base_url(cfg, &data_src);
                tag = set_attr(&RE_ATTR_DATA_SRC, &tag, "data-src", &rel);
            }
            tag
        })
        .into_owned();

    out = RE_A_ELEMENT
        .replace_all(&out, |caps: &Captures| {
            let element = &caps[0];
            let open_tag = match RE_A_OPEN_TAG.find(element) {
                Some(m) => m.as_str(),
                None => return element.to_string(),
            };
            let href = match get_attr(&RE_ATTR_HREF, open_tag) {
                Some(h) if !h.is_empty() => h,
                _ => return element.to_string(),
            };
            let mut url = remove_resource_base_url(cfg, &href);
            let bare_domain = url
                .split('/')
                .next()
                .map(|seg| seg.contains('.'))
                .unwrap_or(false);
            if !RE_HTTP_PREFIX.is_match(&url) && bare_domain {
                url = format!("http://{url}");
            }
            let rewritten = set_attr(&RE_ATTR_HREF, open_tag, "href", &url);
            element.replacen(open_tag, &rewritten, 1)
        })
        .into_owned();

    // markers that never received a style are editor leftovers
    out = RE_EMPTY_STYLE_MARKER
        .replace_all(&out, |caps: &Captures| {
            if RE_ATTR_STYLE
                .captures(&caps[0])
                .map(|c| !c[1].is_empty())
                .unwrap_or(false)
            {
                caps[0].to_string()
            } else {
                String::new()
            }
        })
        .into_owned();
    out = RE_EMPTY_PARAGRAPH.replace_all(&out, "").into_owned();

    out
}
