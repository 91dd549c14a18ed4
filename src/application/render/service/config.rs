use std::{borrow::Cow, collections::HashSet};

use ammonia::Builder as AmmoniaBuilder;
use comrak::options::Options;

use super::GrammarExtensions;

pub(crate) fn compiler_options(extensions: &GrammarExtensions) -> Options<'static> {
    let mut options = Options::default();
    configure_extensions(&mut options, extensions);
    options
}

fn configure_extensions(options: &mut Options<'static>, extensions: &GrammarExtensions) {
    let ext = &mut options.extension;
    ext.strikethrough = true;
    ext.tagfilter = false;
    ext.table = true;
    ext.autolink = true;
    ext.tasklist = extensions.task_lists;
    ext.math_dollars = extensions.math;

    options.parse.smart = true;

    let render = &mut options.render;
    render.tasklist_classes = true;
    render.r#unsafe = true;
    render.sourcepos = false;
}

/// Tags the compiler may emit, plus the SVG and ruby sets needed by diagrams and annotations.
pub const DEFAULT_ALLOWED_TAGS: &[&str] = &[
    "p",
    "div",
    "span",
    "br",
    "h1",
    "h2",
    "h3",
    "h4",
    "h5",
    "h6",
    "strong",
    "b",
    "em",
    "i",
    "u",
    "del",
    "s",
    "code",
    "blockquote",
    "hr",
    "pre",
    "ul",
    "ol",
    "li",
    "table",
    "thead",
    "tbody",
    "tr",
    "th",
    "td",
    "a",
    "img",
    "body",
    "input",
    "style",
    "svg",
    "g",
    "path",
    "circle",
    "rect",
    "ellipse",
    "line",
    "polyline",
    "polygon",
    "text",
    "tspan",
    "defs",
    "marker",
    "use",
    "clipPath",
    "clippath",
    "foreignObject",
    "foreignobject",
    "switch",
    "ruby",
    "rt",
    "rp",
];

pub const DEFAULT_ALLOWED_ATTRIBUTES: &[&str] = &[
    "href",
    "src",
    "alt",
    "title",
    "colspan",
    "rowspan",
    "class",
    "data-task-index",
    "style",
    "id",
    "type",
    "checked",
    "disabled",
    "align",
    "role",
    "aria-hidden",
    "width",
    "height",
    "viewBox",
    "viewbox",
    "preserveAspectRatio",
    "preserveaspectratio",
    "xmlns",
    "x",
    "y",
    "dx",
    "dy",
    "fill",
    "stroke",
    "stroke-width",
    "stroke-dasharray",
    "transform",
    "d",
    "r",
    "cx",
    "cy",
    "x1",
    "y1",
    "x2",
    "y2",
    "points",
    "text-anchor",
    "dominant-baseline",
    "font-family",
    "font-size",
    "font-weight",
];

/// Never allowed, whatever the configured lists say.
const FORBIDDEN_TAGS: &[&str] = &[
    "script", "iframe", "object", "embed", "frame", "frameset", "base", "meta", "link", "noscript",
    "template", "applet",
];

const FORBIDDEN_ATTRIBUTES: &[&str] = &["srcdoc", "formaction"];

const URL_ATTRIBUTES: &[&str] = &["href", "src", "xlink:href", "action", "poster"];

const URL_SCHEMES: &[&str] = &[
    "http",
    "https",
    "mailto",
    "tel",
    "safe-file",
    "file",
    "blob",
    "data",
];

/// Tag and attribute allow-lists applied by the sanitiser stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizerPolicy {
    tags: HashSet<&'static str>,
    attributes: HashSet<&'static str>,
}

impl Default for SanitizerPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_TAGS, DEFAULT_ALLOWED_ATTRIBUTES)
    }
}

impl SanitizerPolicy {
    pub fn new(tags: &[&'static str], attributes: &[&'static str]) -> Self {
        let tags = tags
            .iter()
            .copied()
            .filter(|tag| !is_forbidden_tag(tag))
            .collect();
        let attributes = attributes
            .iter()
            .copied()
            .filter(|attribute| !is_forbidden_attribute(attribute))
            .collect();
        Self { tags, attributes }
    }

    /// Widen the default lists. Script vectors are still filtered out.
    pub fn with_extra(mut self, tags: &[&'static str], attributes: &[&'static str]) -> Self {
        self.tags
            .extend(tags.iter().copied().filter(|tag| !is_forbidden_tag(tag)));
        self.attributes.extend(
            attributes
                .iter()
                .copied()
                .filter(|attribute| !is_forbidden_attribute(attribute)),
        );
        self
    }

    pub fn allows_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn allows_attribute(&self, attribute: &str) -> bool {
        self.attributes.contains(attribute)
    }

    pub(crate) fn build(&self) -> AmmoniaBuilder<'static> {
        let mut builder = AmmoniaBuilder::default();

        builder.tags(self.tags.clone());
        builder.rm_clean_content_tags(&["style"]);
        builder.clean_content_tags(HashSet::from(["script"]));
        builder.generic_attributes(self.attributes.clone());
        builder.tag_attributes(Default::default());
        builder.link_rel(None);
        builder.strip_comments(true);
        builder.url_schemes(URL_SCHEMES.iter().copied().collect());

        builder.attribute_filter(|_element, attribute, value| {
            if attribute.eq_ignore_ascii_case("style") {
                sanitize_style_attribute(value).map(Cow::Owned)
            } else if URL_ATTRIBUTES
                .iter()
                .any(|url_attr| attribute.eq_ignore_ascii_case(url_attr))
                && is_unsafe_url(&normalize_url(value))
            {
                None
            } else {
                Some(Cow::Borrowed(value))
            }
        });

        builder
    }
}

fn is_forbidden_tag(tag: &str) -> bool {
    FORBIDDEN_TAGS
        .iter()
        .any(|forbidden| tag.eq_ignore_ascii_case(forbidden))
}

fn is_forbidden_attribute(attribute: &str) -> bool {
    let lower = attribute.to_ascii_lowercase();
    lower.starts_with("on") || FORBIDDEN_ATTRIBUTES.contains(&lower.as_str())
}

// Browsers ignore control characters and whitespace inside a scheme.
fn normalize_url(value: &str) -> String {
    value
        .chars()
        .filter(|ch| !ch.is_whitespace() && !ch.is_control())
        .collect::<String>()
        .to_ascii_lowercase()
}

fn sanitize_style_attribute(value: &str) -> Option<String> {
    let mut sanitized = Vec::new();

    for declaration in value.split(';') {
        let decl = declaration.trim();
        if decl.is_empty() {
            continue;
        }

        if is_safe_style_declaration(decl) {
            sanitized.push(decl);
        }
    }

    if sanitized.is_empty() {
        None
    } else {
        Some(sanitized.join("; "))
    }
}

fn is_safe_style_declaration(decl: &str) -> bool {
    let lower = decl.to_ascii_lowercase();

    const FORBIDDEN_SUBSTRINGS: [&str; 6] = [
        "expression(",
        "javascript:",
        "vbscript:",
        "-moz-binding",
        "behavior:",
        "behaviour:",
    ];

    if FORBIDDEN_SUBSTRINGS
        .iter()
        .any(|needle| lower.contains(needle))
    {
        return false;
    }

    if lower.contains("@import") {
        return false;
    }

    !contains_unsafe_url(&lower)
}

fn contains_unsafe_url(lower_decl: &str) -> bool {
    let mut offset = 0;

    while let Some(start) = lower_decl[offset..].find("url(") {
        let open = offset + start + 4;
        let rest = &lower_decl[open..];
        if let Some(close_rel) = rest.find(')') {
            let close = open + close_rel;
            let target = &lower_decl[open..close];
            let trimmed = target.trim_matches(|c: char| c.is_whitespace() || c == '\'');
            let trimmed = trimmed.trim_matches('"');

            if is_unsafe_url(trimmed) {
                return true;
            }

            offset = close + 1;
        } else {
            // unterminated url(
            return true;
        }
    }

    false
}

fn is_unsafe_url(url: &str) -> bool {
    if url.starts_with("data:image/") {
        return false;
    }

    url.starts_with("javascript:")
        || url.starts_with("vbscript:")
        || url.starts_with("data:")
        || url.contains("javascript:")
        || url.contains("vbscript:")
}
