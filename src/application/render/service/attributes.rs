//! `{.class #id key=value}` annotations.

use super::math::escape_attribute;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct AttributeSet {
    pub(crate) id: Option<String>,
    pub(crate) classes: Vec<String>,
    pub(crate) pairs: Vec<(String, String)>,
}

impl AttributeSet {
    pub(crate) fn is_empty(&self) -> bool {
        self.id.is_none() && self.classes.is_empty() && self.pairs.is_empty()
    }

    /// Render as ` id="..." class="..." key="..."`, with a leading space.
    pub(crate) fn to_html(&self) -> String {
        let mut html = String::new();
        if let Some(id) = &self.id {
            push_attribute(&mut html, "id", id);
        }
        if !self.classes.is_empty() {
            push_attribute(&mut html, "class", &self.classes.join(" "));
        }
        for (key, value) in &self.pairs {
            push_attribute(&mut html, key, value);
        }
        html
    }
}

fn push_attribute(html: &mut String, key: &str, value: &str) {
    html.push(' ');
    html.push_str(key);
    html.push_str("=\"");
    html.push_str(&escape_attribute(value));
    html.push('"');
}

/// Split `text {…}` into the text before the block and the parsed attributes.
pub(crate) fn split_trailing_block(text: &str) -> Option<(&str, AttributeSet)> {
    let trimmed = text.trim_end();
    if !trimmed.ends_with('}') {
        return None;
    }
    let open = trimmed.rfind('{')?;
    let attributes = parse_attribute_block(&trimmed[open..])?;
    Some((&trimmed[..open], attributes))
}

/// Parse a complete `{…}` block. Returns `None` for anything that is not a
/// well-formed, non-empty annotation so ordinary braces survive as text.
pub(crate) fn parse_attribute_block(value: &str) -> Option<AttributeSet> {
    let inner = value.strip_prefix('{')?.strip_suffix('}')?.trim();
    let inner = inner.strip_prefix(':').map_or(inner, str::trim_start);
    if inner.is_empty() {
        return None;
    }

    let mut set = AttributeSet::default();
    for token in tokenize(inner)? {
        if let Some(class) = token.strip_prefix('.') {
            if !is_name(class) {
                return None;
            }
            set.classes.push(class.to_string());
        } else if let Some(id) = token.strip_prefix('#') {
            if !is_name(id) {
                return None;
            }
            set.id = Some(id.to_string());
        } else if let Some((key, raw)) = token.split_once('=') {
            if !is_name(key) {
                return None;
            }
            let value = strip_quotes(raw);
            if key.eq_ignore_ascii_case("class") {
                set.classes
                    .extend(value.split_whitespace().map(str::to_string));
            } else if key.eq_ignore_ascii_case("id") {
                set.id = Some(value.to_string());
            } else {
                set.pairs.push((key.to_string(), value.to_string()));
            }
        } else {
            return None;
        }
    }

    (!set.is_empty()).then_some(set)
}

// Whitespace-separated tokens; quoted values may contain spaces. Smart
// punctuation may already have turned straight quotes into curly ones.
fn tokenize(inner: &str) -> Option<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut closing: Option<char> = None;

    for ch in inner.chars() {
        match closing {
            Some(close) => {
                current.push(ch);
                if ch == close {
                    closing = None;
                }
            }
            None if ch.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            None => {
                if let Some(close) = closing_quote(ch) {
                    closing = Some(close);
                }
                current.push(ch);
            }
        }
    }

    if closing.is_some() {
        return None;
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Some(tokens)
}

fn closing_quote(open: char) -> Option<char> {
    match open {
        '"' => Some('"'),
        '\'' => Some('\''),
        '\u{201C}' => Some('\u{201D}'),
        '\u{2018}' => Some('\u{2019}'),
        _ => None,
    }
}

fn strip_quotes(raw: &str) -> &str {
    let mut chars = raw.chars();
    match (chars.next(), chars.next_back()) {
        (Some(open), Some(close)) if closing_quote(open) == Some(close) => {
            &raw[open.len_utf8()..raw.len() - close.len_utf8()]
        }
        _ => raw,
    }
}

fn is_name(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | ':' | '.'))
}
