//! Rewrites the `![[reference]]` embed shorthand into standard markdown images.
//!
//! This is a plain text pass that runs before parsing. It does not understand
//! code spans, escapes, or nested brackets: an embed inside a fenced block is
//! rewritten like any other.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static IMAGE_EMBED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[\[(.*?)\]\]").expect("image embed pattern is valid"));

/// Replace every `![[X]]` with `![](Y)` where `Y` is `base_path + trim(X)`.
pub(crate) fn normalize_image_embeds<'a>(source: &'a str, base_path: Option<&str>) -> Cow<'a, str> {
    IMAGE_EMBED.replace_all(source, |captures: &Captures<'_>| {
        let reference = captures.get(1).map_or("", |m| m.as_str()).trim();
        let target = match base_path {
            Some(base) => format!("{base}{reference}"),
            None => reference.to_string(),
        };
        image_markdown(&target)
    })
}

fn image_markdown(target: &str) -> String {
    if needs_angle_brackets(target) {
        format!("![](<{}>)", escape_destination(target, &['<', '>', '\\', '&']))
    } else {
        format!("![]({})", escape_destination(target, &['\\', '&']))
    }
}

// CommonMark bare destinations cannot hold whitespace, parentheses or angle brackets.
fn needs_angle_brackets(target: &str) -> bool {
    target
        .chars()
        .any(|ch| ch.is_whitespace() || matches!(ch, '(' | ')' | '<' | '>'))
}

// Backslash escapes keep the parsed destination equal to `target`: no entity
// decoding, no eaten `\`, no early `>`.
fn escape_destination(target: &str, special: &[char]) -> String {
    let mut escaped = String::with_capacity(target.len() + 4);
    for ch in target.chars() {
        if special.contains(&ch) {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use comrak::{Arena, nodes::NodeValue, options::Options, parse_document};

    use super::*;

    #[test]
    fn rewrites_embed_against_base_path() {
        let out = normalize_image_embeds("![[diagram.png]]", Some("/lessons/1/"));
        assert_eq!(out, "![](/lessons/1/diagram.png)");
    }

    #[test]
    fn rewrites_embed_without_base_path() {
        let out = normalize_image_embeds("see ![[ a.png ]] here", None);
        assert_eq!(out, "see ![](a.png) here");
    }

    #[test]
    fn rewrites_every_occurrence() {
        let out = normalize_image_embeds("![[a.png]] and ![[b.png]]", Some("img/"));
        assert_eq!(out, "![](img/a.png) and ![](img/b.png)");
    }

    #[test]
    fn empty_reference_passes_through() {
        assert_eq!(normalize_image_embeds("![[]]", None), "![]()");
        assert_eq!(normalize_image_embeds("![[   ]]", Some("/x/")), "![](/x/)");
    }

    #[test]
    fn unterminated_embed_is_left_alone() {
        let source = "text ![[diagram.png and more";
        let out = normalize_image_embeds(source, Some("/x/"));
        assert!(matches!(out, Cow::Borrowed(_)));
        assert_eq!(out, source);
    }

    #[test]
    fn embed_does_not_span_lines() {
        let source = "![[first\nsecond]]";
        assert_eq!(normalize_image_embeds(source, None), source);
    }

    #[test]
    fn inner_whitespace_uses_angle_bracket_destination() {
        let out = normalize_image_embeds("![[ my diagram.png ]]", Some("/lessons/2/"));
        assert_eq!(out, "![](</lessons/2/my diagram.png>)");
    }

    #[test]
    fn reference_may_contain_single_brackets() {
        let out = normalize_image_embeds("![[fig]1.png]]", None);
        assert_eq!(out, "![](fig]1.png)");
    }

    fn parsed_image_url(markdown: &str) -> Option<String> {
        let arena = Arena::new();
        let root = parse_document(&arena, markdown, &Options::default());
        root.descendants().find_map(|node| match &node.data.borrow().value {
            NodeValue::Image(link) => Some(link.url.to_string()),
            _ => None,
        })
    }

    #[test]
    fn generated_references_round_trip_through_rewrite() {
        let plain = [
            "a.png",
            "nested/dir/b.svg",
            "x",
            "weird#name?.png",
            "ünïcode.jpg",
            "dots...png",
        ];
        let special = [
            "my <draft> pic.png",
            "a\\_b.png",
            "back\\slash\\.png",
            "fig (1).png",
            "half)open.png",
            "amp&amp;name.png",
            "tom&jerry.png",
            "trailing\\",
        ];
        for base in [None, Some("/lessons/7/"), Some("https://cdn.example/x/")] {
            for reference in plain {
                let source = format!("before ![[  {reference}\t]] after");
                let expected = format!("![]({}{reference})", base.unwrap_or(""));
                let out = normalize_image_embeds(&source, base);
                assert!(out.contains(&expected), "{out} missing {expected}");
            }

            for reference in plain.iter().chain(special.iter()) {
                let source = format!("![[ {reference} ]]");
                let expected = format!("{}{reference}", base.unwrap_or(""));
                let out = normalize_image_embeds(&source, base);
                assert_eq!(
                    parsed_image_url(&out).as_deref(),
                    Some(expected.as_str()),
                    "{out}"
                );
            }
        }
    }
}
