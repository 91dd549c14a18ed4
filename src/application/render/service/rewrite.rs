use comrak::{
    format_html,
    nodes::{AstNode, NodeHtmlBlock, NodeValue},
    options::Options,
};
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use tracing::warn;

use crate::application::render::types::RenderError;

use super::{
    attributes::{AttributeSet, parse_attribute_block, split_trailing_block},
    highlight::Highlighter,
    math::{self, escape_attribute},
};

/// Characters that cannot appear raw inside an `src` attribute.
const SRC_ENCODE_SET: &AsciiSet = &CONTROLS.add(b' ').add(b'"').add(b'<').add(b'>').add(b'`');

pub(crate) struct RewriteContext<'a> {
    pub(crate) options: &'a Options<'static>,
    pub(crate) highlighter: Highlighter<'a>,
    pub(crate) diagram_language: &'a str,
    pub(crate) base_path: Option<&'a str>,
    pub(crate) attributes: bool,
}

pub(crate) fn rewrite_ast<'a>(
    root: &'a AstNode<'a>,
    context: &RewriteContext<'_>,
) -> Result<(), RenderError> {
    RewriteWalker { context }.visit_nodes(root)
}

struct RewriteWalker<'c, 'a> {
    context: &'c RewriteContext<'a>,
}

impl RewriteWalker<'_, '_> {
    fn visit_nodes<'n>(&self, node: &'n AstNode<'n>) -> Result<(), RenderError> {
        if self.handle_math_node(node) {
            // fully replaced
        } else if let Some((info, literal)) = extract_code_block(node) {
            let html = self.render_fence(&info, &literal);
            let mut data = node.data.borrow_mut();
            data.value = NodeValue::HtmlBlock(NodeHtmlBlock {
                block_type: 0,
                literal: html,
            });
        } else if is_image(node) {
            self.process_image_node(node);
        }

        let mut child = node.first_child();
        while let Some(next) = child {
            self.visit_nodes(next)?;
            child = next.next_sibling();
        }

        // Children are rewritten first so the block renders with their final HTML.
        if self.context.attributes {
            if is_annotatable_block(node) {
                self.apply_block_attributes(node)?;
            } else if is_tight_list_item(node) {
                self.apply_item_attributes(node)?;
            }
        }

        Ok(())
    }

    fn render_fence(&self, info: &str, literal: &str) -> String {
        if info.to_lowercase() == self.context.diagram_language {
            return format!("<div class=\"mermaid\">{}</div>\n", literal.trim());
        }

        let language = info.split_whitespace().next();
        let mut html = self.context.highlighter.render_code_block(language, literal);
        html.push('\n');
        html
    }

    fn handle_math_node(&self, node: &AstNode<'_>) -> bool {
        let math_data = {
            let data = node.data.borrow();
            if let NodeValue::Math(math_node) = &data.value {
                Some((math_node.literal.clone(), math_node.display_math))
            } else {
                None
            }
        };

        let Some((literal, display_mode)) = math_data else {
            return false;
        };

        let html = match math::render_math_html(&literal, display_mode) {
            Ok(html) => html,
            Err(err) => {
                warn!(
                    target = "application::render::math",
                    display = display_mode,
                    error = %err,
                    "KaTeX rejected expression; emitting source"
                );
                math::math_error_html(&literal, &err.to_string(), display_mode)
            }
        };

        let mut data = node.data.borrow_mut();
        data.value = NodeValue::HtmlInline(html);
        true
    }

    fn process_image_node(&self, node: &AstNode<'_>) {
        let (src, title) = {
            let data = node.data.borrow();
            match &data.value {
                NodeValue::Image(link) => (link.url.clone(), link.title.clone()),
                _ => return,
            }
        };

        let alt_raw = collect_inline_text(node);
        let alt = alt_raw.split_whitespace().collect::<Vec<_>>().join(" ");
        let alt = if alt.is_empty() {
            derive_alt(&src, self.context.base_path)
        } else {
            alt
        };

        let attributes = if self.context.attributes {
            take_image_attributes(node)
        } else {
            None
        };

        let html = build_image_html(
            &src,
            &alt,
            (!title.is_empty()).then_some(title.as_str()),
            attributes.as_ref(),
        );

        {
            let mut data = node.data.borrow_mut();
            data.value = NodeValue::HtmlInline(html);
        }

        while let Some(child) = node.first_child() {
            child.detach();
        }
    }

    fn apply_block_attributes<'n>(&self, node: &'n AstNode<'n>) -> Result<(), RenderError> {
        // Tight items have no `<p>`; their annotation goes on the `<li>`.
        if in_tight_list(node) {
            return Ok(());
        }

        match take_trailing_attributes(node) {
            Some(attributes) => self.replace_with_annotated(node, &attributes),
            None => Ok(()),
        }
    }

    fn apply_item_attributes<'n>(&self, item: &'n AstNode<'n>) -> Result<(), RenderError> {
        let Some(paragraph) = item
            .first_child()
            .filter(|child| matches!(child.data.borrow().value, NodeValue::Paragraph))
        else {
            return Ok(());
        };

        match take_trailing_attributes(paragraph) {
            Some(attributes) => self.replace_with_annotated(item, &attributes),
            None => Ok(()),
        }
    }

    fn replace_with_annotated<'n>(
        &self,
        node: &'n AstNode<'n>,
        attributes: &AttributeSet,
    ) -> Result<(), RenderError> {
        let mut html = String::new();
        format_html(node, self.context.options, &mut html).map_err(|err| {
            RenderError::Markdown {
                message: err.to_string(),
            }
        })?;

        let Some(annotated) = inject_into_opening_tag(&html, attributes) else {
            return Ok(());
        };

        {
            let mut data = node.data.borrow_mut();
            data.value = NodeValue::HtmlBlock(NodeHtmlBlock {
                block_type: 0,
                literal: annotated,
            });
        }
        while let Some(child) = node.first_child() {
            child.detach();
        }

        Ok(())
    }
}

/// Strip a trailing `{...}` annotation from a block's text and return it.
/// An annotation that is the whole block stays as text.
fn take_trailing_attributes<'n>(block: &'n AstNode<'n>) -> Option<AttributeSet> {
    let run = trailing_text_run(block);
    let first = *run.first()?;
    let combined: String = run.iter().map(|text_node| text_of(text_node)).collect();

    let (rest, attributes) = split_trailing_block(&combined)?;
    let rest = rest.trim_end().to_string();
    if rest.is_empty() && first.previous_sibling().is_none() {
        return None;
    }

    {
        let mut data = first.data.borrow_mut();
        data.value = NodeValue::Text(rest.into());
    }
    for merged in &run[1..] {
        merged.detach();
    }

    Some(attributes)
}

// Consecutive text nodes closing a block, in document order.
fn trailing_text_run<'n>(node: &'n AstNode<'n>) -> Vec<&'n AstNode<'n>> {
    let mut run = Vec::new();
    let mut cursor = node.last_child();
    while let Some(current) = cursor {
        if !is_text(current) {
            break;
        }
        run.push(current);
        cursor = current.previous_sibling();
    }
    run.reverse();
    run
}

fn is_text(node: &AstNode<'_>) -> bool {
    let data = node.data.borrow();
    matches!(data.value, NodeValue::Text(_))
}

fn text_of(node: &AstNode<'_>) -> String {
    let data = node.data.borrow();
    match &data.value {
        NodeValue::Text(text) => text.to_string(),
        _ => String::new(),
    }
}

fn in_tight_list(node: &AstNode<'_>) -> bool {
    node.parent().is_some_and(|item| is_tight_list_item(item))
}

fn is_tight_list_item(node: &AstNode<'_>) -> bool {
    if !matches!(node.data.borrow().value, NodeValue::Item(_) | NodeValue::TaskItem(..)) {
        return false;
    }
    node.parent().is_some_and(|list| match &list.data.borrow().value {
        NodeValue::List(list) => list.tight,
        _ => false,
    })
}

fn is_image(node: &AstNode<'_>) -> bool {
    let data = node.data.borrow();
    matches!(data.value, NodeValue::Image(_))
}

fn is_annotatable_block(node: &AstNode<'_>) -> bool {
    let data = node.data.borrow();
    matches!(data.value, NodeValue::Paragraph | NodeValue::Heading(_))
}

/// Insert attributes into the first tag of a rendered `<p>`, `<hN>` or `<li>` block.
/// Classes merge into a `class` the tag already carries.
fn inject_into_opening_tag(html: &str, attributes: &AttributeSet) -> Option<String> {
    let is_block_tag = html.starts_with("<p>")
        || html.starts_with("<li>")
        || html.starts_with("<li ")
        || (html.starts_with("<h") && html.as_bytes().get(2).is_some_and(u8::is_ascii_digit));
    if !is_block_tag {
        return None;
    }

    let close = html.find('>')?;
    let opening = &html[..close];
    let mut attributes = attributes.clone();
    let mut annotated = String::with_capacity(html.len() + 32);

    match opening.find(" class=\"") {
        Some(class_at) if !attributes.classes.is_empty() => {
            let value_start = class_at + " class=\"".len();
            let value_end = value_start + opening[value_start..].find('"')?;
            annotated.push_str(&opening[..value_end]);
            for class in attributes.classes.drain(..) {
                annotated.push(' ');
                annotated.push_str(&escape_attribute(&class));
            }
            annotated.push_str(&opening[value_end..]);
        }
        _ => annotated.push_str(opening),
    }

    annotated.push_str(&attributes.to_html());
    annotated.push_str(&html[close..]);
    Some(annotated)
}

/// Consume a `{...}` annotation written directly after an image.
fn take_image_attributes(node: &AstNode<'_>) -> Option<AttributeSet> {
    let sibling = node.next_sibling()?;

    let (attributes, remainder) = {
        let data = sibling.data.borrow();
        let NodeValue::Text(text) = &data.value else {
            return None;
        };
        let text: &str = text.as_ref();
        if !text.starts_with('{') {
            return None;
        }
        let close = text.find('}')?;
        let attributes = parse_attribute_block(&text[..=close])?;
        (attributes, text[close + 1..].to_string())
    };

    if remainder.is_empty() {
        sibling.detach();
    } else {
        let mut data = sibling.data.borrow_mut();
        data.value = NodeValue::Text(remainder.into());
    }

    Some(attributes)
}

fn derive_alt(src: &str, base_path: Option<&str>) -> String {
    base_path
        .and_then(|base| src.strip_prefix(base))
        .unwrap_or(src)
        .to_string()
}

fn build_image_html(
    src: &str,
    alt: &str,
    title: Option<&str>,
    attributes: Option<&AttributeSet>,
) -> String {
    let encoded_src = utf8_percent_encode(src, SRC_ENCODE_SET).to_string();

    let mut html = String::with_capacity(src.len() + alt.len() + 32);
    html.push_str("<img src=\"");
    html.push_str(&escape_attribute(&encoded_src));
    html.push('"');

    html.push_str(" alt=\"");
    html.push_str(&escape_attribute(alt));
    html.push('"');

    if let Some(title) = title {
        html.push_str(" title=\"");
        html.push_str(&escape_attribute(title));
        html.push('"');
    }

    if let Some(attributes) = attributes {
        html.push_str(&attributes.to_html());
    }

    html.push_str(" />");
    html
}

fn collect_inline_text(node: &AstNode<'_>) -> String {
    fn walk(node: &AstNode<'_>, buffer: &mut String) {
        {
            let data = node.data.borrow();
            match &data.value {
                NodeValue::Text(text) => buffer.push_str(text),
                NodeValue::Code(code) => buffer.push_str(&code.literal),
                NodeValue::LineBreak | NodeValue::SoftBreak => buffer.push(' '),
                _ => {}
            }
        }
        let mut child = node.first_child();
        while let Some(next) = child {
            walk(next, buffer);
            child = next.next_sibling();
        }
    }

    let mut text = String::new();
    let mut child = node.first_child();
    while let Some(next) = child {
        walk(next, &mut text);
        child = next.next_sibling();
    }
    text
}

fn extract_code_block(node: &AstNode<'_>) -> Option<(String, String)> {
    let data = node.data.borrow();
    if let NodeValue::CodeBlock(block) = &data.value {
        let info = block.info.trim().to_string();
        let literal = block.literal.clone();
        Some((info, literal))
    } else {
        None
    }
}
