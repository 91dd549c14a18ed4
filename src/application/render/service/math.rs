use katex::{OptsBuilder, OutputType};

use crate::application::render::types::RenderError;

use super::highlight::escape_html;

/// Render a KaTeX expression to HTML-only output (no MathML), inline or display.
pub(crate) fn render_math_html(literal: &str, display_mode: bool) -> Result<String, RenderError> {
    let mut builder = OptsBuilder::default();
    builder.display_mode(display_mode);
    builder.output_type(OutputType::Html);

    let opts = builder.build().map_err(|err| RenderError::Document {
        message: format!("failed to build KaTeX options: {err}"),
    })?;

    katex::render_with_opts(literal, opts).map_err(|err| RenderError::Document {
        message: format!("KaTeX rendering failed: {err}"),
    })
}

/// Escaped source shown in place of an expression KaTeX rejected.
pub(crate) fn math_error_html(literal: &str, message: &str, display_mode: bool) -> String {
    let delimiter = if display_mode { "$$" } else { "$" };
    format!(
        "<span class=\"katex-error\" title=\"{}\">{delimiter}{}{delimiter}</span>",
        escape_attribute(message),
        escape_html(literal)
    )
}

pub(crate) fn escape_attribute(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '\n' | '\r' | '\t' => escaped.push(' '),
            _ => escaped.push(ch),
        }
    }
    escaped
}
