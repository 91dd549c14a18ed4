use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rendering request passed into the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderRequest {
    /// Source markdown: inline lesson content, a fetched file, or a chat response.
    pub markdown: String,
    /// Directory-like prefix used to resolve `![[reference]]` embeds. Always ends with `/`.
    #[serde(default)]
    pub base_path: Option<String>,
}

impl RenderRequest {
    pub fn new(markdown: impl Into<String>) -> Self {
        Self {
            markdown: markdown.into(),
            base_path: None,
        }
    }

    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = normalize_base_path(base_path.into().as_str());
        self
    }

    /// Build a request for markdown fetched from `content_url`, resolving embeds
    /// against the directory that holds the file.
    pub fn for_content_url(markdown: impl Into<String>, content_url: &str) -> Self {
        let mut request = Self::new(markdown);
        request.base_path = base_path_for_content_url(content_url);
        request
    }

    pub fn base_path(&self) -> Option<&str> {
        self.base_path.as_deref()
    }
}

fn normalize_base_path(base_path: &str) -> Option<String> {
    let trimmed = base_path.trim();
    if trimmed.is_empty() {
        return None;
    }

    if trimmed.ends_with('/') {
        Some(trimmed.to_string())
    } else {
        Some(format!("{trimmed}/"))
    }
}

/// Directory prefix of a content URL, keeping the trailing slash.
pub fn base_path_for_content_url(content_url: &str) -> Option<String> {
    content_url
        .rfind('/')
        .map(|last_slash| content_url[..=last_slash].to_string())
}

/// Deterministic rendering result returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RenderOutput {
    /// Sanitised HTML ready for injection into the page.
    pub html: String,
    /// Compiler output before sanitisation, kept for diagnostics.
    pub raw_html: String,
    /// Indicates whether the rendered HTML contains any code blocks.
    pub contains_code: bool,
    /// Indicates whether the rendered HTML contains rendered math fragments.
    pub contains_math: bool,
    /// Indicates whether the rendered HTML contains diagram containers awaiting rendering.
    pub contains_mermaid: bool,
}

impl RenderOutput {
    pub fn from_stages(raw_html: String, html: String) -> Self {
        let contains_code = html.contains("<pre");
        let contains_math = html.contains("class=\"katex\"");
        let contains_mermaid = html.contains("class=\"mermaid\"");
        Self {
            html,
            raw_html,
            contains_code,
            contains_math,
            contains_mermaid,
        }
    }
}

/// Result published by the debounced renderer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RenderedHtml {
    /// Submission generation this result was produced for; `0` before the first render.
    pub generation: u64,
    pub html: String,
    pub raw_html: String,
}

impl RenderedHtml {
    pub fn empty(generation: u64) -> Self {
        Self {
            generation,
            ..Self::default()
        }
    }

    pub fn from_output(generation: u64, output: RenderOutput) -> Self {
        Self {
            generation,
            html: output.html,
            raw_html: output.raw_html,
        }
    }
}

/// Structured errors surfaced by the rendering pipeline.
#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error("markdown rendering failed: {message}")]
    Markdown { message: String },
    #[error("syntax highlighting failed: {language}: {message}")]
    Highlighting { language: String, message: String },
    #[error("document processing failed: {message}")]
    Document { message: String },
    #[error("image resolution failed for `{src}`: {message}")]
    ImageResolution { src: String, message: String },
}

/// Trait exposed by the rendering pipeline. Implementations must be pure and
/// deterministic: given the same input, they return identical outputs or errors.
pub trait RenderService: Send + Sync {
    /// Normalise and compile markdown into raw, unsanitised HTML.
    fn compile(&self, request: &RenderRequest) -> Result<String, RenderError>;

    /// Filter compiled HTML against the allow-list.
    fn sanitize(&self, html: &str) -> String;

    fn render(&self, request: &RenderRequest) -> Result<RenderOutput, RenderError> {
        let raw_html = self.compile(request)?;
        let html = self.sanitize(&raw_html);
        Ok(RenderOutput::from_stages(raw_html, html))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_path_gains_trailing_separator() {
        let request = RenderRequest::new("x").with_base_path("/lessons/1");
        assert_eq!(request.base_path(), Some("/lessons/1/"));
    }

    #[test]
    fn blank_base_path_is_absent() {
        let request = RenderRequest::new("x").with_base_path("  ");
        assert_eq!(request.base_path(), None);
    }

    #[test]
    fn content_url_base_path_keeps_directory() {
        let request = RenderRequest::for_content_url("x", "/compose/1.1.1/lesson.md");
        assert_eq!(request.base_path(), Some("/compose/1.1.1/"));
        assert_eq!(base_path_for_content_url("lesson.md"), None);
    }

    #[test]
    fn math_errors_alone_do_not_count_as_math() {
        let errors_only = RenderOutput::from_stages(
            String::new(),
            "<p><span class=\"katex-error\" title=\"bad\">$\\frac{$</span></p>".to_string(),
        );
        assert!(!errors_only.contains_math);

        let rendered = RenderOutput::from_stages(
            String::new(),
            "<span class=\"katex-display\"><span class=\"katex\">x</span></span>".to_string(),
        );
        assert!(rendered.contains_math);
    }

    #[test]
    fn output_flags_follow_sanitized_html() {
        let output = RenderOutput::from_stages(
            String::new(),
            "<div class=\"mermaid\">graph TD;</div><pre><code class=\"hljs\">x</code></pre>"
                .to_string(),
        );
        assert!(output.contains_code);
        assert!(output.contains_mermaid);
        assert!(!output.contains_math);
    }
}
