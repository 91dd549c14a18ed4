mod attributes;
pub(crate) mod config;
pub(crate) mod highlight;
pub(crate) mod images;
mod math;
mod normalize;
mod rewrite;
mod tasklist;

use std::time::Instant;

use comrak::{Arena, format_html, nodes::AstNode, options::Options, parse_document};
use metrics::histogram;
use once_cell::sync::OnceCell;
use syntect::{dumps::from_uncompressed_data, html::ClassStyle, parsing::SyntaxSet};
use thiserror::Error;
use tracing::debug;

use crate::application::render::types::{RenderError, RenderOutput, RenderRequest, RenderService};

use self::config::{SanitizerPolicy, compiler_options};
use self::highlight::{Highlighter, Language, LanguageRegistry};
use self::images::{ImageResolver, resolve_images};
use self::normalize::normalize_image_embeds;
use self::rewrite::{RewriteContext, rewrite_ast};
use self::tasklist::index_task_items;

pub(crate) const METRIC_RENDER_MS: &str = "lessonmark_render_ms";

pub const DEFAULT_DIAGRAM_LANGUAGE: &str = "mermaid";

/// Optional grammar extensions layered on CommonMark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrammarExtensions {
    pub task_lists: bool,
    pub math: bool,
    pub attributes: bool,
}

impl Default for GrammarExtensions {
    fn default() -> Self {
        Self {
            task_lists: true,
            math: true,
            attributes: true,
        }
    }
}

/// Everything the pipeline needs, built once and handed to the service.
#[derive(Debug, Clone)]
pub struct RenderPipelineConfig {
    /// Fence info string reserved for diagram passthrough, compared lower-case.
    pub diagram_language: String,
    pub extensions: GrammarExtensions,
    pub languages: LanguageRegistry,
    pub sanitizer: SanitizerPolicy,
}

impl Default for RenderPipelineConfig {
    fn default() -> Self {
        Self {
            diagram_language: DEFAULT_DIAGRAM_LANGUAGE.to_string(),
            extensions: GrammarExtensions::default(),
            languages: LanguageRegistry::standard(),
            sanitizer: SanitizerPolicy::default(),
        }
    }
}

impl From<&crate::config::RenderSettings> for RenderPipelineConfig {
    fn from(settings: &crate::config::RenderSettings) -> Self {
        let languages = settings
            .language_aliases
            .iter()
            .fold(LanguageRegistry::standard(), |registry, (alias, language)| {
                registry.with_alias(alias, *language)
            });

        Self {
            diagram_language: settings.diagram_language.clone(),
            extensions: GrammarExtensions {
                task_lists: settings.task_lists,
                math: settings.math,
                attributes: settings.attributes,
            },
            languages,
            sanitizer: SanitizerPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RenderConfigError {
    #[error("embedded syntax pack could not be loaded: {message}")]
    SyntaxPack { message: String },
    #[error("diagram language must be a single non-empty word, got `{value}`")]
    DiagramLanguage { value: String },
}

static SYNTAX_SET: OnceCell<SyntaxSet> = OnceCell::new();

/// Syntax definitions generated at build time, decoded on first use.
pub(crate) fn bundled_syntax_set() -> Result<&'static SyntaxSet, RenderConfigError> {
    SYNTAX_SET.get_or_try_init(|| {
        let syntax_bytes = include_bytes!(env!("SYNTAX_PACK_FILE"));
        from_uncompressed_data(syntax_bytes).map_err(|err| RenderConfigError::SyntaxPack {
            message: err.to_string(),
        })
    })
}

/// Comrak-based pipeline: embed normalisation, KaTeX math, Syntect
/// highlighting and an Ammonia allow-list.
pub struct MarkdownRenderService {
    options: Options<'static>,
    syntax_set: &'static SyntaxSet,
    class_style: ClassStyle,
    languages: LanguageRegistry,
    diagram_language: String,
    extensions: GrammarExtensions,
    sanitizer: ammonia::Builder<'static>,
}

impl MarkdownRenderService {
    pub fn new(config: &RenderPipelineConfig) -> Result<Self, RenderConfigError> {
        let diagram_language = config.diagram_language.trim().to_lowercase();
        if diagram_language.is_empty() || diagram_language.contains(char::is_whitespace) {
            return Err(RenderConfigError::DiagramLanguage {
                value: config.diagram_language.clone(),
            });
        }

        Ok(Self {
            options: compiler_options(&config.extensions),
            syntax_set: bundled_syntax_set()?,
            class_style: ClassStyle::SpacedPrefixed { prefix: "hljs-" },
            languages: config.languages.clone(),
            diagram_language,
            extensions: config.extensions,
            sanitizer: config.sanitizer.build(),
        })
    }

    /// Compile, resolve image sources through `resolver`, then sanitise.
    pub async fn render_with_resolver(
        &self,
        request: &RenderRequest,
        resolver: &dyn ImageResolver,
    ) -> Result<RenderOutput, RenderError> {
        let started = Instant::now();
        let compiled = self.compile(request)?;
        let resolved = resolve_images(&compiled, request.base_path(), resolver).await?;
        let html = self.sanitize(&resolved);
        histogram!(METRIC_RENDER_MS).record(started.elapsed().as_secs_f64() * 1000.0);
        Ok(RenderOutput::from_stages(resolved, html))
    }

    /// Registered fence tags, for diagnostics.
    pub fn languages(&self) -> impl Iterator<Item = (&str, Language)> {
        self.languages.aliases()
    }

    fn rewrite_stage<'a>(
        &self,
        root: &'a AstNode<'a>,
        base_path: Option<&str>,
    ) -> Result<(), RenderError> {
        let context = RewriteContext {
            options: &self.options,
            highlighter: Highlighter {
                syntax_set: self.syntax_set,
                class_style: &self.class_style,
                registry: &self.languages,
            },
            diagram_language: &self.diagram_language,
            base_path,
            attributes: self.extensions.attributes,
        };
        rewrite_ast(root, &context)
    }
}

impl RenderService for MarkdownRenderService {
    fn compile(&self, request: &RenderRequest) -> Result<String, RenderError> {
        let source = normalize_image_embeds(&request.markdown, request.base_path());

        let arena = Arena::new();
        let root = parse_document(&arena, &source, &self.options);

        self.rewrite_stage(root, request.base_path())?;

        let html = render_html_stage(root, &self.options)?;

        if self.extensions.task_lists {
            index_task_items(&html)
        } else {
            Ok(html)
        }
    }

    fn sanitize(&self, html: &str) -> String {
        self.sanitizer.clean(html).to_string()
    }

    fn render(&self, request: &RenderRequest) -> Result<RenderOutput, RenderError> {
        let started = Instant::now();
        let raw_html = self.compile(request)?;
        let html = self.sanitize(&raw_html);
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        histogram!(METRIC_RENDER_MS).record(elapsed_ms);
        debug!(
            target = "application::render::service",
            bytes = request.markdown.len(),
            elapsed_ms,
            "Rendered markdown"
        );
        Ok(RenderOutput::from_stages(raw_html, html))
    }
}

fn render_html_stage<'a>(
    root: &'a AstNode<'a>,
    options: &Options<'static>,
) -> Result<String, RenderError> {
    let mut html = String::new();
    format_html(root, options, &mut html).map_err(|err| RenderError::Markdown {
        message: err.to_string(),
    })?;
    Ok(html)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> MarkdownRenderService {
        MarkdownRenderService::new(&RenderPipelineConfig::default()).expect("service")
    }

    #[test]
    fn rejects_blank_diagram_language() {
        let config = RenderPipelineConfig {
            diagram_language: "  ".to_string(),
            ..RenderPipelineConfig::default()
        };
        assert!(matches!(
            MarkdownRenderService::new(&config),
            Err(RenderConfigError::DiagramLanguage { .. })
        ));
    }

    #[test]
    fn custom_diagram_language_is_honoured() {
        let config = RenderPipelineConfig {
            diagram_language: "Graph".to_string(),
            ..RenderPipelineConfig::default()
        };
        let service = MarkdownRenderService::new(&config).expect("service");
        let html = service
            .compile(&RenderRequest::new("```graph\nA-->B\n```\n"))
            .expect("compile");
        assert_eq!(html, "<div class=\"mermaid\">A-->B</div>\n");
    }

    #[test]
    fn compile_normalizes_embeds_before_parsing() {
        let html = service()
            .compile(&RenderRequest::new("![[diagram.png]]").with_base_path("/lessons/1/"))
            .expect("compile");
        assert_eq!(
            html,
            "<p><img src=\"/lessons/1/diagram.png\" alt=\"diagram.png\" /></p>\n"
        );
    }

    #[test]
    fn embed_references_keep_special_characters() {
        let service = service();
        let html = service
            .compile(&RenderRequest::new("![[my <draft> pic.png]]"))
            .expect("compile");
        assert!(html.contains("src=\"my%20%3Cdraft%3E%20pic.png\""), "{html}");
        assert!(!html.contains("<draft>"), "{html}");

        let html = service
            .compile(&RenderRequest::new("![[a\\_b.png]]").with_base_path("/lessons/"))
            .expect("compile");
        assert!(html.contains("src=\"/lessons/a\\_b.png\""), "{html}");
    }

    #[test]
    fn disabled_extensions_leave_syntax_alone() {
        let config = RenderPipelineConfig {
            extensions: GrammarExtensions {
                task_lists: false,
                math: false,
                attributes: false,
            },
            ..RenderPipelineConfig::default()
        };
        let service = MarkdownRenderService::new(&config).expect("service");
        let html = service
            .compile(&RenderRequest::new("- [ ] todo\n\nCost $5 and $6 {.x}\n"))
            .expect("compile");
        assert!(!html.contains("checkbox"), "{html}");
        assert!(!html.contains("katex"), "{html}");
        assert!(html.contains("{.x}"), "{html}");
    }

    #[test]
    fn sanitize_is_idempotent_on_pipeline_output() {
        let service = service();
        let output = service
            .render(&RenderRequest::new(
                "# Title {.lead}\n\n- [x] done\n\n```js\nconst a = 1 < 2;\n```\n\n$$x^2$$\n",
            ))
            .expect("render");
        assert_eq!(service.sanitize(&output.html), output.html);
        assert!(output.contains_code);
        assert!(output.contains_math);
    }
}
