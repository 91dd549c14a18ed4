//! Markdown ingestion and sanitisation pipeline.
//!
//! Rendering is split into pure stages: embed normalisation and compilation
//! produce raw HTML, the sanitiser filters it against an allow-list. Image
//! resolution and debounced re-rendering are optional layers on top; they
//! never change what the pure stages emit for a given input.

mod runtime;
mod service;
mod types;

pub use runtime::{
    DEFAULT_QUIET_PERIOD, DebounceError, DebounceSettings, DebouncedRenderer, TrailingDebounce,
};
pub use service::config::{DEFAULT_ALLOWED_ATTRIBUTES, DEFAULT_ALLOWED_TAGS, SanitizerPolicy};
pub use service::highlight::{Language, LanguageRegistry};
pub use service::images::{
    ImageRequest, ImageResolveError, ImageResolver, LocalFileResolver, resolve_images,
};
pub use service::{
    DEFAULT_DIAGRAM_LANGUAGE, GrammarExtensions, MarkdownRenderService, RenderConfigError,
    RenderPipelineConfig,
};
pub use types::{
    RenderError, RenderOutput, RenderRequest, RenderService, RenderedHtml,
    base_path_for_content_url,
};

/// Names of the metrics emitted by the pipeline.
pub mod metric_names {
    pub const RENDER_MS: &str = super::service::METRIC_RENDER_MS;
    pub const HIGHLIGHT_FALLBACK_TOTAL: &str =
        super::service::highlight::METRIC_HIGHLIGHT_FALLBACK_TOTAL;
    pub const DEBOUNCE_SUPERSEDED_TOTAL: &str = super::runtime::METRIC_DEBOUNCE_SUPERSEDED_TOTAL;
    pub const IMAGE_RESOLVE_FAILED_TOTAL: &str =
        super::service::images::METRIC_IMAGE_RESOLVE_FAILED_TOTAL;
}
