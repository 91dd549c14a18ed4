pub mod application;
pub mod config;
pub mod infra;

/// Stylesheet for the `hljs-` classes emitted by the highlighter, generated at build time.
pub const HIGHLIGHT_CSS: &str = include_str!(env!("HIGHLIGHT_CSS_FILE"));
