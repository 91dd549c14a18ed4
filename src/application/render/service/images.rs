//! Environment-specific image source resolution.
//!
//! Desktop hosts cannot load lesson-relative image paths directly; they map
//! each source to a URL their webview can fetch. Resolution runs between the
//! compile and sanitise stages so the sanitiser still sees every final URL.

use std::{
    cell::{Cell, RefCell},
    path::{Path, PathBuf},
    rc::Rc,
};

use async_trait::async_trait;
use futures::future::join_all;
use lol_html::{RewriteStrSettings, element, rewrite_str};
use metrics::counter;
use percent_encoding::percent_decode_str;
use thiserror::Error;
use tracing::{debug, warn};

use crate::application::render::types::RenderError;

pub(crate) const METRIC_IMAGE_RESOLVE_FAILED_TOTAL: &str = "lessonmark_image_resolve_failed_total";

const MAX_ENTITY_LEN: usize = 10;

/// One image awaiting resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageRequest<'a> {
    /// Base path of the document the image appears in, if any.
    pub file_dir: Option<&'a str>,
    /// Decoded `src`. Sources under `file_dir` arrive relative to it, so an
    /// `![[embed]]` and a plain `![](path)` reach the resolver in the same form.
    pub src: &'a str,
}

#[derive(Debug, Error)]
pub enum ImageResolveError {
    #[error("image `{src}` not found")]
    NotFound { src: String },
    #[error("image resolver failed: {message}")]
    Backend { message: String },
}

/// Maps compiled image sources to URLs the host can load.
#[async_trait]
pub trait ImageResolver: Send + Sync {
    /// `Ok(None)` leaves the source unchanged.
    async fn resolve(&self, request: ImageRequest<'_>) -> Result<Option<String>, ImageResolveError>;
}

/// Resolve every `<img src>` in `html` concurrently and rewrite the sources in place.
///
/// A failing resolution keeps that image's original source and never affects
/// the others.
pub async fn resolve_images(
    html: &str,
    base_path: Option<&str>,
    resolver: &dyn ImageResolver,
) -> Result<String, RenderError> {
    let sources = collect_image_sources(html)?;
    if sources.is_empty() {
        return Ok(html.to_string());
    }

    let decoded: Vec<String> = sources
        .iter()
        .map(|src| decode_source(src))
        .collect();

    let results = join_all(decoded.iter().map(|src| {
        resolver.resolve(ImageRequest {
            file_dir: base_path,
            src: relative_to_base(src, base_path),
        })
    }))
    .await;

    let replacements: Vec<Option<String>> = results
        .into_iter()
        .zip(&decoded)
        .map(|(result, src)| match result {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!(
                    target = "application::render::images",
                    src = %src,
                    error = %err,
                    "Image resolution failed; keeping original source"
                );
                counter!(METRIC_IMAGE_RESOLVE_FAILED_TOTAL).increment(1);
                None
            }
        })
        .collect();

    apply_image_sources(html, &replacements)
}

fn collect_image_sources(html: &str) -> Result<Vec<String>, RenderError> {
    if !html.contains("<img") {
        return Ok(Vec::new());
    }

    let sources = Rc::new(RefCell::new(Vec::new()));

    rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![element!("img[src]", {
                let sources = Rc::clone(&sources);
                move |el| {
                    if let Some(src) = el.get_attribute("src") {
                        sources.borrow_mut().push(src);
                    }
                    Ok(())
                }
            })],
            ..RewriteStrSettings::default()
        },
    )
    .map_err(|err| RenderError::Document {
        message: err.to_string(),
    })?;

    Ok(sources.take())
}

fn apply_image_sources(html: &str, replacements: &[Option<String>]) -> Result<String, RenderError> {
    if replacements.iter().all(Option::is_none) {
        return Ok(html.to_string());
    }

    let position = Rc::new(Cell::new(0usize));

    rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![element!("img[src]", {
                let position = Rc::clone(&position);
                move |el| {
                    let index = position.get();
                    position.set(index.saturating_add(1));
                    if let Some(Some(resolved)) = replacements.get(index) {
                        el.set_attribute("src", resolved)?;
                    }
                    Ok(())
                }
            })],
            ..RewriteStrSettings::default()
        },
    )
    .map_err(|err| RenderError::Document {
        message: err.to_string(),
    })
}

// The compiler has already prefixed embeds with the base path.
fn relative_to_base<'s>(src: &'s str, base_path: Option<&str>) -> &'s str {
    base_path
        .and_then(|base| src.strip_prefix(base))
        .filter(|relative| !relative.is_empty())
        .unwrap_or(src)
}

// Sources reach this stage attribute-escaped and percent-encoded.
fn decode_source(raw: &str) -> String {
    let unescaped = decode_entities(raw);
    percent_decode_str(&unescaped)
        .decode_utf8_lossy()
        .into_owned()
}

// Named references the compiler emits, plus numeric ones from raw HTML.
// Anything else is kept literally.
fn decode_entities(raw: &str) -> String {
    let mut decoded = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        decoded.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let reference = tail
            .find(';')
            .filter(|semi| *semi <= MAX_ENTITY_LEN)
            .and_then(|semi| decode_entity(&tail[1..semi]).map(|ch| (ch, semi)));
        match reference {
            Some((ch, semi)) => {
                decoded.push(ch);
                rest = &tail[semi + 1..];
            }
            None => {
                decoded.push('&');
                rest = &tail[1..];
            }
        }
    }
    decoded.push_str(rest);
    decoded
}

fn decode_entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "quot" => Some('"'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "apos" => Some('\''),
        _ => {
            let number = name.strip_prefix('#')?;
            let code = match number.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => number.parse().ok()?,
            };
            char::from_u32(code)
        }
    }
}

/// Resolves relative sources against the local filesystem and rewrites them to
/// a custom scheme served by the host (for example `safe-file://`).
#[derive(Debug, Clone)]
pub struct LocalFileResolver {
    scheme: String,
    root: Option<PathBuf>,
}

impl LocalFileResolver {
    pub fn new(scheme: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            root: None,
        }
    }

    /// Directory that relative document paths and sources resolve under.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    fn candidate(&self, file_dir: Option<&str>, src: &str) -> Option<PathBuf> {
        let path = Path::new(src);
        if path.is_absolute() {
            return Some(path.to_path_buf());
        }
        // A relative document directory is itself relative to the root.
        match (file_dir, &self.root) {
            (Some(dir), _) if has_scheme(dir) => None,
            (Some(dir), Some(root)) => Some(root.join(dir).join(path)),
            (Some(dir), None) => Some(Path::new(dir).join(path)),
            (None, Some(root)) => Some(root.join(path)),
            (None, None) => None,
        }
    }
}

#[async_trait]
impl ImageResolver for LocalFileResolver {
    async fn resolve(&self, request: ImageRequest<'_>) -> Result<Option<String>, ImageResolveError> {
        if has_scheme(request.src) {
            return Ok(None);
        }

        let Some(candidate) = self.candidate(request.file_dir, request.src) else {
            return Ok(None);
        };

        let canonical = tokio::fs::canonicalize(&candidate).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                ImageResolveError::NotFound {
                    src: request.src.to_string(),
                }
            } else {
                ImageResolveError::Backend {
                    message: format!("{}: {err}", candidate.display()),
                }
            }
        })?;

        debug!(
            target = "application::render::images",
            src = request.src,
            path = %canonical.display(),
            "Resolved local image"
        );

        Ok(Some(format!("{}://{}", self.scheme, canonical.display())))
    }
}

fn has_scheme(src: &str) -> bool {
    match src.split_once(':') {
        Some((scheme, _)) => {
            scheme.len() > 1
                && scheme
                    .chars()
                    .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '+' | '-' | '.'))
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct Recording {
        seen: Mutex<Vec<(Option<String>, String)>>,
    }

    #[async_trait]
    impl ImageResolver for Recording {
        async fn resolve(
            &self,
            request: ImageRequest<'_>,
        ) -> Result<Option<String>, ImageResolveError> {
            self.seen
                .lock()
                .expect("lock")
                .push((request.file_dir.map(str::to_string), request.src.to_string()));
            match request.src {
                "missing.png" => Err(ImageResolveError::NotFound {
                    src: request.src.to_string(),
                }),
                "remote.png" => Ok(None),
                other => Ok(Some(format!("safe-file:///lessons/{other}"))),
            }
        }
    }

    #[tokio::test]
    async fn each_image_gets_its_own_resolution() {
        let resolver = Recording {
            seen: Mutex::new(Vec::new()),
        };
        let html = "<p><img src=\"a.png\" alt=\"a\" /><img src=\"missing.png\" alt=\"m\" /></p>\
                    <p><img src=\"my%20shot.png\" class=\"wide\" /><img src=\"remote.png\" /></p>";

        let out = resolve_images(html, Some("/lessons/"), &resolver)
            .await
            .expect("resolved");

        assert!(out.contains("src=\"safe-file:///lessons/a.png\""), "{out}");
        assert!(out.contains("src=\"missing.png\""), "{out}");
        assert!(out.contains("src=\"safe-file:///lessons/my shot.png\""), "{out}");
        assert!(out.contains("src=\"remote.png\""), "{out}");
        assert_eq!(out.matches("alt=").count(), 2, "{out}");
        assert!(out.contains("class=\"wide\""), "{out}");
        let first = out.find("lessons/a.png").expect("first");
        let second = out.find("missing.png").expect("second");
        assert!(first < second, "positions kept: {out}");

        let seen = resolver.seen.lock().expect("lock");
        assert_eq!(seen.len(), 4);
        assert!(seen.iter().all(|(dir, _)| dir.as_deref() == Some("/lessons/")));
        assert_eq!(seen[2].1, "my shot.png");
    }

    #[tokio::test]
    async fn base_prefixed_sources_arrive_relative() {
        let resolver = Recording {
            seen: Mutex::new(Vec::new()),
        };
        let html = "<p><img src=\"lessons/ch1/a.png\" /><img src=\"other/b.png\" /></p>";

        let out = resolve_images(html, Some("lessons/ch1/"), &resolver)
            .await
            .expect("resolved");

        assert!(out.contains("src=\"safe-file:///lessons/a.png\""), "{out}");
        let seen = resolver.seen.lock().expect("lock");
        assert_eq!(seen[0].1, "a.png");
        assert_eq!(seen[1].1, "other/b.png");
    }

    #[test]
    fn numeric_references_are_decoded() {
        assert_eq!(decode_source("a&#x20;b.png"), "a b.png");
        assert_eq!(decode_source("a&#32;b&amp;c.png"), "a b&c.png");
        assert_eq!(decode_source("my%20shot&quot;.png"), "my shot\".png");
        assert_eq!(decode_source("tom&jerry;x&#xZZ;.png"), "tom&jerry;x&#xZZ;.png");
    }

    #[tokio::test]
    async fn local_resolver_joins_relative_document_dir_to_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("lessons/ch1")).expect("mkdir");
        std::fs::write(dir.path().join("lessons/ch1/img.png"), b"png").expect("write");

        let resolver = LocalFileResolver::new("safe-file").with_root(dir.path());
        let found = resolver
            .resolve(ImageRequest {
                file_dir: Some("lessons/ch1/"),
                src: "img.png",
            })
            .await
            .expect("resolved");
        let expected = std::fs::canonicalize(dir.path().join("lessons/ch1/img.png")).expect("canon");
        assert_eq!(found, Some(format!("safe-file://{}", expected.display())));

        let remote_base = resolver
            .resolve(ImageRequest {
                file_dir: Some("https://cdn.example/x/"),
                src: "img.png",
            })
            .await
            .expect("resolved");
        assert_eq!(remote_base, None);
    }

    #[tokio::test]
    async fn html_without_images_is_untouched() {
        let resolver = Recording {
            seen: Mutex::new(Vec::new()),
        };
        let html = "<p>No pictures</p>";
        let out = resolve_images(html, None, &resolver).await.expect("resolved");
        assert_eq!(out, html);
        assert!(resolver.seen.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn local_resolver_maps_existing_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("chart.png"), b"png").expect("write");
        let base = format!("{}/", dir.path().display());

        let resolver = LocalFileResolver::new("safe-file");
        let found = resolver
            .resolve(ImageRequest {
                file_dir: Some(&base),
                src: "chart.png",
            })
            .await
            .expect("resolved");
        let expected_path = std::fs::canonicalize(dir.path().join("chart.png")).expect("canon");
        assert_eq!(
            found,
            Some(format!("safe-file://{}", expected_path.display()))
        );

        let missing = resolver
            .resolve(ImageRequest {
                file_dir: Some(&base),
                src: "nope.png",
            })
            .await;
        assert!(matches!(missing, Err(ImageResolveError::NotFound { .. })));

        let remote = resolver
            .resolve(ImageRequest {
                file_dir: Some(&base),
                src: "https://cdn.example.com/x.png",
            })
            .await
            .expect("resolved");
        assert_eq!(remote, None);
    }
}
