use std::collections::BTreeMap;

use metrics::counter;
use syntect::{
    html::{ClassStyle, ClassedHTMLGenerator},
    parsing::{SyntaxReference, SyntaxSet},
    util::LinesWithEndings,
};
use tracing::warn;

use crate::application::render::types::RenderError;

pub(crate) const METRIC_HIGHLIGHT_FALLBACK_TOTAL: &str = "lessonmark_highlight_fallback_total";

/// Languages with a registered highlighter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Language {
    JavaScript,
    TypeScript,
    Css,
    Html,
    Xml,
    Python,
    Bash,
    Json,
    Java,
    Kotlin,
}

const STANDARD_ALIASES: &[(&str, Language)] = &[
    ("javascript", Language::JavaScript),
    ("js", Language::JavaScript),
    ("typescript", Language::TypeScript),
    ("ts", Language::TypeScript),
    ("css", Language::Css),
    ("html", Language::Html),
    ("xml", Language::Xml),
    ("python", Language::Python),
    ("py", Language::Python),
    ("bash", Language::Bash),
    ("shell", Language::Bash),
    ("sh", Language::Bash),
    ("json", Language::Json),
    ("java", Language::Java),
    ("kotlin", Language::Kotlin),
    ("kt", Language::Kotlin),
];

impl Language {
    pub const ALL: [Language; 10] = [
        Language::JavaScript,
        Language::TypeScript,
        Language::Css,
        Language::Html,
        Language::Xml,
        Language::Python,
        Language::Bash,
        Language::Json,
        Language::Java,
        Language::Kotlin,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Css => "css",
            Language::Html => "html",
            Language::Xml => "xml",
            Language::Python => "python",
            Language::Bash => "bash",
            Language::Json => "json",
            Language::Java => "java",
            Language::Kotlin => "kotlin",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let lowercase = name.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|language| language.name() == lowercase)
    }

    /// Tokens tried, in order, against the syntax pack.
    fn syntax_tokens(self) -> &'static [&'static str] {
        match self {
            Language::JavaScript => &["js", "JavaScript"],
            Language::TypeScript => &["ts", "TypeScript"],
            Language::Css => &["css", "CSS"],
            Language::Html => &["html", "HTML"],
            Language::Xml => &["xml", "XML"],
            Language::Python => &["py", "Python"],
            Language::Bash => &["bash", "sh", "Bourne Again Shell (bash)"],
            Language::Json => &["json", "JSON"],
            Language::Java => &["java", "Java"],
            Language::Kotlin => &["kt", "kotlin", "Kotlin"],
        }
    }

    /// Weighted fragments used by automatic detection.
    fn signals(self) -> &'static [(&'static str, u32)] {
        match self {
            Language::JavaScript => &[
                ("function ", 2),
                ("const ", 1),
                ("let ", 1),
                ("=> ", 1),
                ("console.log(", 3),
                ("document.", 2),
                ("require(", 2),
                ("===", 2),
            ],
            Language::TypeScript => &[
                (": string", 3),
                (": number", 3),
                (": boolean", 3),
                ("interface ", 2),
                ("export type ", 3),
                ("as const", 2),
                ("const ", 1),
                ("=> ", 1),
            ],
            Language::Css => &[
                ("px;", 2),
                ("color:", 2),
                ("margin:", 2),
                ("padding:", 2),
                ("display:", 2),
                ("@media", 3),
            ],
            Language::Html => &[
                ("<!doctype html", 4),
                ("<html", 3),
                ("<div", 2),
                ("<p>", 2),
                ("</", 1),
                ("class=\"", 1),
            ],
            Language::Xml => &[
                ("<?xml", 4),
                ("xmlns", 3),
                ("android:", 3),
                ("</", 1),
            ],
            Language::Python => &[
                ("def ", 3),
                ("elif ", 3),
                ("self.", 2),
                ("import ", 1),
                ("print(", 2),
                ("none", 1),
                ("__init__", 3),
            ],
            Language::Bash => &[
                ("#!/bin/", 4),
                ("echo ", 2),
                ("$(", 2),
                ("sudo ", 3),
                ("apt-get ", 3),
                ("npm install", 3),
                ("export ", 1),
                ("then\n", 2),
            ],
            Language::Json => &[],
            Language::Java => &[
                ("public class ", 3),
                ("public static void", 4),
                ("system.out.println", 4),
                ("private ", 1),
                ("new ", 1),
                ("import java.", 4),
            ],
            Language::Kotlin => &[
                ("fun ", 3),
                ("val ", 2),
                ("var ", 1),
                ("@composable", 4),
                ("data class ", 4),
                ("import androidx.", 4),
                ("println(", 1),
            ],
        }
    }
}

/// Static alias table mapping fence tags to registered languages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageRegistry {
    aliases: BTreeMap<String, Language>,
}

impl Default for LanguageRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl LanguageRegistry {
    pub fn standard() -> Self {
        let aliases = STANDARD_ALIASES
            .iter()
            .map(|(alias, language)| ((*alias).to_string(), *language))
            .collect();
        Self { aliases }
    }

    /// Register an extra alias (for example `tsx` → TypeScript).
    pub fn with_alias(mut self, alias: &str, language: Language) -> Self {
        let key = alias.trim().to_ascii_lowercase();
        if !key.is_empty() {
            self.aliases.insert(key, language);
        }
        self
    }

    pub fn lookup(&self, tag: &str) -> Option<Language> {
        self.aliases.get(&tag.trim().to_ascii_lowercase()).copied()
    }

    pub fn aliases(&self) -> impl Iterator<Item = (&str, Language)> {
        self.aliases
            .iter()
            .map(|(alias, language)| (alias.as_str(), *language))
    }
}

/// Syntax highlighting for fenced code blocks. Never fails: every error path
/// degrades to an escaped plaintext block.
pub(crate) struct Highlighter<'a> {
    pub(crate) syntax_set: &'a SyntaxSet,
    pub(crate) class_style: &'a ClassStyle,
    pub(crate) registry: &'a LanguageRegistry,
}

impl<'a> Highlighter<'a> {
    pub(crate) fn render_code_block(&self, language: Option<&str>, code: &str) -> String {
        let tag = language.map(str::trim).filter(|tag| !tag.is_empty());

        let result = match tag.and_then(|tag| self.registry.lookup(tag).map(|lang| (tag, lang))) {
            Some((tag, registered)) => self.highlight_registered(tag, registered, code),
            None => self.highlight_detected(code),
        };

        result.unwrap_or_else(|err| {
            warn!(
                target = "application::render::highlight",
                language = tag.unwrap_or("auto"),
                error = %err,
                "Highlighting failed; rendering plaintext"
            );
            counter!(METRIC_HIGHLIGHT_FALLBACK_TOTAL).increment(1);
            plaintext_code_block(code)
        })
    }

    fn highlight_registered(
        &self,
        tag: &str,
        language: Language,
        code: &str,
    ) -> Result<String, RenderError> {
        let syntax =
            find_syntax(self.syntax_set, language).ok_or_else(|| RenderError::Highlighting {
                language: language.name().to_string(),
                message: "grammar missing from syntax pack".to_string(),
            })?;
        let highlighted = self.highlight_with(syntax, language.name(), code)?;
        Ok(format!(
            "<pre><code class=\"hljs language-{}\">{highlighted}</code></pre>",
            escape_html(&tag.to_ascii_lowercase())
        ))
    }

    fn highlight_detected(&self, code: &str) -> Result<String, RenderError> {
        let syntax = self
            .registered_first_line_syntax(code)
            .or_else(|| detect_language(code).and_then(|lang| find_syntax(self.syntax_set, lang)))
            .unwrap_or_else(|| self.syntax_set.find_syntax_plain_text());
        let highlighted = self.highlight_with(syntax, "auto", code)?;
        Ok(format!("<pre><code class=\"hljs\">{highlighted}</code></pre>"))
    }

    // Shebangs and similar first-line markers, limited to registered languages.
    fn registered_first_line_syntax(&self, code: &str) -> Option<&'a SyntaxReference> {
        let candidate = self.syntax_set.find_syntax_by_first_line(code)?;
        Language::ALL.into_iter().find_map(|language| {
            find_syntax(self.syntax_set, language).filter(|syntax| syntax.name == candidate.name)
        })
    }

    fn highlight_with(
        &self,
        syntax: &SyntaxReference,
        label: &str,
        code: &str,
    ) -> Result<String, RenderError> {
        let mut code_with_newline = code.to_string();
        if !code_with_newline.ends_with('\n') {
            code_with_newline.push('\n');
        }

        let mut generator =
            ClassedHTMLGenerator::new_with_class_style(syntax, self.syntax_set, *self.class_style);

        for line in LinesWithEndings::from(code_with_newline.as_str()) {
            generator
                .parse_html_for_line_which_includes_newline(line)
                .map_err(|err| RenderError::Highlighting {
                    language: label.to_string(),
                    message: err.to_string(),
                })?;
        }

        Ok(generator.finalize())
    }
}

fn find_syntax(syntax_set: &SyntaxSet, language: Language) -> Option<&SyntaxReference> {
    language.syntax_tokens().iter().find_map(|token| {
        syntax_set
            .find_syntax_by_token(token)
            .or_else(|| syntax_set.find_syntax_by_name(token))
    })
}

/// Best-guess language for an untagged block, or `None` when nothing scores.
pub(crate) fn detect_language(code: &str) -> Option<Language> {
    let trimmed = code.trim();
    if trimmed.is_empty() {
        return None;
    }

    if (trimmed.starts_with('{') || trimmed.starts_with('['))
        && serde_json::from_str::<serde_json::Value>(trimmed).is_ok()
    {
        return Some(Language::Json);
    }

    let haystack = trimmed.to_ascii_lowercase();
    let mut best: Option<(Language, u32)> = None;
    for language in Language::ALL {
        let score: u32 = language
            .signals()
            .iter()
            .filter(|(needle, _)| haystack.contains(needle))
            .map(|(_, weight)| *weight)
            .sum();
        let beats_best = best.is_none_or(|(_, best_score)| score > best_score);
        if score >= 2 && beats_best {
            best = Some((language, score));
        }
    }

    best.map(|(language, _)| language)
}

pub(crate) fn plaintext_code_block(code: &str) -> String {
    format!(
        "<pre><code class=\"hljs language-plaintext\">{}</code></pre>",
        escape_html(code)
    )
}

pub(crate) fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}
