//! Document parsers and the MIME-pattern registry that selects them.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use globset::{Glob, GlobMatcher};

use crate::error::{Error, Result};

/// Extracts text, an optional archive rendition and a thumbnail from a
/// source file.
///
/// Implementations keep their working files in a private scratch
/// directory that stays valid until [`cleanup`](DocumentParser::cleanup).
pub trait DocumentParser: Send {
    fn parse(
        &mut self,
        source: &Path,
        mime_type: &str,
        file_name: Option<&str>,
    ) -> Result<()>;

    /// Text extracted by the last successful `parse`.
    fn text(&self) -> Option<&str>;

    /// Archive rendition produced by the last successful `parse`, if the
    /// parser makes one.
    fn archive_path(&self) -> Option<&Path>;

    fn thumbnail(
        &mut self,
        source: &Path,
        mime_type: &str,
        file_name: Option<&str>,
    ) -> Result<PathBuf>;

    /// Remove every scratch file. Must be safe to call more than once.
    fn cleanup(&mut self);
}

/// Owns a parser and runs its cleanup when dropped.
pub struct ParserGuard {
    parser: Box<dyn DocumentParser>,
}

impl ParserGuard {
    pub fn new(parser: Box<dyn DocumentParser>) -> Self {
        Self { parser }
    }
}

impl std::ops::Deref for ParserGuard {
    type Target = dyn DocumentParser;

    fn deref(&self) -> &Self::Target {
        self.parser.as_ref()
    }
}

impl std::ops::DerefMut for ParserGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.parser.as_mut()
    }
}

impl Drop for ParserGuard {
    fn drop(&mut self) {
        self.parser.cleanup();
    }
}

pub type ParserFactory = Arc<dyn Fn() -> Box<dyn DocumentParser> + Send + Sync>;

struct Registration {
    pattern: String,
    matcher: GlobMatcher,
    factory: ParserFactory,
}

/// Maps MIME type patterns such as `text/*` or `application/pdf` to parser
/// factories. The first registration whose pattern matches wins.
#[derive(Default)]
pub struct ParserRegistry {
    entries: Vec<Registration>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in parsers.
    pub fn with_defaults() -> Result<Self> {
        let mut registry = Self::new();
        registry.register("text/*", Arc::new(|| Box::new(TextParser::new())))?;
        Ok(registry)
    }

    pub fn register(
        &mut self,
        pattern: &str,
        factory: ParserFactory,
    ) -> Result<()> {
        let matcher = Glob::new(pattern)
            .map_err(|e| {
                Error::Config(format!("invalid MIME pattern '{pattern}': {e}"))
            })?
            .compile_matcher();
        self.entries.push(Registration {
            pattern: pattern.to_string(),
            matcher,
            factory,
        });
        Ok(())
    }

    /// A fresh parser for `mime_type`, or `None` when nothing handles it.
    pub fn parser_for(&self, mime_type: &str) -> Option<ParserGuard> {
        self.entries
            .iter()
            .find(|entry| entry.matcher.is_match(mime_type))
            .map(|entry| ParserGuard::new((entry.factory)()))
    }

    pub fn supports(&self, mime_type: &str) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.matcher.is_match(mime_type))
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.pattern.as_str())
    }
}

impl std::fmt::Debug for ParserRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.patterns()).finish()
    }
}

const THUMBNAIL_LINES: usize = 12;
const THUMBNAIL_LINE_WIDTH: usize = 60;

/// Parser for plain text files.
///
/// The archive rendition is the text normalized to UTF-8 with `\n` line
/// endings; the thumbnail is an SVG showing the first lines.
#[derive(Debug, Default)]
pub struct TextParser {
    scratch: Option<tempfile::TempDir>,
    text: Option<String>,
    archive: Option<PathBuf>,
}

impl TextParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn scratch_dir(&mut self) -> Result<PathBuf> {
        let dir = match self.scratch.take() {
            Some(dir) => dir,
            None => tempfile::Builder::new()
                .prefix("docvault-parse-")
                .tempdir()?,
        };
        let path = dir.path().to_path_buf();
        self.scratch = Some(dir);
        Ok(path)
    }
}

impl DocumentParser for TextParser {
    fn parse(
        &mut self,
        source: &Path,
        _mime_type: &str,
        _file_name: Option<&str>,
    ) -> Result<()> {
        let bytes = fs::read(source)?;
        let text = normalize_text(&String::from_utf8_lossy(&bytes));

        let archive = self.scratch_dir()?.join("archive.txt");
        fs::write(&archive, &text)?;

        self.text = Some(text);
        self.archive = Some(archive);
        Ok(())
    }

    fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    fn archive_path(&self) -> Option<&Path> {
        self.archive.as_deref()
    }

    fn thumbnail(
        &mut self,
        source: &Path,
        _mime_type: &str,
        _file_name: Option<&str>,
    ) -> Result<PathBuf> {
        let text = match &self.text {
            Some(text) => text.clone(),
            None => normalize_text(&String::from_utf8_lossy(&fs::read(source)?)),
        };
        let thumb = self.scratch_dir()?.join("thumbnail.svg");
        fs::write(&thumb, render_svg(&text))?;
        Ok(thumb)
    }

    fn cleanup(&mut self) {
        self.archive = None;
        if let Some(dir) = self.scratch.take()
            && let Err(e) = dir.close()
        {
            tracing::warn!(error = %e, "failed to remove parser scratch directory");
        }
    }
}

fn normalize_text(raw: &str) -> String {
    let mut text: String = raw
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .chars()
        .filter(|c| *c != '\0')
        .collect();
    let trimmed = text.trim_end().len();
    text.truncate(trimmed);
    text
}

fn render_svg(text: &str) -> String {
    let mut svg = String::from(
        "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"500\" height=\"700\">\
         <rect width=\"100%\" height=\"100%\" fill=\"white\"/>",
    );
    for (i, line) in text.lines().take(THUMBNAIL_LINES).enumerate() {
        let line: String = line.chars().take(THUMBNAIL_LINE_WIDTH).collect();
        svg.push_str(&format!(
            "<text x=\"10\" y=\"{}\" font-family=\"monospace\" font-size=\"14\">{}</text>",
            30 + i * 20,
            escape_xml(&line)
        ));
    }
    svg.push_str("</svg>");
    svg
}

fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
