//! EPUB chapter extraction and output filename handling.

use std::path::Path;

use epub::doc::EpubDoc;
use html2text::from_read;
use regex::Regex;
use tracing::debug;

use crate::error::ConvertError;

/// One titled unit of source text, converted to exactly one audio file.
#[derive(Debug, Clone)]
pub struct Chapter {
    /// 1-based position in the book, assigned after empty sections are
    /// dropped. Stable across runs for the same document.
    pub index: usize,
    pub title: String,
    pub content: String,
}

impl Chapter {
    /// Output filename for this chapter: `{index:03}_{sanitized title}.mp3`.
    /// The index prefix keeps paths unique even when titles collide.
    pub fn file_name(&self) -> String {
        format!("{:03}_{}.mp3", self.index, sanitize_filename(&self.title))
    }
}

/// Extract ordered `(title, content)` chapters from an EPUB file.
///
/// Spine order is preserved. Sections whose stripped text is empty are
/// dropped before indices are assigned, so every returned chapter maps to a
/// non-empty audio file.
pub fn extract_chapters(epub_path: &Path) -> Result<Vec<Chapter>, ConvertError> {
    let mut doc = EpubDoc::new(epub_path).map_err(|e| ConvertError::Epub(e.to_string()))?;
    let mut chapters = Vec::new();

    for section in 0..doc.get_num_chapters() {
        if !doc.set_current_chapter(section) {
            continue;
        }
        let Some((html, _mime)) = doc.get_current_str() else {
            continue;
        };

        let content = strip_html(&html);
        if content.trim().is_empty() {
            debug!(section, "skipping empty spine section");
            continue;
        }

        let index = chapters.len() + 1;
        let title = extract_title(&html).unwrap_or_else(|| format!("Chapter_{}", index));
        chapters.push(Chapter {
            index,
            title,
            content,
        });
    }

    Ok(chapters)
}

/// Remove characters that are illegal in filenames on common platforms.
pub fn sanitize_filename(name: &str) -> String {
    let invalid = Regex::new(r#"[<>:"/\\|?*]"#).unwrap();
    invalid.replace_all(name, "").to_string()
}

/// First `<h1>`..`<h3>` heading in the section, stripped of residual markup.
fn extract_title(html: &str) -> Option<String> {
    let heading = Regex::new(r"(?s)<h[1-3][^>]*>(.*?)</h[1-3]>").unwrap();
    let captured = heading.captures(html)?.get(1)?.as_str();
    let tags = Regex::new("<[^>]*>").unwrap();
    let text = tags.replace_all(captured, "");
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn strip_html(html: &str) -> String {
    from_read(html.as_bytes(), 80)
}
