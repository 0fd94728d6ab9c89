//! Document loading: raw object bytes → normalized plain text.
//!
//! The loader strategy is picked once per document from the key's file
//! extension ([`DocumentKind`]). Supported encodings:
//!
//! | Extension | Kind | Extraction |
//! |-----------|------|------------|
//! | `.txt`, `.md` | [`DocumentKind::Text`] | UTF-8 decode |
//! | `.pdf` | [`DocumentKind::Pdf`] | `pdf-extract` |
//! | `.docx` | [`DocumentKind::Docx`] | `word/document.xml` text runs |
//! | `.pptx` | [`DocumentKind::Pptx`] | `ppt/slides/slideN.xml` text runs, slide order |
//! | `.html`, `.htm` | [`DocumentKind::Html`] | `scraper` text nodes, minus script/style |
//!
//! PDF and HTML output is flattened: line breaks are removed and non-breaking
//! spaces become plain spaces. Office formats end every paragraph with a
//! newline instead.
//!
//! Failures come back as [`ExtractError`] and the
//! pipeline skips the document.

use std::io::Read;

use quick_xml::events::Event;
use scraper::{Html, Node};
use thiserror::Error;

use crate::models::DocumentLocator;

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported document type: {0}")]
    Unsupported(String),
    #[error("text is not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
    #[error("extraction worker failed: {0}")]
    Worker(String),
}

/// Loader strategy for a document, keyed by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Text,
    Pdf,
    Docx,
    Pptx,
    Html,
}

impl DocumentKind {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "txt" | "md" => Some(Self::Text),
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            "pptx" => Some(Self::Pptx),
            "html" | "htm" => Some(Self::Html),
            _ => None,
        }
    }

    /// Resolve the kind for a locator, or fail with [`ExtractError::Unsupported`].
    pub fn for_locator(locator: &DocumentLocator) -> Result<Self, ExtractError> {
        locator
            .extension()
            .and_then(|ext| Self::from_extension(&ext))
            .ok_or_else(|| ExtractError::Unsupported(locator.key.clone()))
    }
}

/// Extract normalized plain text from `bytes`.
pub fn load_document(bytes: &[u8], kind: DocumentKind) -> Result<String, ExtractError> {
    match kind {
        DocumentKind::Text => {
            let text = String::from_utf8(bytes.to_vec())?;
            Ok(text.trim_start_matches('\u{feff}').to_string())
        }
        DocumentKind::Pdf => extract_pdf(bytes).map(|t| flatten(&t)),
        DocumentKind::Docx => extract_docx(bytes),
        DocumentKind::Pptx => extract_pptx(bytes),
        DocumentKind::Html => Ok(flatten(&extract_html(bytes))),
    }
}

/// [`load_document`] on the blocking thread pool, so parsing a large PDF or
/// OOXML archive does not stall other tasks on the runtime. A parser panic
/// comes back as [`ExtractError::Worker`].
pub async fn spawn_load_document(bytes: Vec<u8>, kind: DocumentKind) -> Result<String, ExtractError> {
    run_blocking(move || load_document(&bytes, kind)).await
}

async fn run_blocking<T, F>(work: F) -> Result<T, ExtractError>
where
    F: FnOnce() -> Result<T, ExtractError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ExtractError::Worker(e.to_string()))?
}

/// Drop line breaks and turn non-breaking spaces into spaces.
fn flatten(text: &str) -> String {
    text.chars()
        .filter(|c| *c != '\n' && *c != '\r')
        .map(|c| if c == '\u{00A0}' { ' ' } else { c })
        .collect()
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

fn extract_html(bytes: &[u8]) -> String {
    let source = String::from_utf8_lossy(bytes);
    let document = Html::parse_document(&source);

    let mut out = String::new();
    for node in document.tree.root().descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let hidden = node
            .parent()
            .and_then(|p| p.value().as_element())
            .map(|el| matches!(el.name(), "script" | "style" | "noscript" | "template"))
            .unwrap_or(false);
        if !hidden {
            out.push_str(text);
        }
    }
    out
}

type ZipCursor<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_zip(bytes: &[u8]) -> Result<ZipCursor<'_>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

fn read_zip_entry_bounded(
    archive: &mut ZipCursor<'_>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= max_bytes {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_zip(bytes)?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
    extract_text_runs(&xml)
}

fn extract_pptx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_zip(bytes)?;
    let mut slide_names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("ppt/slides/slide") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    slide_names.sort_by_key(|name| {
        name.trim_start_matches("ppt/slides/slide")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });

    let mut out = String::new();
    for name in slide_names {
        let xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
        out.push_str(&extract_text_runs(&xml)?);
    }
    Ok(out)
}

/// Collect the text of every `<*:t>` element, ending each `<*:p>` paragraph
/// with a newline. Works for both WordprocessingML (`w:`) and DrawingML (`a:`).
fn extract_text_runs(xml: &[u8]) -> Result<String, ExtractError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                let text = te
                    .unescape()
                    .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
                out.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}
