//! Extraction collaborators: uploaded documents to plain text, HTML pages to
//! a structural [`MarkupNode`] tree.
//!
//! Extraction never panics on bad input; it returns an [`ExtractError`] and the
//! caller decides whether to skip the item or fail the request.

use std::io::Read;
use std::path::Path;

use quick_xml::events::{BytesStart, Event};
use qa_harness_core::markup::{assign_selectors, MarkupNode};
use qa_harness_core::models::SourceDocument;

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// HTML elements that never have content or an end tag.
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

/// Elements whose content is not part of the page structure.
const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "noscript", "template"];

#[derive(Debug)]
pub enum ExtractError {
    UnsupportedExtension(String),
    Utf8(String),
    Json(String),
    Pdf(String),
    Ooxml(String),
    Markup(String),
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::UnsupportedExtension(ext) => {
                write!(f, "unsupported file type: '{}' (expected .md, .txt, .json, .pdf, .docx)", ext)
            }
            ExtractError::Utf8(e) => write!(f, "text is not valid UTF-8: {}", e),
            ExtractError::Json(e) => write!(f, "JSON document is invalid: {}", e),
            ExtractError::Pdf(e) => write!(f, "PDF extraction failed: {}", e),
            ExtractError::Ooxml(e) => write!(f, "DOCX extraction failed: {}", e),
            ExtractError::Markup(e) => write!(f, "markup extraction failed: {}", e),
        }
    }
}

impl std::error::Error for ExtractError {}

/// Extract the text of an uploaded document, dispatching on the file
/// extension of `name`. The document id is `name` itself.
pub fn extract_document(name: &str, bytes: &[u8]) -> Result<SourceDocument, ExtractError> {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    let text = match ext.as_str() {
        "md" | "markdown" | "txt" => utf8(bytes)?,
        "json" => {
            let value: serde_json::Value =
                serde_json::from_slice(bytes).map_err(|e| ExtractError::Json(e.to_string()))?;
            serde_json::to_string_pretty(&value).map_err(|e| ExtractError::Json(e.to_string()))?
        }
        "pdf" => extract_pdf(bytes)?,
        "docx" => extract_docx(bytes)?,
        _ => return Err(ExtractError::UnsupportedExtension(ext)),
    };
    Ok(SourceDocument::new(name, text))
}

fn utf8(bytes: &[u8]) -> Result<String, ExtractError> {
    String::from_utf8(bytes.to_vec()).map_err(|e| ExtractError::Utf8(e.to_string()))
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| ExtractError::Ooxml("word/document.xml not found".to_string()))?;
    let mut doc_xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut doc_xml)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Ooxml(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }
    docx_text(&doc_xml)
}

/// Text of `<w:t>` runs, one line per `<w:p>` paragraph.
fn docx_text(xml: &[u8]) -> Result<String, ExtractError> {
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
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

// ============ Markup ============

/// Parse an HTML page into a structural tree with selectors assigned to its
/// interactive elements.
///
/// Parsing is lenient: unclosed elements are closed by their parent's end
/// tag, stray end tags are ignored, void elements never take children, and
/// script and style content is dropped.
pub fn parse_markup(html: &str) -> Result<MarkupNode, ExtractError> {
    let html = strip_raw_text_elements(html);
    let mut reader = quick_xml::Reader::from_str(&html);
    {
        let config = reader.config_mut();
        config.check_end_names = false;
        config.allow_unmatched_ends = true;
        config.trim_text(true);
    }

    // stack[0] is a synthetic root collecting top-level nodes.
    let mut stack: Vec<MarkupNode> = vec![MarkupNode::default()];
    loop {
        let event = reader
            .read_event()
            .map_err(|e| ExtractError::Markup(format!("at byte {}: {}", reader.buffer_position(), e)))?;
        match event {
            Event::Start(e) => {
                let node = element(&e);
                if VOID_ELEMENTS.contains(&node.tag.as_str()) {
                    push_child(&mut stack, node);
                } else if !SKIPPED_ELEMENTS.contains(&node.tag.as_str()) {
                    stack.push(node);
                }
            }
            Event::Empty(e) => {
                let node = element(&e);
                if !SKIPPED_ELEMENTS.contains(&node.tag.as_str()) {
                    push_child(&mut stack, node);
                }
            }
            Event::End(e) => {
                let tag = String::from_utf8_lossy(e.local_name().as_ref()).to_ascii_lowercase();
                if let Some(pos) = stack.iter().rposition(|n| n.tag == tag) {
                    if pos > 0 {
                        while stack.len() > pos {
                            close_top(&mut stack);
                        }
                    }
                }
            }
            Event::Text(te) => {
                let text = match te.unescape() {
                    Ok(t) => t.into_owned(),
                    Err(_) => String::from_utf8_lossy(&te).into_owned(),
                };
                if !text.trim().is_empty() {
                    push_child(&mut stack, MarkupNode::text(&text));
                }
            }
            Event::CData(cd) => {
                let text = String::from_utf8_lossy(&cd).into_owned();
                if !text.trim().is_empty() {
                    push_child(&mut stack, MarkupNode::text(&text));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    while stack.len() > 1 {
        close_top(&mut stack);
    }

    let mut top = stack.pop().map(|root| root.children).unwrap_or_default();
    let mut root = if top.len() == 1 && !top[0].is_text() {
        top.remove(0)
    } else {
        MarkupNode::element("body", &[], top)
    };
    if root.children.is_empty() && root.text.is_none() && root.attributes.is_empty() {
        return Err(ExtractError::Markup("page contains no elements".to_string()));
    }
    assign_selectors(&mut root);
    Ok(root)
}

/// Remove script-like elements with their content. Their bodies are not
/// markup and would derail the tokenizer.
fn strip_raw_text_elements(html: &str) -> String {
    // ASCII lowercasing keeps byte offsets identical.
    let lower = html.to_ascii_lowercase();
    let mut out = String::with_capacity(html.len());
    let mut pos = 0;
    while let Some((start, name)) = next_raw_text_open(&lower, pos) {
        out.push_str(&html[pos..start]);
        let close = format!("</{}", name);
        pos = match lower[start..].find(&close) {
            Some(rel) => {
                let close_start = start + rel;
                lower[close_start..]
                    .find('>')
                    .map(|gt| close_start + gt + 1)
                    .unwrap_or(html.len())
            }
            None => html.len(),
        };
    }
    out.push_str(&html[pos..]);
    out
}

fn next_raw_text_open(lower: &str, from: usize) -> Option<(usize, &'static str)> {
    SKIPPED_ELEMENTS
        .iter()
        .filter_map(|name| {
            let open = format!("<{}", name);
            let mut search = from;
            while let Some(rel) = lower[search..].find(&open) {
                let at = search + rel;
                let next = lower[at + open.len()..].chars().next();
                if matches!(next, Some(c) if c.is_whitespace() || c == '>' || c == '/') {
                    return Some((at, *name));
                }
                search = at + open.len();
            }
            None
        })
        .min_by_key(|(at, _)| *at)
}

fn element(e: &BytesStart<'_>) -> MarkupNode {
    let tag = String::from_utf8_lossy(e.local_name().as_ref()).to_ascii_lowercase();
    let attributes = e
        .html_attributes()
        .filter_map(|a| a.ok())
        .map(|a| {
            let key = String::from_utf8_lossy(a.key.as_ref()).to_ascii_lowercase();
            let value = match a.unescape_value() {
                Ok(v) => v.into_owned(),
                Err(_) => String::from_utf8_lossy(&a.value).into_owned(),
            };
            (key, value)
        })
        .collect();
    MarkupNode {
        tag,
        attributes,
        ..MarkupNode::default()
    }
}

fn push_child(stack: &mut [MarkupNode], node: MarkupNode) {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(node);
    }
}

fn close_top(stack: &mut Vec<MarkupNode>) {
    if let Some(node) = stack.pop() {
        push_child(stack, node);
    }
}
