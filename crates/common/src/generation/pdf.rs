//! PDF context preparation
//!
//! Turns uploaded PDFs into prompt parts in one of two ways:
//! - `native`: the document goes to the provider untouched, inline (base64) when small
//!   and through the provider's file API when large
//! - `inline-extract`: page text is pulled out with lopdf, segmented, and folded into
//!   the prompt under a shared character budget; embedded JPEG page images follow the
//!   text as inline image parts, up to a per-job image count
//!
//! A document that cannot be used is recorded as skipped; it never aborts the job.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use text_splitter::{ChunkConfig, TextSplitter};
use tracing::{debug, info, warn};

use super::client::GenerativeClient;
use super::error::DocumentError;
use super::prompt::ContentPart;
use super::types::{PdfMode, UploadedDocument};
use crate::config::DocumentConfig;
use crate::metrics;
use lopdf::{Dictionary, Object, ObjectId};
use std::time::Duration;

pub const PDF_MIME: &str = "application/pdf";
pub const JPEG_MIME: &str = "image/jpeg";

/// How far into the file the `%PDF-` marker may appear
const HEADER_SCAN_BYTES: usize = 1024;

/// Everything the prompt needs to know about the uploaded documents
#[derive(Debug, Clone, Default)]
pub struct DocumentContext {
    pub parts: Vec<ContentPart>,
    pub sources: Vec<String>,
    pub source_ids: Vec<String>,
    pub truncations: Vec<String>,
    pub skipped: Vec<String>,
    pub skipped_images: Vec<String>,
}

impl DocumentContext {
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

/// Text of one page, already whitespace-normalised
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    pub page: u32,
    pub text: String,
}

/// An embedded image the model can read as-is
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    pub page: u32,
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// Extracted text and images of a whole document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedDocument {
    pub page_count: usize,
    pub pages: Vec<PageText>,
    pub images: Vec<PageImage>,
    /// Image XObjects in an encoding the model cannot take inline
    pub unsupported_images: usize,
}

#[derive(Debug, Clone)]
pub struct DocumentExtractor {
    max_context_chars: usize,
    segment_chars: usize,
    inline_threshold: usize,
    parse_timeout: Duration,
    max_images: usize,
    max_image_bytes: usize,
}

impl DocumentExtractor {
    pub fn new(config: &DocumentConfig) -> Self {
        Self {
            max_context_chars: config.max_context_chars,
            segment_chars: config.segment_chars.max(1),
            inline_threshold: config.inline_threshold_bytes,
            parse_timeout: config.parse_timeout(),
            max_images: config.max_images,
            max_image_bytes: config.max_image_bytes,
        }
    }

    /// Build the document context for one job
    pub async fn prepare(
        &self,
        documents: &[UploadedDocument],
        mode: PdfMode,
        client: &dyn GenerativeClient,
    ) -> DocumentContext {
        let mut ctx = DocumentContext::default();
        let mut budget = self.max_context_chars;
        let mut images_left = self.max_images;

        info!(
            documents = documents.len(),
            mode = mode.as_str(),
            "Preparing document context"
        );

        for (index, document) in documents.iter().enumerate() {
            let name = document.display_name(index);

            if let Err(e) = check_pdf_header(&name, &document.content) {
                warn!(document = %name, error = %e, "Skipping unsupported document");
                metrics::record_document_skipped();
                ctx.skipped.push(e.to_string());
                continue;
            }

            ctx.sources.push(name.clone());
            ctx.source_ids.push(document.source_id());

            if mode == PdfMode::Native {
                if document.size() <= self.inline_threshold {
                    debug!(document = %name, bytes = document.size(), "Embedding PDF inline");
                    ctx.parts.push(ContentPart::InlineData {
                        mime_type: PDF_MIME.to_string(),
                        data: STANDARD.encode(&document.content),
                    });
                    continue;
                }

                match client.upload_file(&document.content, PDF_MIME, &name).await {
                    Ok(file_uri) => {
                        debug!(document = %name, file_uri = %file_uri, "Uploaded PDF via file API");
                        ctx.parts.push(ContentPart::FileData {
                            mime_type: PDF_MIME.to_string(),
                            file_uri,
                        });
                        continue;
                    }
                    Err(e) => {
                        warn!(
                            document = %name,
                            bytes = document.size(),
                            error = %e,
                            "Upload failed, falling back to extracted text"
                        );
                    }
                }
            }

            match self.extract(&name, document).await {
                Ok(extracted) => {
                    let folded = fold_document(&name, &extracted, self.segment_chars, budget);
                    budget -= folded.chars_used;
                    if let Some(note) = folded.truncation {
                        metrics::record_document_truncation();
                        ctx.truncations.push(note);
                    }
                    if let Some(text) = folded.text {
                        ctx.parts.push(ContentPart::Text { text });
                    }
                    self.attach_images(&name, extracted, &mut images_left, &mut ctx);
                }
                Err(e) => {
                    warn!(document = %name, error = %e, "Document could not be parsed");
                    metrics::record_document_skipped();
                    ctx.skipped.push(e.to_string());
                }
            }
        }

        ctx
    }

    /// Inline the document's images while the job's image allowance lasts
    fn attach_images(
        &self,
        name: &str,
        extracted: ExtractedDocument,
        images_left: &mut usize,
        ctx: &mut DocumentContext,
    ) {
        let mut oversized = 0usize;
        let mut over_budget = 0usize;

        for image in extracted.images {
            if image.data.len() > self.max_image_bytes {
                oversized += 1;
            } else if *images_left == 0 {
                over_budget += 1;
            } else {
                *images_left -= 1;
                debug!(document = %name, page = image.page, bytes = image.data.len(), "Embedding page image");
                ctx.parts.push(ContentPart::InlineData {
                    mime_type: image.mime_type,
                    data: STANDARD.encode(&image.data),
                });
            }
        }

        if extracted.unsupported_images > 0 {
            ctx.skipped_images.push(format!(
                "{}: {} image(s) skipped, unsupported encoding",
                name, extracted.unsupported_images
            ));
        }
        if oversized > 0 {
            ctx.skipped_images.push(format!(
                "{}: {} image(s) skipped, larger than {} bytes",
                name, oversized, self.max_image_bytes
            ));
        }
        if over_budget > 0 {
            ctx.skipped_images.push(format!(
                "{}: {} image(s) omitted, image budget of {} exhausted",
                name, over_budget, self.max_images
            ));
        }
    }

    async fn extract(
        &self,
        name: &str,
        document: &UploadedDocument,
    ) -> Result<ExtractedDocument, DocumentError> {
        let bytes = document.content.clone();
        let parse = tokio::task::spawn_blocking(move || extract_pages(&bytes));

        match tokio::time::timeout(self.parse_timeout, parse).await {
            Ok(Ok(Ok(extracted))) => Ok(extracted),
            Ok(Ok(Err(reason))) => Err(unsupported(name, reason)),
            Ok(Err(join_error)) => Err(unsupported(name, format!("parser crashed: {join_error}"))),
            Err(_) => Err(unsupported(
                name,
                format!("parsing exceeded {}s", self.parse_timeout.as_secs()),
            )),
        }
    }
}

fn unsupported(name: &str, reason: impl Into<String>) -> DocumentError {
    DocumentError {
        name: name.to_string(),
        reason: reason.into(),
    }
}

/// Reject empty files and files without a PDF header
pub fn check_pdf_header(name: &str, content: &[u8]) -> Result<(), DocumentError> {
    if content.is_empty() {
        return Err(unsupported(name, "document is empty"));
    }
    let head = &content[..content.len().min(HEADER_SCAN_BYTES)];
    if !head.windows(5).any(|w| w == b"%PDF-") {
        return Err(unsupported(name, "missing PDF header"));
    }
    Ok(())
}

/// Extract per-page text from a PDF
pub fn extract_pages(content: &[u8]) -> Result<ExtractedDocument, String> {
    let doc = lopdf::Document::load_mem(content).map_err(|e| format!("failed to load PDF: {e}"))?;
    let page_ids = doc.get_pages();

    debug!(page_count = page_ids.len(), "Extracting text from PDF");

    let mut extracted = ExtractedDocument {
        page_count: page_ids.len(),
        ..ExtractedDocument::default()
    };
    for (page_num, page_id) in page_ids.iter() {
        match doc.get_page_content(*page_id) {
            Ok(stream) => {
                let text = clean_text(&extract_text_from_content(&stream));
                if !text.is_empty() {
                    extracted.pages.push(PageText {
                        page: *page_num,
                        text,
                    });
                }
            }
            Err(e) => {
                warn!(page = page_num, error = %e, "Failed to read page content, skipping");
            }
        }
        collect_page_images(&doc, *page_num, *page_id, &mut extracted);
    }

    if extracted.pages.is_empty() && extracted.images.is_empty() {
        return Err("no text or image content extracted from PDF".to_string());
    }

    Ok(extracted)
}

fn resolve<'a>(doc: &'a lopdf::Document, object: &'a Object) -> Option<&'a Object> {
    match object {
        Object::Reference(id) => doc.get_object(*id).ok(),
        other => Some(other),
    }
}

fn resolve_dict<'a>(doc: &'a lopdf::Document, dict: &'a Dictionary, key: &[u8]) -> Option<&'a Dictionary> {
    resolve(doc, dict.get(key).ok()?)?.as_dict().ok()
}

/// Image XObjects referenced from a page's own resources
///
/// Only DCT (JPEG) streams are kept; their bytes are a complete JPEG file.
fn collect_page_images(doc: &lopdf::Document, page_num: u32, page_id: ObjectId, out: &mut ExtractedDocument) {
    let Some(xobjects) = doc
        .get_dictionary(page_id)
        .ok()
        .and_then(|page| resolve_dict(doc, page, b"Resources"))
        .and_then(|resources| resolve_dict(doc, resources, b"XObject"))
    else {
        return;
    };

    for (_, entry) in xobjects.iter() {
        let Some(Ok(stream)) = resolve(doc, entry).map(Object::as_stream) else {
            continue;
        };
        let is_image = stream
            .dict
            .get(b"Subtype")
            .and_then(Object::as_name)
            .is_ok_and(|subtype| subtype == b"Image");
        if !is_image {
            continue;
        }

        if is_dct_only(doc, &stream.dict) {
            out.images.push(PageImage {
                page: page_num,
                mime_type: JPEG_MIME.to_string(),
                data: stream.content.clone(),
            });
        } else {
            out.unsupported_images += 1;
        }
    }
}

/// The stream's filter chain is exactly `DCTDecode`
fn is_dct_only(doc: &lopdf::Document, dict: &Dictionary) -> bool {
    let Some(filter) = dict.get(b"Filter").ok().and_then(|f| resolve(doc, f)) else {
        return false;
    };
    match filter {
        Object::Name(name) => name == b"DCTDecode",
        Object::Array(filters) => {
            filters.len() == 1 && matches!(&filters[0], Object::Name(name) if name == b"DCTDecode")
        }
        _ => false,
    }
}

/// Text between BT/ET operators of a content stream
fn extract_text_from_content(content: &[u8]) -> String {
    let content_str = String::from_utf8_lossy(content);
    let mut text = String::new();
    let mut in_text_block = false;
    let mut current_text = String::new();

    for line in content_str.lines() {
        let trimmed = line.trim();

        if trimmed == "BT" {
            in_text_block = true;
            continue;
        }

        if trimmed == "ET" {
            in_text_block = false;
            if !current_text.is_empty() {
                text.push_str(&current_text);
                text.push(' ');
                current_text.clear();
            }
            continue;
        }

        if in_text_block {
            if let Some(shown) = extract_text_from_operator(trimmed) {
                current_text.push_str(&shown);
            }
        }
    }

    text
}

/// Text shown by a `Tj`, `'`, `"` or `TJ` operator line
fn extract_text_from_operator(line: &str) -> Option<String> {
    if line.ends_with("Tj") || line.ends_with('\'') || line.ends_with('"') {
        let start = line.find('(')?;
        let end = line.rfind(')')?;
        if end > start {
            return Some(decode_pdf_string(&line[start + 1..end]));
        }
        return None;
    }

    if line.ends_with("TJ") {
        let mut result = String::new();
        let mut in_paren = false;
        let mut escaped = false;
        let mut current = String::new();

        for ch in line.chars() {
            match ch {
                _ if escaped => {
                    current.push('\\');
                    current.push(ch);
                    escaped = false;
                }
                '\\' if in_paren => escaped = true,
                '(' if !in_paren => in_paren = true,
                ')' if in_paren => {
                    in_paren = false;
                    result.push_str(&decode_pdf_string(&current));
                    current.clear();
                }
                _ if in_paren => current.push(ch),
                _ => {}
            }
        }

        if !result.is_empty() {
            return Some(result);
        }
    }

    None
}

/// Decode PDF literal string escapes
fn decode_pdf_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars();

    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some('n') => result.push('\n'),
                Some('r') => result.push('\r'),
                Some('t') => result.push('\t'),
                Some(c) => result.push(c),
                None => {}
            }
        } else {
            result.push(ch);
        }
    }

    result
}

/// Collapse whitespace and normalise typographic quotes
fn clean_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace('\u{FEFF}', "")
        .replace(['\u{201C}', '\u{201D}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'")
}

/// Result of folding one document into the remaining budget
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldedDocument {
    pub text: Option<String>,
    pub chars_used: usize,
    pub truncation: Option<String>,
}

/// Render a document as `[page N]` segments, keeping the earliest pages first
pub fn fold_document(
    name: &str,
    extracted: &ExtractedDocument,
    segment_chars: usize,
    budget: usize,
) -> FoldedDocument {
    let splitter = TextSplitter::new(ChunkConfig::new(segment_chars));
    let mut lines = vec![format!(
        "# Source document: {} (pages={})",
        name, extracted.page_count
    )];
    let mut used = 0usize;
    let mut last_page_kept = None;
    let mut cut = false;

    'pages: for page in &extracted.pages {
        for segment in splitter.chunks(&page.text) {
            let remaining = budget - used;
            if remaining == 0 {
                cut = true;
                break 'pages;
            }
            let len = segment.chars().count();
            if len <= remaining {
                lines.push(format!("[page {}] {}", page.page, segment));
                used += len;
            } else {
                let head: String = segment.chars().take(remaining).collect();
                lines.push(format!("[page {}] {}", page.page, head));
                used += remaining;
                last_page_kept = Some(page.page);
                cut = true;
                break 'pages;
            }
        }
        last_page_kept = Some(page.page);
    }

    let truncation = cut.then(|| match last_page_kept {
        Some(page) => format!(
            "{}: truncated after page {} of {} (context budget {} chars)",
            name, page, extracted.page_count, budget
        ),
        None => format!("{}: omitted, context budget exhausted", name),
    });

    FoldedDocument {
        text: (used > 0).then(|| lines.join("\n")),
        chars_used: used,
        truncation,
    }
}
