//! Text extraction from uploaded office documents
//!
//! Dispatch is by declared file type, verified against magic bytes before any
//! parser runs. Every format funnels into plain text plus lightweight
//! metadata; downstream stages never see format-specific structure.

use crate::error::{CoreError, ExtractionError, Result};
use lopdf::Object;
use quick_xml::escape::unescape;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read};
use tracing::{debug, warn};
use utoipa::ToSchema;

/// Supported document types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Pdf,
    Docx,
    Txt,
    Md,
    Csv,
}

impl FileType {
    /// Parse from a file extension or type label
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            "txt" => Some(Self::Txt),
            "md" | "markdown" => Some(Self::Md),
            "csv" => Some(Self::Csv),
            _ => None,
        }
    }

    /// Infer from a filename extension
    pub fn from_filename(filename: &str) -> Option<Self> {
        filename.rsplit('.').next().and_then(Self::parse)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Txt => "txt",
            Self::Md => "md",
            Self::Csv => "csv",
        }
    }

    /// MIME type used for blob storage
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Pdf => "application/pdf",
            Self::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            Self::Txt => "text/plain",
            Self::Md => "text/markdown",
            Self::Csv => "text/csv",
        }
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata captured during extraction
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractMetadata {
    pub page_count: Option<u32>,
    pub author: Option<String>,
    pub created: Option<String>,
    pub modified: Option<String>,
    pub char_count: usize,
}

/// Result of a successful extraction
#[derive(Debug, Clone)]
pub struct ExtractedDocument {
    pub text: String,
    pub metadata: ExtractMetadata,
}

/// Check that the payload's magic bytes agree with the declared type
pub fn verify_magic(file_type: FileType, bytes: &[u8]) -> bool {
    match file_type {
        FileType::Pdf => bytes.starts_with(b"%PDF-"),
        FileType::Docx => bytes.starts_with(b"PK\x03\x04"),
        // text formats: reject binary payloads masquerading as text
        FileType::Txt | FileType::Md | FileType::Csv => !bytes.contains(&0u8),
    }
}

/// Format-dispatching text extractor
pub struct Extractor {
    /// Below this average of printable chars per page a PDF is considered
    /// scanned
    min_chars_per_page: usize,
}

impl Default for Extractor {
    fn default() -> Self {
        Self {
            min_chars_per_page: 50,
        }
    }
}

impl Extractor {
    pub fn new(min_chars_per_page: usize) -> Self {
        Self { min_chars_per_page }
    }

    /// Extract plain text and metadata from a payload
    pub fn extract(&self, file_type: FileType, bytes: &[u8]) -> Result<ExtractedDocument> {
        if bytes.is_empty() {
            return Err(CoreError::Extraction(ExtractionError::EmptyDocument));
        }
        if !verify_magic(file_type, bytes) {
            return Err(CoreError::Extraction(ExtractionError::TypeMismatch {
                declared: file_type.as_str().to_string(),
            }));
        }

        let mut extracted = match file_type {
            FileType::Pdf => self.extract_pdf(bytes)?,
            FileType::Docx => extract_docx(bytes)?,
            FileType::Txt | FileType::Md => extract_text(bytes),
            FileType::Csv => extract_csv(bytes)?,
        };

        extracted.text = extracted.text.trim().to_string();
        if extracted.text.is_empty() {
            return Err(ExtractionError::EmptyDocument.into());
        }
        extracted.metadata.char_count = extracted.text.chars().count();
        debug!(
            file_type = %file_type,
            chars = extracted.metadata.char_count,
            "extracted document text"
        );
        Ok(extracted)
    }

    fn extract_pdf(&self, bytes: &[u8]) -> Result<ExtractedDocument> {
        let doc = lopdf::Document::load_mem(bytes)
            .map_err(|e| ExtractionError::Unreadable(format!("pdf: {}", e)))?;
        let page_count = doc.get_pages().len() as u32;

        let mut metadata = ExtractMetadata {
            page_count: Some(page_count.max(1)),
            ..Default::default()
        };
        read_pdf_info(&doc, &mut metadata);

        let text = pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| ExtractionError::Unreadable(format!("pdf: {}", e)))?;

        let printable = text.chars().filter(|c| !c.is_whitespace()).count();
        let per_page = printable / page_count.max(1) as usize;
        if per_page < self.min_chars_per_page {
            // no usable text layer; rasterize+OCR is not wired into this build
            warn!(per_page, "PDF text layer below threshold");
            return Err(ExtractionError::ScannedPdf.into());
        }

        Ok(ExtractedDocument { text, metadata })
    }
}

fn read_pdf_info(doc: &lopdf::Document, metadata: &mut ExtractMetadata) {
    let Ok(info_ref) = doc.trailer.get(b"Info") else {
        return;
    };
    let info = match info_ref {
        Object::Reference(id) => match doc.get_object(*id) {
            Ok(Object::Dictionary(dict)) => dict,
            _ => return,
        },
        Object::Dictionary(dict) => dict,
        _ => return,
    };

    let read_string = |key: &[u8]| -> Option<String> {
        match info.get(key) {
            Ok(Object::String(bytes, _)) => {
                let s = String::from_utf8_lossy(bytes).trim().to_string();
                (!s.is_empty()).then_some(s)
            }
            _ => None,
        }
    };

    metadata.author = read_string(b"Author");
    metadata.created = read_string(b"CreationDate");
    metadata.modified = read_string(b"ModDate");
}

fn extract_text(bytes: &[u8]) -> ExtractedDocument {
    ExtractedDocument {
        text: String::from_utf8_lossy(bytes).into_owned(),
        metadata: ExtractMetadata::default(),
    }
}

fn extract_csv(bytes: &[u8]) -> Result<ExtractedDocument> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes);

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| ExtractionError::Unreadable(format!("csv: {}", e)))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut lines = vec![headers.join(", ")];
    for record in reader.records() {
        let record = record.map_err(|e| ExtractionError::Unreadable(format!("csv: {}", e)))?;
        let row: Vec<String> = record
            .iter()
            .enumerate()
            .map(|(i, value)| {
                let column = headers
                    .get(i)
                    .map(|h| h.as_str())
                    .filter(|h| !h.is_empty())
                    .map(|h| h.to_string())
                    .unwrap_or_else(|| format!("col{}", i));
                format!("{}: {}", column, value.trim())
            })
            .collect();
        lines.push(row.join("; "));
    }

    Ok(ExtractedDocument {
        text: lines.join("\n"),
        metadata: ExtractMetadata::default(),
    })
}

fn extract_docx(bytes: &[u8]) -> Result<ExtractedDocument> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| ExtractionError::Unreadable(format!("docx: {}", e)))?;

    let mut document_xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|_| ExtractionError::TypeMismatch {
            declared: "docx".to_string(),
        })?
        .read_to_string(&mut document_xml)
        .map_err(|e| ExtractionError::Unreadable(format!("docx: {}", e)))?;

    let text = parse_docx_body(&document_xml)?;

    let mut metadata = ExtractMetadata::default();
    if let Ok(mut core) = archive.by_name("docProps/core.xml") {
        let mut core_xml = String::new();
        if core.read_to_string(&mut core_xml).is_ok() {
            parse_docx_core_properties(&core_xml, &mut metadata);
        }
    }

    Ok(ExtractedDocument { text, metadata })
}

/// Flatten the document body: paragraphs separated by blank lines, table
/// cells joined row-major
fn parse_docx_body(xml: &str) -> Result<String> {
    let mut reader = Reader::from_str(xml);
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut cells: Vec<String> = Vec::new();
    let mut in_text = false;
    let mut in_cell = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"w:t" => in_text = true,
                b"w:tc" => in_cell = true,
                _ => {}
            },
            Ok(Event::Text(t)) if in_text => {
                let decoded = t
                    .decode()
                    .map_err(|e| ExtractionError::Unreadable(format!("docx: {}", e)))?;
                let fragment = unescape(&decoded)
                    .map_err(|e| ExtractionError::Unreadable(format!("docx: {}", e)))?;
                current.push_str(&fragment);
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"w:t" => in_text = false,
                b"w:p" => {
                    if in_cell {
                        if !current.trim().is_empty() {
                            cells.push(current.trim().to_string());
                        }
                    } else if !current.trim().is_empty() {
                        paragraphs.push(current.trim().to_string());
                    }
                    current.clear();
                }
                b"w:tc" => in_cell = false,
                b"w:tr" => {
                    if !cells.is_empty() {
                        paragraphs.push(cells.join("; "));
                        cells.clear();
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(ExtractionError::Unreadable(format!("docx: {}", e)).into());
            }
            _ => {}
        }
    }

    Ok(paragraphs.join("\n\n"))
}

fn parse_docx_core_properties(xml: &str, metadata: &mut ExtractMetadata) {
    let mut reader = Reader::from_str(xml);
    let mut field: Option<&'static str> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                field = match e.name().as_ref() {
                    b"dc:creator" => Some("author"),
                    b"dcterms:created" => Some("created"),
                    b"dcterms:modified" => Some("modified"),
                    _ => None,
                };
            }
            Ok(Event::Text(t)) => {
                let value_result = t
                    .decode()
                    .ok()
                    .and_then(|decoded| unescape(&decoded).ok().map(|v| v.into_owned()));
                if let (Some(name), Some(value)) = (field, value_result) {
                    let value = value.trim().to_string();
                    if value.is_empty() {
                        continue;
                    }
                    match name {
                        "author" => metadata.author = Some(value),
                        "created" => metadata.created = Some(value),
                        "modified" => metadata.modified = Some(value),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(_)) => field = None,
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn docx_bytes(document_xml: &str, core_xml: Option<&str>) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("word/document.xml", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(document_xml.as_bytes()).unwrap();
        if let Some(core) = core_xml {
            writer
                .start_file("docProps/core.xml", SimpleFileOptions::default())
                .unwrap();
            writer.write_all(core.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_file_type_parsing() {
        assert_eq!(FileType::parse("PDF"), Some(FileType::Pdf));
        assert_eq!(FileType::parse("markdown"), Some(FileType::Md));
        assert_eq!(FileType::parse("exe"), None);
        assert_eq!(
            FileType::from_filename("Q1 report.final.docx"),
            Some(FileType::Docx)
        );
    }

    #[test]
    fn test_empty_file_rejected() {
        let extractor = Extractor::default();
        let err = extractor.extract(FileType::Txt, b"").unwrap_err();
        assert!(matches!(
            err,
            CoreError::Extraction(ExtractionError::EmptyDocument)
        ));
    }

    #[test]
    fn test_magic_mismatch_rejected() {
        let extractor = Extractor::default();
        let err = extractor
            .extract(FileType::Pdf, b"this is not a pdf")
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Extraction(ExtractionError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_binary_masquerading_as_text_rejected() {
        let extractor = Extractor::default();
        let err = extractor
            .extract(FileType::Txt, b"text\x00binary")
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Extraction(ExtractionError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_txt_lossy_utf8() {
        let extractor = Extractor::default();
        let bytes = [b"valid ".as_slice(), &[0xFF, 0xFE], b" tail"].concat();
        let result = extractor.extract(FileType::Txt, &bytes).unwrap();
        assert!(result.text.starts_with("valid"));
        assert!(result.text.ends_with("tail"));
        assert_eq!(result.metadata.char_count, result.text.chars().count());
    }

    #[test]
    fn test_csv_serialization() {
        let extractor = Extractor::default();
        let csv = "name,team\nAda,Engineering\nGrace,Research\n";
        let result = extractor.extract(FileType::Csv, csv.as_bytes()).unwrap();

        let lines: Vec<&str> = result.text.lines().collect();
        assert_eq!(lines[0], "name, team");
        assert_eq!(lines[1], "name: Ada; team: Engineering");
        assert_eq!(lines[2], "name: Grace; team: Research");
    }

    #[test]
    fn test_csv_chunk_input_is_deterministic() {
        let extractor = Extractor::default();
        let csv = "a,b\n1,2\n3,4\n";
        let first = extractor.extract(FileType::Csv, csv.as_bytes()).unwrap();
        let second = extractor.extract(FileType::Csv, csv.as_bytes()).unwrap();
        assert_eq!(first.text, second.text);
    }

    #[test]
    fn test_docx_paragraphs_and_tables() {
        let xml = r#"<?xml version="1.0"?>
            <w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
              <w:body>
                <w:p><w:r><w:t>Heading one</w:t></w:r></w:p>
                <w:p><w:r><w:t>Body paragraph.</w:t></w:r></w:p>
                <w:tbl>
                  <w:tr>
                    <w:tc><w:p><w:r><w:t>cell a</w:t></w:r></w:p></w:tc>
                    <w:tc><w:p><w:r><w:t>cell b</w:t></w:r></w:p></w:tc>
                  </w:tr>
                </w:tbl>
              </w:body>
            </w:document>"#;
        let bytes = docx_bytes(xml, None);

        let extractor = Extractor::default();
        let result = extractor.extract(FileType::Docx, &bytes).unwrap();

        let paragraphs: Vec<&str> = result.text.split("\n\n").collect();
        assert_eq!(paragraphs[0], "Heading one");
        assert_eq!(paragraphs[1], "Body paragraph.");
        assert_eq!(paragraphs[2], "cell a; cell b");
    }

    #[test]
    fn test_docx_core_properties() {
        let doc_xml = r#"<w:document xmlns:w="x"><w:body>
            <w:p><w:r><w:t>content</w:t></w:r></w:p>
        </w:body></w:document>"#;
        let core_xml = r#"<cp:coreProperties xmlns:cp="c" xmlns:dc="d" xmlns:dcterms="t">
            <dc:creator>Ada Lovelace</dc:creator>
            <dcterms:created>2024-01-15T09:00:00Z</dcterms:created>
            <dcterms:modified>2024-02-01T10:30:00Z</dcterms:modified>
        </cp:coreProperties>"#;
        let bytes = docx_bytes(doc_xml, Some(core_xml));

        let extractor = Extractor::default();
        let result = extractor.extract(FileType::Docx, &bytes).unwrap();
        assert_eq!(result.metadata.author.as_deref(), Some("Ada Lovelace"));
        assert_eq!(
            result.metadata.created.as_deref(),
            Some("2024-01-15T09:00:00Z")
        );
    }

    #[test]
    fn test_docx_without_body_text_is_empty() {
        let xml = r#"<w:document xmlns:w="x"><w:body></w:body></w:document>"#;
        let bytes = docx_bytes(xml, None);
        let extractor = Extractor::default();
        let err = extractor.extract(FileType::Docx, &bytes).unwrap_err();
        assert!(matches!(
            err,
            CoreError::Extraction(ExtractionError::EmptyDocument)
        ));
    }
}
