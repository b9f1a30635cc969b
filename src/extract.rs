//! Content extraction collaborator.
//!
//! The `extract` pipeline filter hands the raw stream of a file to a
//! [`ContentExtractor`] and gets back text plus structured metadata.
//! [`DefaultExtractor`] covers the plain-text family, PDF, and DOCX; other
//! binary types produce no text so the file is still indexed by metadata.

use std::io::{Cursor, Read};

use quick_xml::events::Event;
use serde_json::{Map, Value};

use crate::error::ExtractError;
use crate::models::extension_of;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

/// Maximum decompressed bytes read from a single ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Result of running an extractor over one file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extracted {
    pub content: Option<String>,
    pub content_type: Option<String>,
    pub metadata: Map<String, Value>,
}

pub trait ContentExtractor: Send + Sync {
    fn extract(
        &self,
        stream: &mut dyn Read,
        filename: &str,
        full_path: &str,
        size_hint: u64,
    ) -> Result<Extracted, ExtractError>;
}

/// MIME type guessed from the file extension.
pub fn detect_content_type(filename: &str) -> Option<&'static str> {
    let mime = match extension_of(filename).as_str() {
        "md" | "markdown" => "text/markdown",
        "txt" | "log" | "text" => "text/plain",
        "csv" => "text/csv",
        "json" => "application/json",
        "yaml" | "yml" => "text/yaml",
        "toml" => "application/toml",
        "rst" => "text/x-rst",
        "html" | "htm" => "text/html",
        "xml" => "application/xml",
        "pdf" => MIME_PDF,
        "docx" => MIME_DOCX,
        "doc" => "application/msword",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "zip" => "application/zip",
        _ => return None,
    };
    Some(mime)
}

fn is_textual(mime: &str) -> bool {
    mime.starts_with("text/")
        || matches!(mime, "application/json" | "application/toml" | "application/xml")
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultExtractor;

impl ContentExtractor for DefaultExtractor {
    fn extract(
        &self,
        stream: &mut dyn Read,
        filename: &str,
        _full_path: &str,
        size_hint: u64,
    ) -> Result<Extracted, ExtractError> {
        let content_type = detect_content_type(filename);
        let mut bytes = Vec::with_capacity(size_hint.min(16 * 1024 * 1024) as usize);
        stream.read_to_end(&mut bytes)?;

        let mut extracted = Extracted {
            content_type: content_type.map(String::from),
            ..Default::default()
        };

        match content_type {
            Some(MIME_PDF) => {
                let text = pdf_extract::extract_text_from_mem(&bytes)
                    .map_err(|e| ExtractError::Pdf(e.to_string()))?;
                extracted.content = Some(text);
            }
            Some(MIME_DOCX) => {
                let (text, metadata) = extract_docx(&bytes)?;
                extracted.content = Some(text);
                extracted.metadata = metadata;
            }
            Some(mime) if is_textual(mime) => {
                extracted.content = Some(String::from_utf8_lossy(&bytes).into_owned());
            }
            _ => {}
        }

        Ok(extracted)
    }
}

type DocxArchive<'a> = zip::ZipArchive<Cursor<&'a [u8]>>;

fn read_entry(archive: &mut DocxArchive<'_>, name: &str) -> Result<Option<Vec<u8>>, ExtractError> {
    let entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(ExtractError::Docx(e.to_string())),
    };
    let mut out = Vec::new();
    entry.take(MAX_XML_ENTRY_BYTES).read_to_end(&mut out)?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Docx(format!("{} exceeds size limit", name)));
    }
    Ok(Some(out))
}

fn extract_docx(bytes: &[u8]) -> Result<(String, Map<String, Value>), ExtractError> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| ExtractError::Docx(e.to_string()))?;

    let body = read_entry(&mut archive, "word/document.xml")?
        .ok_or_else(|| ExtractError::Docx("word/document.xml not found".to_string()))?;
    let text = docx_text(&body)?;

    let mut metadata = Map::new();
    if let Some(core) = read_entry(&mut archive, "docProps/core.xml")? {
        for (key, value) in core_properties(&core)? {
            metadata.insert(key.to_string(), Value::String(value));
        }
    }
    Ok((text, metadata))
}

/// Text of every `w:t` run, one line per `w:p` paragraph.
fn docx_text(xml: &[u8]) -> Result<String, ExtractError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" if !out.is_empty() && !out.ends_with('\n') => out.push('\n'),
                _ => {}
            },
            Ok(Event::Text(t)) if in_text => {
                let text = t.unescape().map_err(|e| ExtractError::Docx(e.to_string()))?;
                out.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Docx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

/// Title, author, and keywords from `docProps/core.xml`.
fn core_properties(xml: &[u8]) -> Result<Vec<(&'static str, String)>, ExtractError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut current: Option<&'static str> = None;
    let mut props = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                current = match e.local_name().as_ref() {
                    b"title" => Some("title"),
                    b"creator" => Some("author"),
                    b"keywords" => Some("keywords"),
                    _ => None,
                };
            }
            Ok(Event::Text(t)) => {
                if let Some(key) = current.take() {
                    let value = t.unescape().map_err(|e| ExtractError::Docx(e.to_string()))?;
                    props.push((key, value.into_owned()));
                }
            }
            Ok(Event::End(_)) => current = None,
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Docx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(props)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn run(bytes: &[u8], filename: &str) -> Result<Extracted, ExtractError> {
        DefaultExtractor.extract(&mut Cursor::new(bytes), filename, filename, bytes.len() as u64)
    }

    fn build_docx() -> Vec<u8> {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default();
        zip.start_file("word/document.xml", options).unwrap();
        zip.write_all(
            br#"<w:document xmlns:w="w"><w:body>
<w:p><w:r><w:t>Hello</w:t></w:r><w:r><w:t xml:space="preserve"> world</w:t></w:r></w:p>
<w:p><w:r><w:t>Second &amp; last</w:t></w:r></w:p>
</w:body></w:document>"#,
        )
        .unwrap();
        zip.start_file("docProps/core.xml", options).unwrap();
        zip.write_all(
            br#"<cp:coreProperties xmlns:cp="cp" xmlns:dc="dc"><dc:title>Quarterly</dc:title><dc:creator>Ada</dc:creator></cp:coreProperties>"#,
        )
        .unwrap();
        zip.finish().unwrap().into_inner()
    }

    #[test]
    fn test_plain_text() {
        let out = run(b"just text", "notes.txt").unwrap();
        assert_eq!(out.content.as_deref(), Some("just text"));
        assert_eq!(out.content_type.as_deref(), Some("text/plain"));
    }

    #[test]
    fn test_unknown_binary_has_no_content() {
        let out = run(&[0, 1, 2, 3], "blob.bin").unwrap();
        assert!(out.content.is_none());
        assert!(out.content_type.is_none());
    }

    #[test]
    fn test_invalid_pdf_is_an_error() {
        assert!(matches!(run(b"not a pdf", "a.pdf"), Err(ExtractError::Pdf(_))));
    }

    #[test]
    fn test_invalid_docx_is_an_error() {
        assert!(matches!(run(b"not a zip", "a.docx"), Err(ExtractError::Docx(_))));
    }

    #[test]
    fn test_docx_text_and_properties() {
        let out = run(&build_docx(), "report.docx").unwrap();
        assert_eq!(out.content.as_deref(), Some("Hello world\nSecond & last"));
        assert_eq!(out.metadata["title"], "Quarterly");
        assert_eq!(out.metadata["author"], "Ada");
    }

    #[test]
    fn test_detect_content_type() {
        assert_eq!(detect_content_type("A.PDF"), Some(MIME_PDF));
        assert_eq!(detect_content_type("x.yml"), Some("text/yaml"));
        assert_eq!(detect_content_type("x"), None);
    }
}
