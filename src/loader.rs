//! Loader registry: text extraction selected by file extension.
//!
//! [`Loader::for_extension`] is a pure lookup from an extension to one
//! extraction strategy; [`Loader::load`] reads the file and returns one text
//! segment per page (PDF), slide (PPTX) or sheet (XLSX), or a single segment
//! for flowing text (TXT, Markdown, DOCX).
//!
//! OOXML containers are read with `zip` + `quick-xml`. Every ZIP entry is
//! read through a decompression ceiling so a crafted archive cannot exhaust
//! memory. Legacy `.doc`/`.ppt`/`.xls` names are routed to the OOXML
//! readers; genuine binary legacy files fail with an extraction error.

use std::io::Read;
use std::path::Path;

use quick_xml::events::Event;

use crate::error::{DocError, Result};

/// Extensions accepted at upload time, in display order.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    ".pdf", ".txt", ".md", ".docx", ".doc", ".pptx", ".ppt", ".xlsx", ".xls",
];

/// Maximum sheets to process in a workbook.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet.
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes read from a single ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// One extraction strategy per supported format family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loader {
    Pdf,
    PlainText,
    Word,
    Presentation,
    Spreadsheet,
}

/// Comma-separated list of supported extensions, for error messages.
pub fn supported_list() -> String {
    SUPPORTED_EXTENSIONS.join(", ")
}

/// Lower-cased extension of `filename` including the leading dot, or `""`.
pub fn extension_of(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_lowercase()))
        .unwrap_or_default()
}

impl Loader {
    /// Look up the loader for an extension (`"pdf"` or `".PDF"` both work).
    pub fn for_extension(ext: &str) -> Result<Loader> {
        let normalized = format!(".{}", ext.trim_start_matches('.').to_lowercase());
        match normalized.as_str() {
            ".pdf" => Ok(Loader::Pdf),
            ".txt" | ".md" => Ok(Loader::PlainText),
            ".docx" | ".doc" => Ok(Loader::Word),
            ".pptx" | ".ppt" => Ok(Loader::Presentation),
            ".xlsx" | ".xls" => Ok(Loader::Spreadsheet),
            _ => Err(DocError::UnsupportedFileType {
                extension: if ext.is_empty() {
                    "(none)".to_string()
                } else {
                    normalized
                },
                supported: supported_list(),
            }),
        }
    }

    pub fn for_path(path: &Path) -> Result<Loader> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        Loader::for_extension(ext)
    }

    /// Read `path` and extract its text segments.
    ///
    /// Fails with [`DocError::Extraction`] when the file cannot be read or
    /// parsed and with [`DocError::EmptyContent`] when it parses but holds
    /// no text.
    pub fn load(&self, path: &Path) -> Result<Vec<String>> {
        let bytes = std::fs::read(path)
            .map_err(|e| DocError::extraction(format!("could not read upload: {}", e)))?;
        self.extract(&bytes)
    }

    /// Extract text segments from in-memory file content.
    pub fn extract(&self, bytes: &[u8]) -> Result<Vec<String>> {
        let segments = match self {
            Loader::Pdf => extract_pdf(bytes)?,
            Loader::PlainText => vec![extract_plain_text(bytes)?],
            Loader::Word => vec![extract_docx(bytes)?],
            Loader::Presentation => extract_pptx(bytes)?,
            Loader::Spreadsheet => extract_xlsx(bytes)?,
        };
        if segments.iter().all(|s| s.trim().is_empty()) {
            return Err(DocError::EmptyContent);
        }
        Ok(segments)
    }
}

fn extract_plain_text(bytes: &[u8]) -> Result<String> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| DocError::extraction(format!("text file is not valid UTF-8: {}", e)))?;
    Ok(text.trim_start_matches('\u{feff}').replace("\r\n", "\n"))
}

/// Per-page extraction with `lopdf`, falling back to whole-document
/// extraction with `pdf-extract` when page extraction fails or finds nothing.
fn extract_pdf(bytes: &[u8]) -> Result<Vec<String>> {
    let doc = lopdf::Document::load_mem(bytes)
        .map_err(|e| DocError::extraction(format!("PDF parse failed: {}", e)))?;

    let pages: std::result::Result<Vec<String>, _> = doc
        .get_pages()
        .keys()
        .map(|number| doc.extract_text(&[*number]))
        .collect();

    match pages {
        Ok(pages) if pages.iter().any(|p| !p.trim().is_empty()) => Ok(pages),
        _ => {
            let text = pdf_extract::extract_text_from_mem(bytes)
                .map_err(|e| DocError::extraction(format!("PDF extraction failed: {}", e)))?;
            Ok(vec![text])
        }
    }
}

type ZipReader<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_zip(bytes: &[u8]) -> Result<ZipReader<'_>> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| DocError::extraction(format!("not an OOXML container: {}", e)))
}

fn read_zip_entry_bounded(archive: &mut ZipReader<'_>, name: &str) -> Result<Vec<u8>> {
    let entry = archive
        .by_name(name)
        .map_err(|e| DocError::extraction(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(DocError::extraction)?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(DocError::extraction(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

/// Entries matching `prefix<N>.xml`, sorted by `N`.
fn numbered_entries(archive: &ZipReader<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

/// Collect the text of every `<*:t>` element, ending each `<*:p>` paragraph
/// with a newline. Works for both WordprocessingML and DrawingML.
fn collect_paragraph_text(xml: &[u8]) -> Result<String> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_t = true,
            Ok(Event::Text(te)) if in_t => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"br" => out.push('\n'),
                b"tab" => out.push('\t'),
                _ => {}
            },
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(DocError::extraction(format!("malformed XML: {}", e))),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

fn extract_docx(bytes: &[u8]) -> Result<String> {
    let mut archive = open_zip(bytes)?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml")?;
    collect_paragraph_text(&xml)
}

fn extract_pptx(bytes: &[u8]) -> Result<Vec<String>> {
    let mut archive = open_zip(bytes)?;
    let slide_names = numbered_entries(&archive, "ppt/slides/slide");
    if slide_names.is_empty() {
        return Err(DocError::extraction("presentation has no slides"));
    }
    slide_names
        .iter()
        .map(|name| {
            let xml = read_zip_entry_bounded(&mut archive, name)?;
            collect_paragraph_text(&xml)
        })
        .collect()
}

fn extract_xlsx(bytes: &[u8]) -> Result<Vec<String>> {
    let mut archive = open_zip(bytes)?;
    let shared_strings = read_shared_strings(&mut archive)?;
    let sheet_names = numbered_entries(&archive, "xl/worksheets/sheet");
    if sheet_names.is_empty() {
        return Err(DocError::extraction("workbook has no worksheets"));
    }
    sheet_names
        .iter()
        .take(XLSX_MAX_SHEETS)
        .map(|name| {
            let xml = read_zip_entry_bounded(&mut archive, name)?;
            extract_sheet_rows(&xml, &shared_strings)
        })
        .collect()
}

fn read_shared_strings(archive: &mut ZipReader<'_>) -> Result<Vec<String>> {
    if archive.by_name("xl/sharedStrings.xml").is_err() {
        // Workbooks holding only numbers have no shared-string table.
        return Ok(Vec::new());
    }
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml")?;
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_t = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                if let Some(s) = current.as_mut() {
                    s.push_str(te.unescape().unwrap_or_default().as_ref());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"si" => strings.extend(current.take()),
                b"t" => in_t = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(DocError::extraction(format!("malformed XML: {}", e))),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Render one worksheet as lines of space-separated cell values.
fn extract_sheet_rows(xml: &[u8], shared_strings: &[String]) -> Result<String> {
    let mut rows: Vec<String> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_value = false;
    let mut cell_is_shared_str = false;
    let mut cell_count = 0usize;
    loop {
        if cell_count >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    cell_is_shared_str = e.attributes().any(|a| {
                        a.as_ref()
                            .map(|a| a.key.as_ref() == b"t" && a.value.as_ref() == b"s")
                            .unwrap_or(false)
                    });
                }
                // <v> holds values, <t> holds inline strings.
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                let raw = te.unescape().unwrap_or_default();
                let value = raw.trim();
                let resolved = if value.is_empty() {
                    None
                } else if cell_is_shared_str {
                    value
                        .parse::<usize>()
                        .ok()
                        .and_then(|i| shared_strings.get(i).cloned())
                } else {
                    Some(value.to_string())
                };
                if let Some(v) = resolved {
                    row.push(v);
                    cell_count += 1;
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => cell_is_shared_str = false,
                b"row" => {
                    if !row.is_empty() {
                        rows.push(row.join(" "));
                        row.clear();
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(DocError::extraction(format!("malformed XML: {}", e))),
            _ => {}
        }
        buf.clear();
    }
    if !row.is_empty() {
        rows.push(row.join(" "));
    }
    Ok(rows.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zip_with(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            for (name, body) in entries {
                zip.start_file(*name, zip::write::SimpleFileOptions::default())
                    .unwrap();
                zip.write_all(body.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        buf
    }

    #[test]
    fn lookup_is_case_insensitive() {
        assert_eq!(Loader::for_extension("PDF").unwrap(), Loader::Pdf);
        assert_eq!(Loader::for_extension(".Txt").unwrap(), Loader::PlainText);
        assert_eq!(Loader::for_extension("md").unwrap(), Loader::PlainText);
        assert_eq!(Loader::for_extension(".xls").unwrap(), Loader::Spreadsheet);
    }

    #[test]
    fn unsupported_extension_lists_supported_set() {
        let err = Loader::for_extension(".exe").unwrap_err();
        match err {
            DocError::UnsupportedFileType {
                extension,
                supported,
            } => {
                assert_eq!(extension, ".exe");
                assert!(supported.contains(".pdf"));
                assert!(supported.contains(".xlsx"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn extension_of_handles_missing_and_mixed_case() {
        assert_eq!(extension_of("Report.PDF"), ".pdf");
        assert_eq!(extension_of("archive.tar.gz"), ".gz");
        assert_eq!(extension_of("README"), "");
    }

    #[test]
    fn plain_text_is_one_segment() {
        let segments = Loader::PlainText
            .extract(b"\xEF\xBB\xBFline one\r\nline two")
            .unwrap();
        assert_eq!(segments, vec!["line one\nline two".to_string()]);
    }

    #[test]
    fn invalid_utf8_is_extraction_error() {
        let err = Loader::PlainText.extract(&[0xff, 0xfe, 0x00, 0x41]).unwrap_err();
        assert!(matches!(err, DocError::Extraction(_)));
    }

    #[test]
    fn whitespace_only_is_empty_content() {
        let err = Loader::PlainText.extract(b"  \n\n\t ").unwrap_err();
        assert!(matches!(err, DocError::EmptyContent));
    }

    #[test]
    fn read_failure_does_not_leak_server_paths() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("3f2a_secret-dir").join("report.txt");
        let err = Loader::PlainText.load(&path).unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, DocError::Extraction(_)));
        assert!(message.starts_with("Failed to extract text: could not read upload"));
        assert!(!message.contains("secret-dir"));
        assert!(!message.contains(&tmp.path().display().to_string()));
    }

    #[test]
    fn corrupted_pdf_is_extraction_error() {
        let err = Loader::Pdf.extract(b"%PDF-1.4 this is not a pdf").unwrap_err();
        assert!(matches!(err, DocError::Extraction(_)));
    }

    #[test]
    fn docx_paragraphs_become_lines() {
        let xml = r#"<?xml version="1.0"?><w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body><w:p><w:r><w:t>First </w:t></w:r><w:r><w:t>paragraph.</w:t></w:r></w:p><w:p><w:r><w:t>Second &amp; last.</w:t></w:r></w:p></w:body></w:document>"#;
        let bytes = zip_with(&[("word/document.xml", xml)]);
        let segments = Loader::Word.extract(&bytes).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0], "First paragraph.\nSecond & last.\n");
    }

    #[test]
    fn docx_without_body_is_extraction_error() {
        let bytes = zip_with(&[("word/other.xml", "<x/>")]);
        let err = Loader::Word.extract(&bytes).unwrap_err();
        assert!(matches!(err, DocError::Extraction(_)));
    }

    #[test]
    fn binary_legacy_doc_is_extraction_error() {
        // OLE2 compound document magic.
        let err = Loader::Word
            .extract(&[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1])
            .unwrap_err();
        assert!(matches!(err, DocError::Extraction(_)));
    }

    #[test]
    fn pptx_yields_one_segment_per_slide_in_order() {
        let slide = |text: &str| {
            format!(
                r#"<p:sld xmlns:p="p" xmlns:a="a"><p:cSld><p:spTree><p:sp><p:txBody><a:p><a:r><a:t>{}</a:t></a:r></a:p></p:txBody></p:sp></p:spTree></p:cSld></p:sld>"#,
                text
            )
        };
        let s10 = slide("tenth");
        let s2 = slide("second");
        let s1 = slide("first");
        let bytes = zip_with(&[
            ("ppt/slides/slide10.xml", s10.as_str()),
            ("ppt/slides/slide2.xml", s2.as_str()),
            ("ppt/slides/slide1.xml", s1.as_str()),
        ]);
        let segments = Loader::Presentation.extract(&bytes).unwrap();
        assert_eq!(segments, vec!["first\n", "second\n", "tenth\n"]);
    }

    #[test]
    fn xlsx_resolves_shared_strings_and_numbers() {
        let shared = r#"<sst><si><t>Name</t></si><si><r><t>Ada </t></r><r><t>Lovelace</t></r></si></sst>"#;
        let sheet = r#"<worksheet><sheetData><row r="1"><c r="A1" t="s"><v>0</v></c><c r="B1"><v>1815</v></c></row><row r="2"><c r="A2" t="s"><v>1</v></c></row></sheetData></worksheet>"#;
        let bytes = zip_with(&[
            ("xl/sharedStrings.xml", shared),
            ("xl/worksheets/sheet1.xml", sheet),
        ]);
        let segments = Loader::Spreadsheet.extract(&bytes).unwrap();
        assert_eq!(segments, vec!["Name 1815\nAda Lovelace".to_string()]);
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "hello from disk").unwrap();
        let loader = Loader::for_path(&path).unwrap();
        assert_eq!(loader.load(&path).unwrap(), vec!["hello from disk"]);
    }
}
