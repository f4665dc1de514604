//! Archival Format Conversion
//!
//! Lossy inputs are transduced to lossless archival targets before
//! encryption: JPEG/HEIC/WebP → PNG, MP3/AAC/OGG → FLAC, MP4/MOV/WebM →
//! FFV1 in Matroska, office documents → PDF plus a plain-text extract,
//! HTML → plain text. Already-archival and unknown MIMEs pass through
//! unchanged, as do CSV/JSON/plain text (bytes untouched, no line-ending
//! normalization). External tools are black-box transducers behind a strict
//! timeout; a non-zero exit or timeout surfaces as `ConversionFailed`.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::ConversionConfig;
use crate::error::{CoreError, Result};

// ============================================================================
// PLAN
// ============================================================================

/// Which external tool class a conversion routes through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolClass {
    Image,
    Audio,
    Video,
    Document,
}

/// How a MIME reaches its archival rendition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionAction {
    /// Bytes are already archival (or unknown): stored as-is
    Passthrough,
    /// External transducer produces the archival rendition
    Subprocess(ToolClass),
    /// HTML is reduced to plain text in-process
    HtmlExtract,
}

/// The archival plan for one declared MIME
#[derive(Debug, Clone)]
pub struct ConversionPlan {
    pub preservation_format: &'static str,
    pub target_mime: &'static str,
    pub action: ConversionAction,
}

/// Deterministic MIME → archival mapping
pub fn plan(mime: &str) -> ConversionPlan {
    use ConversionAction::*;
    let mime = mime.split(';').next().unwrap_or(mime).trim().to_ascii_lowercase();
    let (preservation_format, target_mime, action) = match mime.as_str() {
        // Lossy images → PNG
        "image/jpeg" | "image/heic" | "image/heif" | "image/webp" => {
            ("png", "image/png", Subprocess(ToolClass::Image))
        }
        // Lossy audio → FLAC
        "audio/mpeg" | "audio/mp3" | "audio/aac" | "audio/ogg" | "audio/mp4" => {
            ("flac", "audio/flac", Subprocess(ToolClass::Audio))
        }
        // Consumer video → FFV1/Matroska
        "video/mp4" | "video/quicktime" | "video/webm" => {
            ("mkv", "video/x-matroska", Subprocess(ToolClass::Video))
        }
        // Office documents → PDF (+ text extract downstream)
        "application/msword"
        | "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        | "application/vnd.oasis.opendocument.text"
        | "application/rtf" => ("pdf", "application/pdf", Subprocess(ToolClass::Document)),
        // Web pages reduce to plain text
        "text/html" => ("txt", "text/plain", HtmlExtract),
        // Already archival
        "image/png" => ("png", "image/png", Passthrough),
        "audio/flac" => ("flac", "audio/flac", Passthrough),
        "video/x-matroska" => ("mkv", "video/x-matroska", Passthrough),
        "application/pdf" => ("pdf", "application/pdf", Passthrough),
        // Structured text passes through byte-identical
        "text/csv" => ("csv", "text/csv", Passthrough),
        "application/json" => ("json", "application/json", Passthrough),
        "text/markdown" => ("md", "text/markdown", Passthrough),
        "text/plain" => ("txt", "text/plain", Passthrough),
        // Unknown types pass through as-is
        _ => ("original", "application/octet-stream", Passthrough),
    };
    ConversionPlan {
        preservation_format,
        target_mime,
        action,
    }
}

/// File extension hint handed to external tools for a MIME
fn input_extension(mime: &str) -> &'static str {
    match mime {
        "image/jpeg" => "jpg",
        "image/heic" | "image/heif" => "heic",
        "image/webp" => "webp",
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/aac" => "aac",
        "audio/ogg" => "ogg",
        "audio/mp4" => "m4a",
        "video/mp4" => "mp4",
        "video/quicktime" => "mov",
        "video/webm" => "webm",
        "application/msword" => "doc",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => "docx",
        "application/vnd.oasis.opendocument.text" => "odt",
        "application/rtf" => "rtf",
        _ => "bin",
    }
}

// ============================================================================
// TRANSDUCER
// ============================================================================

/// Black-box bytes-in/bytes-out conversion step. The production
/// implementation shells out; tests inject a deterministic fake.
#[async_trait]
pub trait Transducer: Send + Sync {
    async fn transduce(
        &self,
        class: ToolClass,
        input: &[u8],
        input_ext: &str,
        output_ext: &str,
    ) -> Result<Vec<u8>>;

    /// Plain-text extraction from an archival document rendition
    async fn extract_text(&self, archival: &[u8]) -> Result<Option<String>>;
}

/// Runs the configured external tool commands with a strict timeout
pub struct SubprocessTransducer {
    config: ConversionConfig,
}

impl SubprocessTransducer {
    pub fn new(config: ConversionConfig) -> Self {
        Self { config }
    }

    fn command_template(&self, class: ToolClass) -> &str {
        match class {
            ToolClass::Image => &self.config.image_tool,
            ToolClass::Audio => &self.config.audio_tool,
            ToolClass::Video => &self.config.video_tool,
            ToolClass::Document => &self.config.document_tool,
        }
    }

    async fn run_tool(
        &self,
        template: &str,
        input: &[u8],
        input_ext: &str,
        output_ext: &str,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let workdir = tempfile::tempdir()?;
        let input_path = workdir.path().join(format!("input.{input_ext}"));
        let output_path = workdir.path().join(format!("output.{output_ext}"));
        tokio::fs::write(&input_path, input).await?;

        let rendered = template
            .replace("{input}", &input_path.to_string_lossy())
            .replace("{output}", &output_path.to_string_lossy());
        let mut parts = rendered.split_whitespace();
        let program = parts.next().ok_or_else(|| {
            CoreError::ConversionFailed("empty tool command".to_string())
        })?;

        let mut command = Command::new(program);
        command.args(parts).kill_on_drop(true);

        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| CoreError::ConversionFailed(format!("{program} timed out")))?
            .map_err(|e| CoreError::ConversionFailed(format!("{program}: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!(tool = program, "transducer failed: {}", stderr.trim());
            return Err(CoreError::ConversionFailed(format!(
                "{program} exited {}",
                output.status
            )));
        }

        tokio::fs::read(&output_path).await.map_err(|_| {
            CoreError::ConversionFailed(format!("{program} produced no output"))
        })
    }
}

#[async_trait]
impl Transducer for SubprocessTransducer {
    async fn transduce(
        &self,
        class: ToolClass,
        input: &[u8],
        input_ext: &str,
        output_ext: &str,
    ) -> Result<Vec<u8>> {
        let template = self.command_template(class).to_string();
        self.run_tool(&template, input, input_ext, output_ext, self.config.timeout)
            .await
    }

    async fn extract_text(&self, archival: &[u8]) -> Result<Option<String>> {
        let template = self.config.extract_tool.clone();
        match self
            .run_tool(&template, archival, "pdf", "txt", self.config.timeout)
            .await
        {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            // Extraction is best-effort enrichment; conversion itself stands
            Err(CoreError::ConversionFailed(e)) => {
                tracing::warn!("text extract skipped: {e}");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

// ============================================================================
// CONVERTER
// ============================================================================

/// Result of driving one input through its archival plan
#[derive(Debug, Clone)]
pub struct Converted {
    pub archival: Vec<u8>,
    pub preservation_format: String,
    pub target_mime: String,
    /// False when the archival rendition is byte-identical to the input
    pub changed: bool,
    /// Searchable plaintext pulled out of documents and web pages
    pub text_extract: Option<String>,
}

/// Archival conversion dispatch
pub struct Converter {
    transducer: std::sync::Arc<dyn Transducer>,
}

impl Converter {
    pub fn new(transducer: std::sync::Arc<dyn Transducer>) -> Self {
        Self { transducer }
    }

    /// Convert `input` per its MIME plan. Idempotent: feeding an archival
    /// rendition back through produces a passthrough.
    pub async fn convert(&self, input: &[u8], mime: &str) -> Result<Converted> {
        let plan = plan(mime);
        match plan.action {
            ConversionAction::Passthrough => Ok(Converted {
                archival: input.to_vec(),
                preservation_format: plan.preservation_format.to_string(),
                target_mime: plan.target_mime.to_string(),
                changed: false,
                text_extract: None,
            }),
            ConversionAction::HtmlExtract => {
                let text = html_to_text(input);
                Ok(Converted {
                    archival: text.clone().into_bytes(),
                    preservation_format: plan.preservation_format.to_string(),
                    target_mime: plan.target_mime.to_string(),
                    changed: true,
                    text_extract: Some(text),
                })
            }
            ConversionAction::Subprocess(class) => {
                let archival = self
                    .transducer
                    .transduce(
                        class,
                        input,
                        input_extension(&mime.to_ascii_lowercase()),
                        plan.preservation_format,
                    )
                    .await?;
                let text_extract = if class == ToolClass::Document {
                    self.transducer.extract_text(&archival).await?
                } else {
                    None
                };
                Ok(Converted {
                    archival,
                    preservation_format: plan.preservation_format.to_string(),
                    target_mime: plan.target_mime.to_string(),
                    changed: true,
                    text_extract,
                })
            }
        }
    }
}

/// Reduce an HTML document to its visible text
pub fn html_to_text(input: &[u8]) -> String {
    let html = String::from_utf8_lossy(input);
    let document = scraper::Html::parse_document(&html);
    let selector = scraper::Selector::parse("body").expect("static selector");
    let text: Vec<String> = match document.select(&selector).next() {
        Some(body) => body
            .text()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_string())
            .collect(),
        None => document
            .root_element()
            .text()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_string())
            .collect(),
    };
    text.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeTransducer;

    #[async_trait]
    impl Transducer for FakeTransducer {
        async fn transduce(
            &self,
            _class: ToolClass,
            input: &[u8],
            _input_ext: &str,
            output_ext: &str,
        ) -> Result<Vec<u8>> {
            let mut out = format!("{output_ext}:").into_bytes();
            out.extend_from_slice(input);
            Ok(out)
        }

        async fn extract_text(&self, _archival: &[u8]) -> Result<Option<String>> {
            Ok(Some("extracted".to_string()))
        }
    }

    #[test]
    fn plan_maps_lossy_to_lossless() {
        assert_eq!(plan("image/jpeg").preservation_format, "png");
        assert_eq!(plan("audio/mpeg").preservation_format, "flac");
        assert_eq!(plan("video/mp4").preservation_format, "mkv");
        assert_eq!(
            plan("application/vnd.openxmlformats-officedocument.wordprocessingml.document")
                .preservation_format,
            "pdf"
        );
    }

    #[test]
    fn archival_and_unknown_pass_through() {
        assert_eq!(plan("image/png").action, ConversionAction::Passthrough);
        assert_eq!(plan("text/csv").action, ConversionAction::Passthrough);
        assert_eq!(
            plan("application/x-mystery").action,
            ConversionAction::Passthrough
        );
        assert_eq!(plan("application/x-mystery").preservation_format, "original");
    }

    #[test]
    fn plan_ignores_mime_parameters() {
        assert_eq!(plan("Image/JPEG; charset=binary").preservation_format, "png");
    }

    #[tokio::test]
    async fn passthrough_keeps_bytes_identical() {
        let converter = Converter::new(std::sync::Arc::new(FakeTransducer));
        let csv = b"a,b\r\n1,2\r\n";
        let out = converter.convert(csv, "text/csv").await.unwrap();
        // No line-ending normalization on structured text
        assert_eq!(out.archival, csv);
        assert!(!out.changed);
    }

    #[tokio::test]
    async fn subprocess_route_marks_changed() {
        let converter = Converter::new(std::sync::Arc::new(FakeTransducer));
        let out = converter.convert(b"jpegdata", "image/jpeg").await.unwrap();
        assert_eq!(out.archival, b"png:jpegdata");
        assert!(out.changed);
        assert!(out.text_extract.is_none());
    }

    #[tokio::test]
    async fn document_route_extracts_text() {
        let converter = Converter::new(std::sync::Arc::new(FakeTransducer));
        let out = converter
            .convert(b"docxdata", "application/msword")
            .await
            .unwrap();
        assert_eq!(out.preservation_format, "pdf");
        assert_eq!(out.text_extract.as_deref(), Some("extracted"));
    }

    #[tokio::test]
    async fn html_reduces_to_text() {
        let converter = Converter::new(std::sync::Arc::new(FakeTransducer));
        let html = b"<html><head><title>t</title></head>\
            <body><h1>Lyon</h1><p>has great <b>food</b></p></body></html>";
        let out = converter.convert(html, "text/html").await.unwrap();
        let text = String::from_utf8(out.archival).unwrap();
        assert!(text.contains("Lyon"));
        assert!(text.contains("food"));
        assert!(!text.contains("<p>"));
        assert!(out.changed);
    }
}
