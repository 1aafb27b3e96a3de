//! Canonical content-type resolution.
//!
//! Resolution chain: built-in extension table, then `mime_guess`, then magic
//! sniffing over the byte prefix, then the client-declared type if it is not
//! generic. Unknown inputs map to `application/octet-stream`; rejection of
//! unsupported types happens downstream in the parser factory.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

pub const OCTET_STREAM: &str = "application/octet-stream";

/// Extensions the platform guess tends to get wrong or not know at all.
static EXTENSION_MIME_MAP: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        // Email
        ("eml", "message/rfc822"),
        ("msg", "application/vnd.ms-outlook"),
        // Documents
        ("pdf", "application/pdf"),
        ("doc", "application/msword"),
        (
            "docx",
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        ),
        ("ppt", "application/vnd.ms-powerpoint"),
        (
            "pptx",
            "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        ),
        ("xls", "application/vnd.ms-excel"),
        (
            "xlsx",
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        ),
        // Text
        ("txt", "text/plain"),
        ("md", "text/markdown"),
        ("markdown", "text/markdown"),
        ("rst", "text/x-rst"),
        ("csv", "text/csv"),
        ("tsv", "text/tab-separated-values"),
        // Data
        ("json", "application/json"),
        ("jsonl", "application/jsonl"),
        ("xml", "application/xml"),
        ("yaml", "application/x-yaml"),
        ("yml", "application/x-yaml"),
        // Audio
        ("mp3", "audio/mpeg"),
        ("wav", "audio/wav"),
        ("flac", "audio/flac"),
        ("m4a", "audio/mp4"),
        ("ogg", "audio/ogg"),
        // Video
        ("mp4", "video/mp4"),
        ("avi", "video/x-msvideo"),
        ("mov", "video/quicktime"),
        ("webm", "video/webm"),
        ("mkv", "video/x-matroska"),
        // Images
        ("jpg", "image/jpeg"),
        ("jpeg", "image/jpeg"),
        ("png", "image/png"),
        ("gif", "image/gif"),
        ("webp", "image/webp"),
        ("svg", "image/svg+xml"),
        ("bmp", "image/bmp"),
        ("tiff", "image/tiff"),
        ("tif", "image/tiff"),
    ])
});

fn is_generic(mime: &str) -> bool {
    mime.is_empty() || mime == OCTET_STREAM
}

/// Resolve a canonical MIME type. Never fails.
pub fn resolve_content_type(
    filename: &str,
    content_prefix: Option<&[u8]>,
    client_declared: Option<&str>,
) -> String {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase());

    // 1. Built-in extension table
    if let Some(ext) = &ext {
        if let Some(mime) = EXTENSION_MIME_MAP.get(ext.as_str()) {
            debug!("content type from extension map: {} -> {}", filename, mime);
            return (*mime).to_string();
        }
    }

    // 2. Platform guess
    if let Some(mime) = mime_guess::from_path(filename).first() {
        let mime = mime.essence_str().to_string();
        if !is_generic(&mime) {
            debug!("content type from platform guess: {} -> {}", filename, mime);
            return mime;
        }
    }

    // 3. Magic sniffing over the byte prefix
    if let Some(prefix) = content_prefix {
        if let Some(kind) = infer::get(prefix) {
            let mime = kind.mime_type();
            if !is_generic(mime) {
                debug!("content type from magic bytes: {} -> {}", filename, mime);
                return mime.to_string();
            }
        }
    }

    // 4. Client declaration, unless generic
    if let Some(declared) = client_declared {
        if !is_generic(declared) {
            debug!("content type from client: {} -> {}", filename, declared);
            return declared.to_string();
        }
    }

    debug!("could not resolve content type for {}", filename);
    OCTET_STREAM.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_table_wins() {
        assert_eq!(resolve_content_type("mail.eml", None, None), "message/rfc822");
        assert_eq!(
            resolve_content_type("deck.PPTX", None, None),
            "application/vnd.openxmlformats-officedocument.presentationml.presentation"
        );
        assert_eq!(resolve_content_type("notes.md", None, None), "text/markdown");
    }

    #[test]
    fn magic_bytes_used_when_extension_unknown() {
        // %PDF-1.4 header
        let pdf_prefix = b"%PDF-1.4\n%\xe2\xe3\xcf\xd3";
        assert_eq!(
            resolve_content_type("mystery.bin", Some(pdf_prefix), None),
            "application/pdf"
        );
    }

    #[test]
    fn client_declaration_is_last_real_resort() {
        assert_eq!(
            resolve_content_type("mystery.zzz", None, Some("text/x-custom")),
            "text/x-custom"
        );
        // Generic declaration is ignored
        assert_eq!(
            resolve_content_type("mystery.zzz", None, Some(OCTET_STREAM)),
            OCTET_STREAM
        );
    }

    #[test]
    fn unknown_maps_to_octet_stream() {
        assert_eq!(resolve_content_type("mystery.zzz", None, None), OCTET_STREAM);
    }
}
