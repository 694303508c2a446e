use std::{
    borrow::Cow,
    io::{self, Cursor, Read},
};

use brotli::Decompressor;
use encoding_rs::{Encoding, UTF_8};
use flate2::read::{GzDecoder, ZlibDecoder};
use http::{Method, StatusCode};
use zstd::stream::read::Decoder as ZstdDecoder;

use crate::rewrite::RewriteOptions;

/// Textual documents the link rewriter understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentKind {
    Html,
    Css,
}

impl DocumentKind {
    /// Content type of the rewritten body, always re-encoded as UTF-8.
    pub fn content_type(self) -> &'static str {
        match self {
            DocumentKind::Html => "text/html; charset=utf-8",
            DocumentKind::Css => "text/css; charset=utf-8",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ContentKind {
    Passthrough,
    Rewrite(DocumentKind),
}

pub(crate) fn classify(
    content_type: Option<&str>,
    method: &Method,
    status: StatusCode,
    options: &RewriteOptions,
) -> ContentKind {
    // No body to rewrite; keep upstream's length headers intact.
    if method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return ContentKind::Passthrough;
    }
    let content_type = content_type.unwrap_or("").to_ascii_lowercase();
    if content_type.contains("text/html") {
        ContentKind::Rewrite(DocumentKind::Html)
    } else if options.rewrite_css && content_type.contains("text/css") {
        ContentKind::Rewrite(DocumentKind::Css)
    } else {
        ContentKind::Passthrough
    }
}

/// Undoes `Content-Encoding` so the rewriter sees the document bytes.
pub(crate) fn decode_body_with_encoding(bytes: &[u8], encoding: Option<&str>) -> io::Result<Vec<u8>> {
    let encoding = encoding.map(|enc| enc.trim().to_ascii_lowercase());
    match encoding.as_deref().unwrap_or("") {
        "" | "identity" => Ok(bytes.to_vec()),
        "gzip" | "x-gzip" => read_to_end(GzDecoder::new(Cursor::new(bytes))),
        "deflate" => read_to_end(ZlibDecoder::new(Cursor::new(bytes))),
        "br" => read_to_end(Decompressor::new(Cursor::new(bytes), 4096)),
        "zstd" => read_to_end(ZstdDecoder::new(Cursor::new(bytes))?),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported content-encoding: {other}"),
        )),
    }
}

fn read_to_end(mut decoder: impl Read) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Decodes document bytes using the `charset` of `content_type`, defaulting to UTF-8.
/// A byte-order mark overrides the label. Malformed sequences become U+FFFD.
pub(crate) fn decode_text<'b>(bytes: &'b [u8], content_type: Option<&str>) -> Cow<'b, str> {
    let encoding = content_type
        .and_then(charset_label)
        .and_then(|label| Encoding::for_label(label.as_bytes()))
        .unwrap_or(UTF_8);
    let (text, _, _) = encoding.decode(bytes);
    text
}

fn charset_label(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches(|c| c == '"' || c == '\''))
    })
}
