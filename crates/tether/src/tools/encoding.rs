//! Charset detection and lossy decoding for tool output.
//!
//! Subprocess and file bytes are not guaranteed UTF-8. Detection sniffs a
//! BOM first, then validates UTF-8, then falls back to Windows-1252 as the
//! most common single-byte legacy encoding. Decoding never fails; unmappable
//! bytes become replacement characters.

use encoding_rs::{Encoding, UTF_16BE, UTF_16LE, UTF_8, WINDOWS_1252};

/// Pick the encoding for a byte buffer.
pub fn detect(data: &[u8]) -> &'static Encoding {
    if let Some((encoding, _bom_len)) = Encoding::for_bom(data) {
        return encoding;
    }
    if std::str::from_utf8(data).is_ok() {
        return UTF_8;
    }
    WINDOWS_1252
}

/// Decode a byte buffer to text, never failing. Returns the text and the
/// name of the encoding used.
pub fn decode_lossy(data: &[u8]) -> (String, &'static str) {
    let encoding = detect(data);
    // decode() strips a BOM matching the encoding.
    let (text, _, _) = encoding.decode(data);
    (text.into_owned(), encoding.name())
}

/// True when the buffer contains NUL bytes, the cheap binary-content test
/// used for the one-shot binary-detected signal. UTF-16 text carries NULs
/// legitimately, so BOM-prefixed buffers are exempt.
pub fn contains_unexpected_nul(data: &[u8]) -> bool {
    if matches!(Encoding::for_bom(data), Some((e, _)) if e == UTF_16LE || e == UTF_16BE) {
        return false;
    }
    data.contains(&0)
}
