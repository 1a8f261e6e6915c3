//! Encoding-tolerant decoding of svn process output.
//!
//! Commit messages and file contents in long-lived repositories are not always UTF-8;
//! authors on different locales commit in their regional code pages. Decoding never
//! fails: codecs are tried strictly in order and the last resort is a lossless
//! byte-to-character mapping.

use encoding_rs::{BIG5, EUC_KR, Encoding, GB18030, SHIFT_JIS, UTF_8, WINDOWS_1252};

/// Strict decoders tried in order before falling back
///
/// GB18030 accepts almost every well-formed double-byte sequence, so Big5, Shift-JIS
/// and EUC-KR text is usually decoded as GB18030. The later codecs only see input
/// GB18030 rejects, such as half-width katakana left as a lone trailing byte.
/// Repositories committing mostly in one of those code pages should pass their own
/// order to [`decode_with`].
pub fn decode_order() -> [&'static Encoding; 5] {
    [UTF_8, GB18030, BIG5, SHIFT_JIS, EUC_KR]
}

/// Decode process output into a string, trying [`decode_order`] first
pub fn decode_output(bytes: &[u8]) -> String {
    decode_with(bytes, &decode_order())
}

/// Decode with an explicit codec order
///
/// Each codec is applied strictly (no replacement characters). If none accepts the
/// input, every byte is mapped to one character through windows-1252, which
/// assigns a character to every byte value.
pub fn decode_with(bytes: &[u8], order: &[&'static Encoding]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);

    for encoding in order {
        if let Some(text) = encoding.decode_without_bom_handling_and_without_replacement(bytes) {
            if *encoding != UTF_8 {
                tracing::debug!("Decoded svn output as {}", encoding.name());
            }
            return text.into_owned();
        }
    }

    tracing::debug!("No strict decoder accepted svn output, using byte-wise fallback");
    let (text, _) = WINDOWS_1252.decode_without_bom_handling(bytes);
    text.into_owned()
}
