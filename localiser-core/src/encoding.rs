use encoding_rs::{Encoding, BIG5, SHIFT_JIS};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Character encodings the scene scripts are known to ship in.
///
/// The Japanese release stores text as Shift-JIS; the traditional Chinese
/// release (and the English patch built on top of it) uses Big5.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextEncoding {
    #[default]
    Big5,
    #[serde(alias = "shift_jis", alias = "shift-jis")]
    Sjis,
}

impl TextEncoding {
    fn codec(self) -> &'static Encoding {
        match self {
            TextEncoding::Big5 => BIG5,
            TextEncoding::Sjis => SHIFT_JIS,
        }
    }

    pub fn flipped(self) -> TextEncoding {
        match self {
            TextEncoding::Big5 => TextEncoding::Sjis,
            TextEncoding::Sjis => TextEncoding::Big5,
        }
    }

    /// Strict decode: any malformed sequence yields `None` instead of
    /// replacement characters.
    pub fn decode(self, bytes: &[u8]) -> Option<String> {
        self.codec()
            .decode_without_bom_handling_and_without_replacement(bytes)
            .map(|s| s.into_owned())
    }

    /// Strict encode: returns the first character the encoding cannot
    /// represent as the error.
    pub fn encode(self, text: &str) -> Result<Vec<u8>, char> {
        let (bytes, _, had_errors) = self.codec().encode(text);
        if !had_errors {
            return Ok(bytes.into_owned());
        }

        let codec = self.codec();
        let mut buf = [0u8; 4];
        for ch in text.chars() {
            let (_, _, bad) = codec.encode(ch.encode_utf8(&mut buf));
            if bad {
                return Err(ch);
            }
        }
        // encode() flagged an error but no single character reproduces it;
        // report the replacement character rather than silently succeeding.
        Err(char::REPLACEMENT_CHARACTER)
    }
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TextEncoding::Big5 => write!(f, "big5"),
            TextEncoding::Sjis => write!(f, "sjis"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TextEncoding;

    #[test]
    fn sjis_bytes_are_not_big5() {
        // "あ" in Shift-JIS.
        let bytes = [0x82, 0xA0];
        assert_eq!(TextEncoding::Sjis.decode(&bytes).as_deref(), Some("あ"));
        assert!(TextEncoding::Big5.decode(&bytes).is_none());
    }

    #[test]
    fn big5_round_trips_cjk() {
        let bytes = TextEncoding::Big5.encode("中文").unwrap();
        assert_eq!(bytes, vec![0xA4, 0xA4, 0xA4, 0xE5]);
        assert_eq!(TextEncoding::Big5.decode(&bytes).as_deref(), Some("中文"));
    }

    #[test]
    fn reports_unencodable_character() {
        assert_eq!(TextEncoding::Sjis.encode("ok\u{1F600}"), Err('\u{1F600}'));
    }

    #[test]
    fn flip_is_an_involution() {
        assert_eq!(TextEncoding::Big5.flipped().flipped(), TextEncoding::Big5);
    }
}
