//! Text encodings understood by the remote services and line tools.
//!
//! Only encodings that can be converted without tables are supported: UTF-8
//! and ISO-8859-1. Remote reads decode strictly so that content which would
//! not survive a round trip is refused instead of being rewritten on save.

use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextEncoding {
    Utf8,
    /// ISO-8859-1: every byte maps to the code point of the same value
    Latin1,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TextError {
    #[error("unsupported encoding {0:?}")]
    Unsupported(String),

    #[error("invalid {encoding} sequence at byte {offset}")]
    InvalidSequence {
        encoding: &'static str,
        offset: usize,
    },

    #[error("{ch:?} cannot be written as {encoding}")]
    Unrepresentable { encoding: &'static str, ch: char },
}

impl From<TextError> for io::Error {
    fn from(err: TextError) -> Self {
        let kind = match err {
            TextError::Unsupported(_) => io::ErrorKind::Unsupported,
            _ => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, err)
    }
}

impl TextEncoding {
    pub fn from_label(label: &str) -> Result<Self, TextError> {
        match label.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "utf-8" | "utf8" => Ok(TextEncoding::Utf8),
            "latin1" | "latin-1" | "iso-8859-1" | "iso8859-1" => Ok(TextEncoding::Latin1),
            _ => Err(TextError::Unsupported(label.to_string())),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TextEncoding::Utf8 => "utf-8",
            TextEncoding::Latin1 => "iso-8859-1",
        }
    }

    /// Decode the longest prefix of `bytes` made of complete characters.
    ///
    /// Returns the text and the number of bytes it covers. A character cut
    /// off at the end of `bytes` is left unconsumed; an invalid sequence
    /// anywhere else is an error.
    pub fn decode_prefix(self, bytes: &[u8]) -> Result<(String, usize), TextError> {
        match self {
            TextEncoding::Latin1 => Ok((latin1(bytes), bytes.len())),
            TextEncoding::Utf8 => match std::str::from_utf8(bytes) {
                Ok(text) => Ok((text.to_string(), bytes.len())),
                Err(e) if e.error_len().is_none() => {
                    let valid = e.valid_up_to();
                    let text = std::str::from_utf8(&bytes[..valid]).map_err(|_| {
                        TextError::InvalidSequence {
                            encoding: self.label(),
                            offset: valid,
                        }
                    })?;
                    Ok((text.to_string(), valid))
                }
                Err(e) => Err(TextError::InvalidSequence {
                    encoding: self.label(),
                    offset: e.valid_up_to(),
                }),
            },
        }
    }

    /// Decode all of `bytes`, which must end on a character boundary.
    pub fn decode_exact(self, bytes: &[u8]) -> Result<String, TextError> {
        let (text, consumed) = self.decode_prefix(bytes)?;
        if consumed != bytes.len() {
            return Err(TextError::InvalidSequence {
                encoding: self.label(),
                offset: consumed,
            });
        }
        Ok(text)
    }

    /// Decode for display, replacing what cannot be decoded.
    pub fn decode_lossy(self, bytes: &[u8]) -> String {
        match self {
            TextEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            TextEncoding::Latin1 => latin1(bytes),
        }
    }

    pub fn encode(self, text: &str) -> Result<Vec<u8>, TextError> {
        match self {
            TextEncoding::Utf8 => Ok(text.as_bytes().to_vec()),
            TextEncoding::Latin1 => text
                .chars()
                .map(|ch| {
                    u8::try_from(u32::from(ch)).map_err(|_| TextError::Unrepresentable {
                        encoding: self.label(),
                        ch,
                    })
                })
                .collect(),
        }
    }
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels() {
        assert_eq!(TextEncoding::from_label("UTF-8"), Ok(TextEncoding::Utf8));
        assert_eq!(TextEncoding::from_label("iso_8859-1"), Ok(TextEncoding::Latin1));
        assert!(matches!(
            TextEncoding::from_label("shift-jis"),
            Err(TextError::Unsupported(_))
        ));
    }

    #[test]
    fn test_cut_character_is_left_for_later() {
        let (text, consumed) = TextEncoding::Utf8.decode_prefix(b"caf\xC3").unwrap();
        assert_eq!(text, "caf");
        assert_eq!(consumed, 3);

        let (text, consumed) = TextEncoding::Utf8.decode_prefix(b"\xC3\xA9\n").unwrap();
        assert_eq!(text, "é\n");
        assert_eq!(consumed, 3);
    }

    #[test]
    fn test_invalid_utf8_is_refused() {
        assert_eq!(
            TextEncoding::Utf8.decode_prefix(b"caf\xE9\nport"),
            Err(TextError::InvalidSequence {
                encoding: "utf-8",
                offset: 3
            })
        );
        assert!(TextEncoding::Utf8.decode_exact(b"ab\xC3").is_err());
    }

    #[test]
    fn test_latin1_keeps_every_byte() {
        let text = TextEncoding::Latin1.decode_exact(b"caf\xE9").unwrap();
        assert_eq!(text, "café");
        assert_eq!(TextEncoding::Latin1.encode(&text).unwrap(), b"caf\xE9");
        assert!(TextEncoding::Latin1.encode("€").is_err());
    }

    #[test]
    fn test_io_error_kinds() {
        let unsupported: io::Error = TextError::Unsupported("x".into()).into();
        assert_eq!(unsupported.kind(), io::ErrorKind::Unsupported);
        let invalid: io::Error = TextError::InvalidSequence {
            encoding: "utf-8",
            offset: 0,
        }
        .into();
        assert_eq!(invalid.kind(), io::ErrorKind::InvalidData);
    }
}
