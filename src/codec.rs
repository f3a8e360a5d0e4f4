//! Request-Line Token Codec
//!
//! Fixed bidirectional mapping between the printable-ASCII alphabet (plus a
//! NUL pad sentinel) and integer token ids. Encoded lines are right-padded
//! with the sentinel to a multiple of [`BLOCK_SIZE`] so the convolution
//! stride always divides the sequence length.

use thiserror::Error;

/// Token id into the vocabulary.
pub type TokenId = usize;

/// Sequences are padded up to the next multiple of this many tokens.
pub const BLOCK_SIZE: usize = 32;

/// The full vocabulary: digits, letters, punctuation, whitespace, then the
/// pad sentinel as the final entry.
pub const ALPHABET: [char; VOCAB_SIZE] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', //
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's',
    't', 'u', 'v', 'w', 'x', 'y', 'z', //
    'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S',
    'T', 'U', 'V', 'W', 'X', 'Y', 'Z', //
    '!', '"', '#', '$', '%', '&', '\'', '(', ')', '*', '+', ',', '-', '.', '/', ':', ';', '<', '=',
    '>', '?', '@', '[', '\\', ']', '^', '_', '`', '{', '|', '}', '~', //
    ' ', '\t', '\n', '\r', '\x0b', '\x0c', //
    PAD_CHAR,
];

/// Vocabulary size: 100 printable characters plus the pad sentinel.
pub const VOCAB_SIZE: usize = 101;

/// The pad sentinel character.
pub const PAD_CHAR: char = '\0';

/// Token id of the pad sentinel (last vocabulary entry).
pub const PAD_TOKEN: TokenId = VOCAB_SIZE - 1;

/// Codec failure on a single record.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// A character outside the vocabulary; the record is rejected.
    #[error("character {ch:?} at position {position} is outside the vocabulary")]
    UnknownChar { ch: char, position: usize },
}

/// An encoded request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    /// The input line right-padded with the sentinel.
    pub padded: String,
    /// Token ids of the padded line; length is a multiple of [`BLOCK_SIZE`].
    pub tokens: Vec<TokenId>,
}

/// Look up the token id for a character.
pub fn token_of(ch: char) -> Option<TokenId> {
    ALPHABET.iter().position(|&c| c == ch)
}

/// Encode a request line, padding to the next [`BLOCK_SIZE`] multiple.
pub fn encode(line: &str) -> Result<Encoded, CodecError> {
    let chars: Vec<char> = line.chars().collect();
    let padded_len = chars.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE;

    let mut padded = String::with_capacity(padded_len);
    let mut tokens = Vec::with_capacity(padded_len);
    for (position, &ch) in chars.iter().enumerate() {
        let token = token_of(ch).ok_or(CodecError::UnknownChar { ch, position })?;
        padded.push(ch);
        tokens.push(token);
    }
    for _ in chars.len()..padded_len {
        padded.push(PAD_CHAR);
        tokens.push(PAD_TOKEN);
    }

    Ok(Encoded { padded, tokens })
}

/// Decode a token sequence back to a line, stripping trailing sentinels.
///
/// Inverse of [`encode`] for any line without embedded sentinel characters.
pub fn decode(tokens: &[TokenId]) -> String {
    let end = tokens
        .iter()
        .rposition(|&t| t != PAD_TOKEN)
        .map_or(0, |p| p + 1);
    tokens[..end].iter().map(|&t| ALPHABET[t]).collect()
}

/// Token ids whose characters are ASCII letters or digits.
///
/// These are the only tokens the adversarial generator may introduce;
/// header syntax characters (delimiters, whitespace) stay off limits.
pub fn alphanumeric_tokens() -> Vec<TokenId> {
    ALPHABET
        .iter()
        .enumerate()
        .filter(|(_, c)| c.is_ascii_alphanumeric())
        .map(|(i, _)| i)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vocabulary_is_a_bijection() {
        for (i, &ch) in ALPHABET.iter().enumerate() {
            assert_eq!(token_of(ch), Some(i), "duplicate mapping for {:?}", ch);
        }
    }

    #[test]
    fn encode_pads_to_block_multiple() {
        let enc = encode("GET / HTTP/1.1").unwrap();
        assert_eq!(enc.tokens.len(), BLOCK_SIZE);
        assert_eq!(enc.padded.len(), BLOCK_SIZE);
        assert!(enc.padded.ends_with(PAD_CHAR));

        let exact: String = "a".repeat(BLOCK_SIZE);
        assert_eq!(encode(&exact).unwrap().tokens.len(), BLOCK_SIZE);

        let over: String = "a".repeat(BLOCK_SIZE + 1);
        assert_eq!(encode(&over).unwrap().tokens.len(), 2 * BLOCK_SIZE);
    }

    #[test]
    fn round_trip_restores_the_line() {
        let lines = [
            "GET /index.html HTTP/1.1\r\nHost: example.com\r\n",
            "if-none-match: deadbeef cafebabe\n",
            "",
            "x",
        ];
        for line in lines {
            let enc = encode(line).unwrap();
            assert_eq!(decode(&enc.tokens), line);
        }
    }

    #[test]
    fn unknown_character_is_rejected() {
        let err = encode("héllo").unwrap_err();
        assert_eq!(
            err,
            CodecError::UnknownChar {
                ch: 'é',
                position: 1
            }
        );
    }

    #[test]
    fn alphanumeric_tokens_exclude_delimiters() {
        let alnum = alphanumeric_tokens();
        assert_eq!(alnum.len(), 62);
        for &t in &alnum {
            assert!(ALPHABET[t].is_ascii_alphanumeric());
        }
        assert!(!alnum.contains(&PAD_TOKEN));
        assert!(!alnum.contains(&token_of(':').unwrap()));
        assert!(!alnum.contains(&token_of(' ').unwrap()));
    }
}
