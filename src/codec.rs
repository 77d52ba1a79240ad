//! Base-36 label codec
//!
//! Turns arbitrary bytes into text drawn from `[0-9a-z]`, which survives
//! every resolver on the path (DNS names are case-insensitive, so base-32/64
//! variants with mixed case or symbols are out). The byte string is treated
//! as one big unsigned integer, so the expansion is the information-theoretic
//! `log(256)/log(36) ≈ 1.55` characters per byte.
//!
//! Leading zero bytes are carried as one `'0'` each ahead of the digits.

use thiserror::Error;

/// Maximum bytes per DNS label (RFC 1035)
pub const MAX_LABEL_LEN: usize = 63;

const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid base36 character: {0:?}")]
    InvalidCharacter(char),

    #[error("empty base36 string")]
    EmptyInput,
}

/// Encode bytes as base-36 text, most significant digit first.
///
/// Leading zero bytes become leading `'0'` characters so the value
/// round-trips exactly. The empty slice encodes to `"0"`.
pub fn encode(data: &[u8]) -> String {
    if data.is_empty() {
        return "0".to_string();
    }

    let zeros = data.iter().take_while(|&&b| b == 0).count();

    // Repeated long division of the big-endian number by 36; digits come
    // out least significant first.
    let mut num = data[zeros..].to_vec();
    let mut digits = Vec::with_capacity(num.len() * 2);
    while !num.is_empty() {
        let mut rem = 0u32;
        let mut quotient = Vec::with_capacity(num.len());
        for &byte in &num {
            let cur = (rem << 8) | byte as u32;
            let q = cur / 36;
            rem = cur % 36;
            if !(quotient.is_empty() && q == 0) {
                quotient.push(q as u8);
            }
        }
        digits.push(ALPHABET[rem as usize]);
        num = quotient;
    }

    let mut out = String::with_capacity(zeros + digits.len());
    out.extend(std::iter::repeat('0').take(zeros));
    out.extend(digits.iter().rev().map(|&d| d as char));
    out
}

/// Decode base-36 text produced by [`encode`].
pub fn decode(text: &str) -> Result<Vec<u8>, CodecError> {
    if text.is_empty() {
        return Err(CodecError::EmptyInput);
    }

    let zeros = text.bytes().take_while(|&c| c == b'0').count();

    // Little-endian base-256 accumulator
    let mut acc: Vec<u8> = Vec::with_capacity(text.len());
    for c in text[zeros..].chars() {
        let mut carry = digit_value(c)?;
        for byte in acc.iter_mut() {
            let v = *byte as u32 * 36 + carry;
            *byte = v as u8;
            carry = v >> 8;
        }
        while carry > 0 {
            acc.push(carry as u8);
            carry >>= 8;
        }
    }

    let mut out = vec![0u8; zeros];
    out.extend(acc.iter().rev());
    Ok(out)
}

fn digit_value(c: char) -> Result<u32, CodecError> {
    match c {
        '0'..='9' => Ok(c as u32 - '0' as u32),
        'a'..='z' => Ok(c as u32 - 'a' as u32 + 10),
        _ => Err(CodecError::InvalidCharacter(c)),
    }
}

/// Split text into labels of at most `max_len` characters.
///
/// A `max_len` of zero falls back to [`MAX_LABEL_LEN`]. Cuts always land on
/// character boundaries.
pub fn split_labels(text: &str, max_len: usize) -> Vec<&str> {
    let max_len = if max_len == 0 { MAX_LABEL_LEN } else { max_len };
    let mut labels = Vec::with_capacity(text.len() / max_len + 1);
    let mut start = 0;

    for (count, (idx, _)) in text.char_indices().enumerate() {
        if count > 0 && count % max_len == 0 {
            labels.push(&text[start..idx]);
            start = idx;
        }
    }
    if start < text.len() {
        labels.push(&text[start..]);
    }

    labels
}

/// Concatenate labels back into the unsplit text.
pub fn join_labels<S: AsRef<str>>(labels: &[S]) -> String {
    labels.iter().map(AsRef::as_ref).collect()
}
