//! Byte-span lookup over raw bencode data, used where we must hash the
//! exact original bytes of a value rather than a re-encoded form (e.g. the
//! BitTorrent info-hash, which is SHA-1 of the raw bencoded `info` value as
//! it appeared in the source .torrent file, not a round-tripped copy).
//!
//! This is a positional scanner, not a serde Deserializer: it only needs to
//! walk past values it doesn't care about to find the byte range of one it
//! does.

use crate::error::{Error, Result};

/// Finds the byte range of the value associated with `key` in the
/// top-level bencoded dictionary held in `data`. Returns `None` if `data`
/// isn't a dictionary at the top level or the key is absent.
pub fn top_level_value_span(data: &[u8], key: &[u8]) -> Option<std::ops::Range<usize>> {
    if data.first() != Some(&b'd') {
        return None;
    }
    let mut pos = 1usize;
    loop {
        match data.get(pos) {
            Some(b'e') | None => return None,
            _ => {}
        }
        let (k_start, k_end) = read_byte_string_span(data, pos).ok()?;
        pos = k_end;
        let val_start = pos;
        let val_end = skip_value(data, pos).ok()?;
        if &data[k_start..k_end] == key {
            return Some(val_start..val_end);
        }
        pos = val_end;
    }
}

// Parses a `<len>:<bytes>` token starting at `pos`, returning the byte
// range of the `<bytes>` portion (not including the length prefix).
fn read_byte_string_span(data: &[u8], pos: usize) -> Result<(usize, usize)> {
    let colon = find(data, pos, b':')?;
    let len: usize = std::str::from_utf8(&data[pos..colon])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Custom("invalid byte string length".to_string()))?;
    let start = colon + 1;
    let end = start.checked_add(len).ok_or(Error::EOF)?;
    if end > data.len() {
        return Err(Error::EOF);
    }
    Ok((start, end))
}

fn find(data: &[u8], from: usize, needle: u8) -> Result<usize> {
    data[from..]
        .iter()
        .position(|&b| b == needle)
        .map(|i| from + i)
        .ok_or(Error::EOF)
}

// Skips over one complete bencoded value starting at `pos`, returning the
// position just past it.
fn skip_value(data: &[u8], pos: usize) -> Result<usize> {
    match data.get(pos) {
        Some(b'i') => {
            let e = find(data, pos, b'e')?;
            Ok(e + 1)
        }
        Some(b'l') => {
            let mut p = pos + 1;
            while data.get(p) != Some(&b'e') {
                if data.get(p).is_none() {
                    return Err(Error::EOF);
                }
                p = skip_value(data, p)?;
            }
            Ok(p + 1)
        }
        Some(b'd') => {
            let mut p = pos + 1;
            while data.get(p) != Some(&b'e') {
                if data.get(p).is_none() {
                    return Err(Error::EOF);
                }
                let (_, k_end) = read_byte_string_span(data, p)?;
                p = skip_value(data, k_end)?;
            }
            Ok(p + 1)
        }
        Some(b'0'..=b'9') => {
            let (_, end) = read_byte_string_span(data, pos)?;
            Ok(end)
        }
        _ => Err(Error::InvalidToken {
            expected: "a valid bencode token".to_string(),
            found: format!("{:?}", data.get(pos)),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_nested_dict_value() {
        let data = b"d4:infod6:lengthi100e4:name4:teste8:announce3:abce";
        let span = top_level_value_span(data, b"info").unwrap();
        assert_eq!(&data[span], &b"d6:lengthi100e4:name4:teste"[..]);
    }

    #[test]
    fn missing_key_returns_none() {
        let data = b"d8:announce3:abce";
        assert!(top_level_value_span(data, b"info").is_none());
    }

    #[test]
    fn span_is_exact_raw_slice_not_reencoded() {
        // A value with keys out of lexicographic order in the source bytes
        // must still come back byte-for-byte identical to the original,
        // not a re-sorted re-encoding of it.
        let data = b"d4:infod4:name4:test6:lengthi100ee8:announce3:abce";
        let span = top_level_value_span(data, b"info").unwrap();
        assert_eq!(&data[span], &b"d4:name4:test6:lengthi100ee"[..]);
    }
}
