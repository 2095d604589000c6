use serde::de;
use crate::error::{Error, Result};

mod decoder;
mod access;
#[cfg(test)]
mod test;

use decoder::Decoder;

#[derive(PartialEq, Eq, Debug)]
pub enum DecodedType {
    Integer(i64),
    ByteString(Vec<u8>),
    List,
    Dictionary,
    EOF,
}

// Decodes exactly one top-level value from `b` and rejects trailing bytes:
// a `.torrent` file with garbage appended past its closing `e` is not a
// valid one, and a decoder that silently ignores it would hide corruption.
pub fn decode_bytes<'de, T>(b: &'de [u8]) -> Result<T>
    where T: de::Deserialize<'de>
{
    let mut decoder = Decoder::new(b);
    let value = de::Deserialize::deserialize(&mut decoder)?;
    if !decoder.scanner.is_empty() {
        return Err(Error::PartialDecode { remaining: decoder.scanner.len() });
    }
    Ok(value)
}

pub fn decode_str<'de, T>(s: &'de str) -> Result<T>
    where T: de::Deserialize<'de>
{
    decode_bytes(s.as_bytes())
}
