#![allow(unused)]

// Convention from https://serde.rs/conventions.html
mod encode;
mod decode;
mod error;
mod span;

pub use decode::{decode_bytes, decode_str};
pub use encode::{encode_to_raw, encode_to_str};
pub use error::{Error, Result};
pub use span::top_level_value_span;
