use std::collections::HashMap;
use serde_derive::Deserialize;
use super::decode_str;
use crate::error::Error;

#[test]
fn decode_to_num() {
    let r: i64 = decode_str("i666e").unwrap();
    assert_eq!(r, 666);
}

#[test]
fn decode_negative_num() {
    let r: i64 = decode_str("i-42e").unwrap();
    assert_eq!(r, -42);
}

#[test]
fn decode_to_string() {
    let r: String = decode_str("3:yes").unwrap();
    assert_eq!(r, "yes");
}

#[test]
fn decode_to_struct() {
    let b = "d1:xi1111e1:y3:dog1:z2:yoe";
    #[derive(PartialEq, Debug, Deserialize)]
    struct Fake {
        y: String,
        x: i64,
        #[serde(default)]
        z: Option<String>,
        #[serde(default)]
        a: Option<String>,
    }
    let r: Fake = decode_str(b).unwrap();
    assert_eq!(
        r,
        Fake {
            x: 1111,
            y: "dog".to_string(),
            z: Some("yo".to_string()),
            a: None,
        }
    );
}

#[test]
fn deserialize_to_vec() {
    let r: Vec<i64> = decode_str("li666ee").unwrap();
    assert_eq!(r, [666]);
}

#[test]
fn deserialize_homogeneous_map() {
    let b = "d1:xi1e1:yi2ee";
    let r: HashMap<String, i64> = decode_str(b).unwrap();
    assert_eq!(r.get("x"), Some(&1));
    assert_eq!(r.get("y"), Some(&2));
}

#[test]
fn trailing_bytes_are_rejected() {
    let r: Result<i64, Error> = decode_str("i666ejunk");
    assert!(matches!(r.unwrap_err(), Error::PartialDecode { .. }));
}
