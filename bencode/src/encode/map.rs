use serde::ser;
use crate::Error;
use super::encoder::Encoder;

// A dictionary is encoded as d<contents>e. The elements of the dictionary are encoded with each key immediately
// followed by its value. All keys must be byte strings and must appear in lexicographical order. A dictionary that associates
// the values 42 and "spam" with the keys "foo" and "bar", respectively (in other words, {"bar": "spam", "foo": 42}),
// would be encoded as follows: d3:bar4:spam3:fooi42ee.
pub struct SerializeMap<'a> {
    serializer:     &'a mut Encoder,
    // Raw (unframed) key bytes paired with the already-encoded value, kept
    // this way so sorting compares actual key content rather than the
    // length-prefixed wire form (which would sort "10:foo" before "9:bar").
    items:          Vec<(Vec<u8>, Vec<u8>)>,
    current_key:    Option<Vec<u8>>,
}

impl<'a> SerializeMap<'a> {

    pub fn new(serializer: &'a mut Encoder, size: usize) -> Self {
        Self {
            serializer,
            items: Vec::with_capacity(size),
            current_key: None,
        }
    }

    fn finish(&mut self) -> Result<(), Error> {
        if self.current_key.is_some() {
            return Err(Error::MapSerializationOrder(
                "attempted to end map serialization while holding key".to_string())
            )
        }
        let mut items = std::mem::take(&mut self.items);
        items.sort_by(|(k1, _), (k2, _)| k1.cmp(k2));

        self.serializer.push("d");
        for (k, v) in items {
            ser::Serializer::serialize_bytes(&mut *self.serializer, &k)?;
            self.serializer.push(v);
        }
        self.serializer.push("e");
        Ok(())
    }
}

impl<'a> ser::SerializeMap for SerializeMap<'a> {
    type Ok = ();
    type Error = Error;

    fn serialize_key<T: ?Sized>(&mut self, key: &T) -> Result<(), Self::Error>
        where T: serde::Serialize
    {
        match self.current_key {
            // We are supposed to be serializing value here.
            Some(_) => Err(Error::MapSerializationOrder(
                "consecutive calls to serialize key without serializing value".to_string()
            )),
            None => {
                self.current_key = Some(key.serialize(KeyBytes)?);
                Ok(())
            }
        }
    }

    fn serialize_value<T: ?Sized>(&mut self, value: &T) -> Result<(), Self::Error>
        where T: serde::Serialize
    {
        let key = self.current_key.take().ok_or_else(
            || {
                Error::MapSerializationOrder(
                    "consecutive calls to serialize value without serializing key".to_string()
                )
            }
        )?;

        let mut ser = Encoder::new();
        value.serialize(&mut ser)?;
        let value = ser.into_buf();

        if !value.is_empty() {
            self.items.push((key, value));
        }

        Ok(())
    }

    fn serialize_entry<K: ?Sized, V: ?Sized>(
        &mut self,
        key: &K,
        value: &V,
    ) -> Result<(), Self::Error>
        where K: serde::Serialize, V: serde::Serialize,
    {
        if self.current_key.is_some() {
            return Err(Error::MapSerializationOrder(
                "attempted to serialize entry whilst holding a key".to_string()
            ))
        }

        let key = key.serialize(KeyBytes)?;

        let mut val_ser = Encoder::new();
        value.serialize(&mut val_ser)?;
        let value = val_ser.into_buf();

        if !value.is_empty() {
            self.items.push((key, value));
        }
        Ok(())
    }

    fn end(mut self) -> Result<Self::Ok, Self::Error> { self.finish() }
}

impl<'a> ser::SerializeStruct for SerializeMap<'a> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized>(
            &mut self,
            key: &'static str,
            value: &T,
        ) -> Result<(), Self::Error>
        where T: serde::Serialize
    {
        ser::SerializeMap::serialize_entry(self, key, value)
    }

    fn end(mut self) -> Result<Self::Ok, Self::Error> {
        self.finish()
    }
}

impl<'a> ser::SerializeStructVariant for SerializeMap<'a> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized>(
            &mut self,
            key: &'static str,
            value: &T,
        ) -> Result<(), Self::Error>
        where T: serde::Serialize
    {
        ser::SerializeMap::serialize_entry(self, key, value)
    }

    fn end(mut self) -> Result<Self::Ok, Self::Error> {
        self.finish()?;
        self.serializer.push("e");
        Ok(())
    }
}

// Extracts the raw bytes of a dictionary key. Bencode keys must be byte
// strings (the encoder never sees integer/list/dict keys in practice here),
// so this only needs to handle str/bytes/char and pass through newtypes.
struct KeyBytes;

impl serde::Serializer for KeyBytes {
    type Ok = Vec<u8>;
    type Error = Error;

    type SerializeSeq = serde::ser::Impossible<Vec<u8>, Error>;
    type SerializeTuple = serde::ser::Impossible<Vec<u8>, Error>;
    type SerializeTupleStruct = serde::ser::Impossible<Vec<u8>, Error>;
    type SerializeTupleVariant = serde::ser::Impossible<Vec<u8>, Error>;
    type SerializeMap = serde::ser::Impossible<Vec<u8>, Error>;
    type SerializeStruct = serde::ser::Impossible<Vec<u8>, Error>;
    type SerializeStructVariant = serde::ser::Impossible<Vec<u8>, Error>;

    fn serialize_str(self, v: &str) -> Result<Vec<u8>, Error> { Ok(v.as_bytes().to_vec()) }
    fn serialize_bytes(self, v: &[u8]) -> Result<Vec<u8>, Error> { Ok(v.to_vec()) }
    fn serialize_char(self, v: char) -> Result<Vec<u8>, Error> {
        let mut buf = [0u8; 4];
        Ok(v.encode_utf8(&mut buf).as_bytes().to_vec())
    }

    fn serialize_newtype_struct<T: ?Sized>(self, _name: &'static str, value: &T) -> Result<Vec<u8>, Error>
        where T: serde::Serialize
    {
        value.serialize(self)
    }

    fn serialize_bool(self, _: bool) -> Result<Vec<u8>, Error> { Err(not_a_key("bool")) }
    fn serialize_i8(self, _: i8) -> Result<Vec<u8>, Error> { Err(not_a_key("i8")) }
    fn serialize_i16(self, _: i16) -> Result<Vec<u8>, Error> { Err(not_a_key("i16")) }
    fn serialize_i32(self, _: i32) -> Result<Vec<u8>, Error> { Err(not_a_key("i32")) }
    fn serialize_i64(self, _: i64) -> Result<Vec<u8>, Error> { Err(not_a_key("i64")) }
    fn serialize_u8(self, _: u8) -> Result<Vec<u8>, Error> { Err(not_a_key("u8")) }
    fn serialize_u16(self, _: u16) -> Result<Vec<u8>, Error> { Err(not_a_key("u16")) }
    fn serialize_u32(self, _: u32) -> Result<Vec<u8>, Error> { Err(not_a_key("u32")) }
    fn serialize_u64(self, _: u64) -> Result<Vec<u8>, Error> { Err(not_a_key("u64")) }
    fn serialize_f32(self, _: f32) -> Result<Vec<u8>, Error> { Err(not_a_key("f32")) }
    fn serialize_f64(self, _: f64) -> Result<Vec<u8>, Error> { Err(not_a_key("f64")) }
    fn serialize_none(self) -> Result<Vec<u8>, Error> { Err(not_a_key("none")) }
    fn serialize_some<T: ?Sized>(self, value: &T) -> Result<Vec<u8>, Error> where T: serde::Serialize {
        value.serialize(self)
    }
    fn serialize_unit(self) -> Result<Vec<u8>, Error> { Err(not_a_key("unit")) }
    fn serialize_unit_struct(self, _: &'static str) -> Result<Vec<u8>, Error> { Err(not_a_key("unit struct")) }
    fn serialize_unit_variant(self, _: &'static str, _: u32, variant: &'static str) -> Result<Vec<u8>, Error> {
        Ok(variant.as_bytes().to_vec())
    }
    fn serialize_newtype_variant<T: ?Sized>(
        self, _: &'static str, _: u32, _: &'static str, _: &T,
    ) -> Result<Vec<u8>, Error> where T: serde::Serialize {
        Err(not_a_key("newtype variant"))
    }
    fn serialize_seq(self, _: Option<usize>) -> Result<Self::SerializeSeq, Error> { Err(not_a_key("seq")) }
    fn serialize_tuple(self, _: usize) -> Result<Self::SerializeTuple, Error> { Err(not_a_key("tuple")) }
    fn serialize_tuple_struct(self, _: &'static str, _: usize) -> Result<Self::SerializeTupleStruct, Error> {
        Err(not_a_key("tuple struct"))
    }
    fn serialize_tuple_variant(
        self, _: &'static str, _: u32, _: &'static str, _: usize,
    ) -> Result<Self::SerializeTupleVariant, Error> {
        Err(not_a_key("tuple variant"))
    }
    fn serialize_map(self, _: Option<usize>) -> Result<Self::SerializeMap, Error> { Err(not_a_key("map")) }
    fn serialize_struct(self, _: &'static str, _: usize) -> Result<Self::SerializeStruct, Error> {
        Err(not_a_key("struct"))
    }
    fn serialize_struct_variant(
        self, _: &'static str, _: u32, _: &'static str, _: usize,
    ) -> Result<Self::SerializeStructVariant, Error> {
        Err(not_a_key("struct variant"))
    }
}

fn not_a_key(kind: &str) -> Error {
    Error::InvalidType(format!("bencode dictionary keys must be byte strings, found {}", kind))
}
