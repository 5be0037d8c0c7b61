use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::RwLock;

use bytes::Bytes;
use once_cell::sync::Lazy;
use strum::{Display, EnumString};

use crate::json::JsonCodec;
use crate::msgpack::MsgpackCodec;
use crate::{Error, Header, Result};

/// body serialization format carried by a codec.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, EnumString)]
pub enum SerializeType {
    #[strum(serialize = "application/json")]
    Json,
    #[strum(serialize = "application/msgpack")]
    MsgPack,
}

pub const MSGPACK_CODEC: &str = "application/msgpack";
pub const JSON_CODEC: &str = "application/json";

/// frames one stream of (header, body) pairs. Reads and writes hold
/// independent internal locks, so a connection can be read and written
/// concurrently through a shared reference.
pub trait Codec: Send + Sync {
    fn read_header(&self, h: &mut Header) -> Result<()>;
    /// must be called exactly once after each successful `read_header`,
    /// even if the payload is then discarded.
    fn read_body(&self) -> Result<Bytes>;
    /// writes header and body as one flushed unit; any failure closes the
    /// underlying stream before returning.
    fn write(&self, h: &Header, body: &[u8]) -> Result<()>;
    fn close(&self) -> Result<()>;
    fn serialize_type(&self) -> SerializeType;
}

pub type NewCodecFn = fn(TcpStream) -> Result<Box<dyn Codec>>;

static CODECS: Lazy<RwLock<HashMap<String, NewCodecFn>>> = Lazy::new(|| {
    let mut m: HashMap<String, NewCodecFn> = HashMap::new();
    m.insert(MSGPACK_CODEC.to_owned(), new_msgpack_codec as NewCodecFn);
    m.insert(JSON_CODEC.to_owned(), new_json_codec as NewCodecFn);
    RwLock::new(m)
});

fn new_msgpack_codec(conn: TcpStream) -> Result<Box<dyn Codec>> {
    Ok(Box::new(MsgpackCodec::new(conn)?))
}

fn new_json_codec(conn: TcpStream) -> Result<Box<dyn Codec>> {
    Ok(Box::new(JsonCodec::new(conn)?))
}

/// registers a codec constructor under a short string key, replacing any
/// previous registration for that key.
pub fn register_codec(codec_type: &str, f: NewCodecFn) {
    CODECS
        .write()
        .expect("codec registry poisoned")
        .insert(codec_type.to_owned(), f);
}

pub fn lookup_codec(codec_type: &str) -> Result<NewCodecFn> {
    CODECS
        .read()
        .expect("codec registry poisoned")
        .get(codec_type)
        .copied()
        .ok_or_else(|| Error::InvalidCodec(codec_type.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_codecs_are_registered() {
        assert!(lookup_codec(MSGPACK_CODEC).is_ok());
        assert!(lookup_codec(JSON_CODEC).is_ok());
        assert!(matches!(
            lookup_codec("application/carrier-pigeon"),
            Err(Error::InvalidCodec(_))
        ));
    }

    #[test]
    fn serialize_type_keys_match_codec_keys() {
        use std::str::FromStr;
        assert_eq!(
            SerializeType::from_str(MSGPACK_CODEC).unwrap(),
            SerializeType::MsgPack
        );
        assert_eq!(SerializeType::Json.to_string(), JSON_CODEC);
    }
}
