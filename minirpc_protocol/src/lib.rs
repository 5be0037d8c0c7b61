pub mod codec;
pub mod error;
pub mod json;
pub mod message;
pub mod msgpack;
pub mod param;

pub use codec::{
    lookup_codec, register_codec, Codec, NewCodecFn, SerializeType, JSON_CODEC, MSGPACK_CODEC,
};
pub use error::{Error, Result};
pub use json::JsonCodec;
pub use message::{
    read_opt, write_opt, Header, Opt, CONNECTED, DEFAULT_DEBUG_PATH, DEFAULT_RPC_PATH,
    MAGIC_NUMBER,
};
pub use msgpack::{MsgpackCodec, MAX_BODY_SIZE};
pub use param::{empty_body, Param};
