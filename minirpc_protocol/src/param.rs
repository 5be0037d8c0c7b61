use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::SerializeType;
use crate::Result;

/// a value that can travel as an rpc body. Blanket-implemented for every
/// serde type, dispatching on the connection's serialize type.
pub trait Param: Debug {
    fn to_bytes(&self, st: SerializeType) -> Result<Vec<u8>>;
    fn from_slice(&mut self, st: SerializeType, data: &[u8]) -> Result<()>;
}

impl<T> Param for T
where
    T: Serialize + DeserializeOwned + Debug,
{
    fn to_bytes(&self, st: SerializeType) -> Result<Vec<u8>> {
        match st {
            SerializeType::Json => Ok(serde_json::to_vec(self)?),
            SerializeType::MsgPack => Ok(rmp_serde::to_vec(self)?),
        }
    }

    fn from_slice(&mut self, st: SerializeType, data: &[u8]) -> Result<()> {
        match st {
            SerializeType::Json => {
                *self = serde_json::from_slice(data)?;
            }
            SerializeType::MsgPack => {
                *self = rmp_serde::from_slice(data)?;
            }
        }
        Ok(())
    }
}

/// the placeholder body sent alongside a non-empty header error.
pub fn empty_body(st: SerializeType) -> Vec<u8> {
    ().to_bytes(st).unwrap_or_default()
}
