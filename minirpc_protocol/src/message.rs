use std::io::{Read, Write};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::MSGPACK_CODEC;
use crate::{Error, Result};

pub const MAGIC_NUMBER: u32 = 0x3bef5c;

/// connection handshake record. Always one line of JSON regardless of the
/// codec it selects, so the first bytes of a connection stay readable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct Opt {
    pub magic_number: u32,
    pub codec_type: String,
    /// client side: bounds dial plus handshake.
    pub connect_timeout: Duration,
    /// server side: bounds one invocation plus its response send. Zero
    /// means unbounded.
    pub handle_timeout: Duration,
}

impl Default for Opt {
    fn default() -> Self {
        Opt {
            magic_number: MAGIC_NUMBER,
            codec_type: MSGPACK_CODEC.to_owned(),
            connect_timeout: Duration::from_secs(10),
            handle_timeout: Duration::ZERO,
        }
    }
}

impl Opt {
    pub fn with_codec(codec_type: &str) -> Self {
        Opt {
            codec_type: codec_type.to_owned(),
            ..Default::default()
        }
    }
}

/// per-message routing record, encoded by the selected codec.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
pub struct Header {
    pub service_method: String,
    pub seq: u64,
    /// empty on success; the server's failure text otherwise.
    pub error: String,
}

pub fn write_opt<W: Write>(w: &mut W, opt: &Opt) -> Result<()> {
    let mut line = serde_json::to_vec(opt)?;
    line.push(b'\n');
    w.write_all(&line)?;
    w.flush()?;
    Ok(())
}

/// Reads the handshake line one byte at a time. The codec that follows owns
/// its own buffered reader, so nothing past the newline may be consumed
/// here.
pub fn read_opt<R: Read>(r: &mut R) -> Result<Opt> {
    let mut line = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    loop {
        let n = r.read(&mut byte)?;
        if n == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed during option exchange",
            )));
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > 4096 {
            return Err(Error::Codec("option line too long".to_owned()));
        }
    }
    Ok(serde_json::from_slice(&line)?)
}

// HTTP CONNECT bridge contract, shared by server and client.
pub const CONNECTED: &str = "200 Connected to minirpc";
pub const DEFAULT_RPC_PATH: &str = "/_minirpc_";
pub const DEFAULT_DEBUG_PATH: &str = "/debug/minirpc";
