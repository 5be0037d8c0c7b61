use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Mutex;

use byteorder::{BigEndian, ByteOrder};
use bytes::{Bytes, BytesMut};

use crate::codec::{Codec, SerializeType};
use crate::{Error, Header, Result};

/// refuse absurd body lengths instead of attempting the allocation.
pub const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// the built-in binary codec: MessagePack headers followed by
/// u32-big-endian length-prefixed body payloads.
pub struct MsgpackCodec {
    conn: TcpStream,
    reader: Mutex<BufReader<TcpStream>>,
    writer: Mutex<BufWriter<TcpStream>>,
}

impl MsgpackCodec {
    pub fn new(conn: TcpStream) -> Result<Self> {
        let reader = Mutex::new(BufReader::new(conn.try_clone()?));
        let writer = Mutex::new(BufWriter::new(conn.try_clone()?));
        Ok(MsgpackCodec {
            conn,
            reader,
            writer,
        })
    }
}

impl Codec for MsgpackCodec {
    fn read_header(&self, h: &mut Header) -> Result<()> {
        let mut r = self.reader.lock().expect("codec reader poisoned");
        *h = rmp_serde::decode::from_read(&mut *r)?;
        Ok(())
    }

    fn read_body(&self) -> Result<Bytes> {
        let mut r = self.reader.lock().expect("codec reader poisoned");
        read_length_prefixed(&mut *r)
    }

    fn write(&self, h: &Header, body: &[u8]) -> Result<()> {
        let mut w = self.writer.lock().expect("codec writer poisoned");
        let result = (|| -> Result<()> {
            rmp_serde::encode::write(&mut *w, h)?;
            write_length_prefixed(&mut *w, body)?;
            w.flush()?;
            Ok(())
        })();
        if let Err(err) = result {
            log::error!("rpc codec: msgpack write error: {}", err);
            let _ = self.close();
            return Err(err);
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.conn.shutdown(Shutdown::Both)?;
        Ok(())
    }

    fn serialize_type(&self) -> SerializeType {
        SerializeType::MsgPack
    }
}

pub(crate) fn read_length_prefixed<R: Read>(r: &mut R) -> Result<Bytes> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let len = BigEndian::read_u32(&len_buf) as usize;
    if len > MAX_BODY_SIZE {
        return Err(Error::Codec(format!(
            "body of {} bytes exceeds the {} byte limit",
            len, MAX_BODY_SIZE
        )));
    }
    let mut payload = BytesMut::zeroed(len);
    r.read_exact(&mut payload)?;
    Ok(payload.freeze())
}

pub(crate) fn write_length_prefixed<W: Write>(w: &mut W, body: &[u8]) -> Result<()> {
    if body.len() > MAX_BODY_SIZE {
        return Err(Error::Codec(format!(
            "body of {} bytes exceeds the {} byte limit",
            body.len(),
            MAX_BODY_SIZE
        )));
    }
    let mut len_buf = [0u8; 4];
    BigEndian::write_u32(&mut len_buf, body.len() as u32);
    w.write_all(&len_buf)?;
    w.write_all(body)?;
    Ok(())
}
