use std::io::{BufRead, BufReader, BufWriter, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Mutex;

use bytes::Bytes;

use crate::codec::{Codec, SerializeType};
use crate::msgpack::{read_length_prefixed, write_length_prefixed};
use crate::{Error, Header, Result};

/// the textual codec: newline-delimited JSON headers, length-prefixed body
/// payloads. Useful when a wire capture has to be read by a human.
pub struct JsonCodec {
    conn: TcpStream,
    reader: Mutex<BufReader<TcpStream>>,
    writer: Mutex<BufWriter<TcpStream>>,
}

impl JsonCodec {
    pub fn new(conn: TcpStream) -> Result<Self> {
        let reader = Mutex::new(BufReader::new(conn.try_clone()?));
        let writer = Mutex::new(BufWriter::new(conn.try_clone()?));
        Ok(JsonCodec {
            conn,
            reader,
            writer,
        })
    }
}

impl Codec for JsonCodec {
    fn read_header(&self, h: &mut Header) -> Result<()> {
        let mut r = self.reader.lock().expect("codec reader poisoned");
        let mut line = String::new();
        let n = r.read_line(&mut line)?;
        if n == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed",
            )));
        }
        *h = serde_json::from_str(line.trim_end())?;
        Ok(())
    }

    fn read_body(&self) -> Result<Bytes> {
        let mut r = self.reader.lock().expect("codec reader poisoned");
        read_length_prefixed(&mut *r)
    }

    fn write(&self, h: &Header, body: &[u8]) -> Result<()> {
        let mut w = self.writer.lock().expect("codec writer poisoned");
        let result = (|| -> Result<()> {
            let mut line = serde_json::to_vec(h)?;
            line.push(b'\n');
            w.write_all(&line)?;
            write_length_prefixed(&mut *w, body)?;
            w.flush()?;
            Ok(())
        })();
        if let Err(err) = result {
            log::error!("rpc codec: json write error: {}", err);
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
        SerializeType::Json
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn header_and_body_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let a = TcpStream::connect(addr).unwrap();
        let (b, _) = listener.accept().unwrap();

        let tx = JsonCodec::new(a).unwrap();
        let rx = JsonCodec::new(b).unwrap();

        let sent = Header {
            service_method: "Echo.Say".to_owned(),
            seq: 3,
            error: "boom".to_owned(),
        };
        tx.write(&sent, br#"{"Msg":"hi"}"#).unwrap();

        let mut got = Header::default();
        rx.read_header(&mut got).unwrap();
        assert_eq!(got, sent);
        assert_eq!(&rx.read_body().unwrap()[..], br#"{"Msg":"hi"}"#);
    }
}
