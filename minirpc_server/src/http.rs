use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use minirpc_protocol::{CONNECTED, DEFAULT_DEBUG_PATH, DEFAULT_RPC_PATH};

use crate::Server;

impl Server {
    /// serves rpc over an HTTP listener: CONNECT on the rpc path hijacks
    /// the stream and hands it to the dispatcher, GET on the debug path
    /// renders call counts, anything else is a 405.
    pub fn serve_http(self: &Arc<Self>, listener: TcpListener) {
        for stream in listener.incoming() {
            match stream {
                Ok(conn) => {
                    let server = self.clone();
                    thread::spawn(move || server.handle_http(conn));
                }
                Err(err) => {
                    log::error!("rpc server: accept error: {}", err);
                    return;
                }
            }
        }
    }

    fn handle_http(self: Arc<Self>, mut conn: TcpStream) {
        let head = match read_request_head(&mut conn) {
            Ok(head) => head,
            Err(err) => {
                log::error!("rpc server: http read error: {}", err);
                return;
            }
        };
        let mut parts = head.lines().next().unwrap_or("").split_whitespace();
        let method = parts.next().unwrap_or("");
        let path = parts.next().unwrap_or("");

        match (method, path) {
            ("CONNECT", DEFAULT_RPC_PATH) => {
                if conn
                    .write_all(format!("HTTP/1.0 {}\r\n\r\n", CONNECTED).as_bytes())
                    .is_ok()
                {
                    self.serve_conn(conn);
                }
            }
            ("GET", DEFAULT_DEBUG_PATH) => {
                let mut body = String::from("minirpc services\n");
                for (service_method, calls) in self.call_counts() {
                    body.push_str(&format!("{}: {} calls\n", service_method, calls));
                }
                let _ = write_text_response(&mut conn, "200 OK", &body);
            }
            _ => {
                let _ = write_text_response(&mut conn, "405 Method Not Allowed", "405 must CONNECT\n");
            }
        }
    }
}

/// reads one request head (request line plus headers) without consuming
/// anything past the blank line; the CONNECT peer sends nothing further
/// until it has seen our status line.
fn read_request_head(conn: &mut TcpStream) -> std::io::Result<String> {
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = conn.read(&mut byte)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed in request head",
            ));
        }
        head.push(byte[0]);
        if head.len() > 8192 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request head too long",
            ));
        }
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

fn write_text_response(conn: &mut TcpStream, status: &str, body: &str) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.0 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    conn.write_all(response.as_bytes())
}
