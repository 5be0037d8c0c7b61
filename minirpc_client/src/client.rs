use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use bytes::Bytes;

use minirpc_protocol::{
    lookup_codec, write_opt, Codec, Error, Header, Opt, Param, Result, SerializeType, CONNECTED,
    DEFAULT_RPC_PATH,
};

use crate::context::Context;

const DEFAULT_DONE_CAP: usize = 10;

/// one outstanding request. The session owns it until completion is
/// signalled on the done channel; the reply payload is decoded by the
/// waiter.
#[derive(Debug)]
pub struct Call {
    pub seq: u64,
    pub service_method: String,
    pub reply_data: Bytes,
    pub error: Option<Error>,
    done: SyncSender<ArcCall>,
    /// present when `go` allocated the done channel itself.
    pub done_rx: Option<Receiver<ArcCall>>,
}

pub type ArcCall = Arc<Mutex<Call>>;

impl Call {
    /// signals completion to the waiter; a full channel drops the signal,
    /// matching buffered completion semantics.
    fn complete(call: &ArcCall) {
        let done = call.lock().expect("call poisoned").done.clone();
        if done.try_send(call.clone()).is_err() {
            log::debug!("rpc client: done channel full or gone, discarding completion");
        }
    }

    fn fail(call: &ArcCall, err: Error) {
        {
            let mut c = call.lock().expect("call poisoned");
            if c.error.is_none() {
                c.error = Some(err);
            }
        }
        Call::complete(call);
    }
}

/// builds a done channel for `go`. A zero-capacity channel cannot carry a
/// completion signal, so that is a programming error and panics here.
pub fn done_channel(cap: usize) -> (SyncSender<ArcCall>, Receiver<ArcCall>) {
    assert!(cap > 0, "rpc client: done channel is unbuffered");
    mpsc::sync_channel(cap)
}

struct ClientState {
    seq: u64,
    pending: HashMap<u64, ArcCall>,
    /// user called close.
    closing: bool,
    /// the connection failed.
    shutdown: bool,
}

struct Inner {
    codec: Box<dyn Codec>,
    /// keeps one request on the wire at a time and owns the header
    /// scratch. Lock order everywhere: `sending` before `state`.
    sending: Mutex<Header>,
    state: Mutex<ClientState>,
}

/// a session over one connection: background receiver plus pending-call
/// table, multiplexing concurrent calls by sequence number.
pub struct Client {
    inner: Arc<Inner>,
    pub opt: Opt,
}

impl Client {
    /// wraps an already-connected stream: validates the codec, writes the
    /// option line, starts the receiver.
    pub fn new(conn: TcpStream, opt: &Opt) -> Result<Client> {
        let new_codec = lookup_codec(&opt.codec_type).map_err(|err| {
            log::error!("rpc client: codec error: {}", err);
            err
        })?;
        write_opt(&mut (&conn), opt).map_err(|err| {
            log::error!("rpc client: options error: {}", err);
            err
        })?;
        let codec = new_codec(conn)?;
        let inner = Arc::new(Inner {
            codec,
            sending: Mutex::new(Header::default()),
            state: Mutex::new(ClientState {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
        });
        let recv_inner = inner.clone();
        thread::spawn(move || Client::receive(recv_inner));
        Ok(Client {
            inner,
            opt: opt.clone(),
        })
    }

    /// dials a TCP address; `opt.connect_timeout` bounds dial plus
    /// handshake when non-zero.
    pub fn dial(addr: &str, opt: &Opt) -> Result<Client> {
        let (conn, deadline) = connect_stream(addr, opt)?;
        finish_dial(conn, deadline, opt)
    }

    /// dials an HTTP endpoint and upgrades via CONNECT before the rpc
    /// handshake.
    pub fn dial_http(addr: &str, opt: &Opt) -> Result<Client> {
        let (mut conn, deadline) = connect_stream(addr, opt)?;
        if let Some(dl) = deadline {
            let remaining = dl.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::ConnectTimeout(opt.connect_timeout));
            }
            conn.set_read_timeout(Some(remaining))?;
            conn.set_write_timeout(Some(remaining))?;
        }
        conn.write_all(format!("CONNECT {} HTTP/1.0\r\n\r\n", DEFAULT_RPC_PATH).as_bytes())?;
        let head = read_response_head(&mut conn)?;
        let status = head
            .lines()
            .next()
            .and_then(|line| line.split_once(' '))
            .map(|(_, status)| status)
            .unwrap_or("");
        if status != CONNECTED {
            return Err(Error::UnexpectedHttpResponse(status.to_owned()));
        }
        if deadline.is_some() {
            conn.set_read_timeout(None)?;
        }
        finish_dial(conn, deadline, opt)
    }

    /// dials a `protocol@addr` style address: `http@host:port` upgrades
    /// over CONNECT, `tcp@host:port` and bare addresses dial directly.
    pub fn xdial(rpc_addr: &str, opt: &Opt) -> Result<Client> {
        match rpc_addr.split_once('@') {
            Some(("http", addr)) => Client::dial_http(addr, opt),
            Some(("tcp", addr)) => Client::dial(addr, opt),
            Some(_) => Err(Error::BadAddress(rpc_addr.to_owned())),
            None => Client::dial(rpc_addr, opt),
        }
    }

    fn serialize_type(&self) -> SerializeType {
        self.inner.codec.serialize_type()
    }

    pub fn is_available(&self) -> bool {
        let state = self.inner.state.lock().expect("client state poisoned");
        !state.shutdown && !state.closing
    }

    /// closes the session. A second close returns the shutdown sentinel.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().expect("client state poisoned");
            if state.closing {
                return Err(Error::Shutdown);
            }
            state.closing = true;
        }
        self.inner.codec.close()
    }

    /// asynchronous invocation. Registers the call, writes the request and
    /// returns immediately; completion is signalled on the done channel
    /// (`None` allocates one of capacity 10, retrievable via
    /// `Call::done_rx`). Failures before the wire complete the call with
    /// the error rather than returning it.
    pub fn go<A: Param>(
        &self,
        service_method: &str,
        args: &A,
        done: Option<SyncSender<ArcCall>>,
    ) -> ArcCall {
        let (done, done_rx) = match done {
            Some(tx) => (tx, None),
            None => {
                let (tx, rx) = done_channel(DEFAULT_DONE_CAP);
                (tx, Some(rx))
            }
        };
        let call = Arc::new(Mutex::new(Call {
            seq: 0,
            service_method: service_method.to_owned(),
            reply_data: Bytes::new(),
            error: None,
            done,
            done_rx,
        }));
        self.send(&call, args);
        call
    }

    /// synchronous invocation honoring the context's deadline and
    /// cancellation; decodes the reply into `reply` on success.
    pub fn call<A: Param, R: Param>(
        &self,
        ctx: &Context,
        service_method: &str,
        args: &A,
        reply: &mut R,
    ) -> Result<()> {
        let (tx, rx) = done_channel(1);
        let call = self.go(service_method, args, Some(tx));
        let seq = call.lock().expect("call poisoned").seq;

        // cancellation completes the call through the normal done path
        let inner = self.inner.clone();
        ctx.on_cancel(Box::new(move || {
            let cancelled = inner
                .state
                .lock()
                .expect("client state poisoned")
                .pending
                .remove(&seq);
            if let Some(cancelled) = cancelled {
                Call::fail(&cancelled, Error::CallFailed("context canceled".to_owned()));
            }
        }));

        let completed = match ctx.deadline() {
            None => rx.recv().map_err(|_| Error::Shutdown)?,
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match rx.recv_timeout(remaining) {
                    Ok(call) => call,
                    Err(RecvTimeoutError::Timeout) => {
                        self.remove_call(seq);
                        return Err(Error::CallFailed("context deadline exceeded".to_owned()));
                    }
                    Err(RecvTimeoutError::Disconnected) => return Err(Error::Shutdown),
                }
            }
        };

        let completed = completed.lock().expect("call poisoned");
        if let Some(err) = &completed.error {
            return Err(err.clone());
        }
        reply.from_slice(self.serialize_type(), &completed.reply_data)
    }

    fn send<A: Param>(&self, call: &ArcCall, args: &A) {
        let payload = match args.to_bytes(self.serialize_type()) {
            Ok(p) => p,
            Err(err) => {
                Call::fail(call, err);
                return;
            }
        };
        let mut header = self.inner.sending.lock().expect("client sending poisoned");
        let seq = match self.register_call(call) {
            Ok(seq) => seq,
            Err(err) => {
                drop(header);
                Call::fail(call, err);
                return;
            }
        };
        header.service_method = call.lock().expect("call poisoned").service_method.clone();
        header.seq = seq;
        header.error.clear();
        if let Err(err) = self.inner.codec.write(&header, &payload) {
            if let Some(call) = self.remove_call(seq) {
                Call::fail(&call, err);
            }
        }
    }

    fn register_call(&self, call: &ArcCall) -> Result<u64> {
        let mut state = self.inner.state.lock().expect("client state poisoned");
        if state.closing || state.shutdown {
            return Err(Error::Shutdown);
        }
        let seq = state.seq;
        call.lock().expect("call poisoned").seq = seq;
        state.pending.insert(seq, call.clone());
        state.seq += 1;
        Ok(seq)
    }

    fn remove_call(&self, seq: u64) -> Option<ArcCall> {
        self.inner
            .state
            .lock()
            .expect("client state poisoned")
            .pending
            .remove(&seq)
    }

    /// the background receiver: delivers responses to their pending calls
    /// until the stream fails, then terminates everything left.
    fn receive(inner: Arc<Inner>) {
        let err = loop {
            let mut h = Header::default();
            if let Err(err) = inner.codec.read_header(&mut h) {
                break err;
            }
            let call = inner
                .state
                .lock()
                .expect("client state poisoned")
                .pending
                .remove(&h.seq);
            match call {
                // request half-sent or already given up on; the body still
                // has to leave the stream
                None => {
                    if let Err(err) = inner.codec.read_body() {
                        break err;
                    }
                }
                Some(call) if !h.error.is_empty() => {
                    call.lock().expect("call poisoned").error = Some(Error::Remote(h.error.clone()));
                    let drained = inner.codec.read_body();
                    Call::complete(&call);
                    if let Err(err) = drained {
                        break err;
                    }
                }
                Some(call) => match inner.codec.read_body() {
                    Ok(body) => {
                        call.lock().expect("call poisoned").reply_data = body;
                        Call::complete(&call);
                    }
                    Err(err) => {
                        Call::fail(&call, Error::Codec(format!("reading body: {}", err)));
                        break err;
                    }
                },
            }
        };
        if !err.is_eof() {
            log::error!("rpc client: receive error: {}", err);
        }
        Client::terminate_calls(&inner, err);
    }

    fn terminate_calls(inner: &Arc<Inner>, err: Error) {
        let _sending = inner.sending.lock().expect("client sending poisoned");
        let mut state = inner.state.lock().expect("client state poisoned");
        state.shutdown = true;
        for (_, call) in state.pending.drain() {
            Call::fail(&call, err.clone());
        }
    }
}

fn connect_stream(addr: &str, opt: &Opt) -> Result<(TcpStream, Option<Instant>)> {
    if opt.connect_timeout.is_zero() {
        return Ok((TcpStream::connect(addr)?, None));
    }
    let deadline = Instant::now() + opt.connect_timeout;
    let socket_addr = addr.to_socket_addrs()?.next().ok_or_else(|| {
        Error::Io(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no usable address for {}", addr),
        ))
    })?;
    let conn = TcpStream::connect_timeout(&socket_addr, opt.connect_timeout)?;
    Ok((conn, Some(deadline)))
}

/// completes a dial: with a deadline, the remainder is applied as a write
/// timeout covering the option handshake, then cleared.
fn finish_dial(conn: TcpStream, deadline: Option<Instant>, opt: &Opt) -> Result<Client> {
    let Some(deadline) = deadline else {
        return Client::new(conn, opt);
    };
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err(Error::ConnectTimeout(opt.connect_timeout));
    }
    conn.set_write_timeout(Some(remaining))?;
    let handle = conn.try_clone()?;
    let client = Client::new(conn, opt).map_err(|err| match err {
        Error::Io(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
            Error::ConnectTimeout(opt.connect_timeout)
        }
        other => other,
    })?;
    handle.set_write_timeout(None)?;
    Ok(client)
}

/// reads an HTTP response head without consuming anything past the blank
/// line; the server sends nothing further until our option line arrives.
fn read_response_head(conn: &mut TcpStream) -> Result<String> {
    let mut head = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = conn.read(&mut byte)?;
        if n == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed in response head",
            )));
        }
        head.push(byte[0]);
        if head.len() > 8192 {
            return Err(Error::UnexpectedHttpResponse("response head too long".to_owned()));
        }
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Duration;

    fn idle_peer_client() -> (Client, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let conn = TcpStream::connect(addr).unwrap();
        let (peer, _) = listener.accept().unwrap();
        let client = Client::new(conn, &Opt::default()).unwrap();
        (client, peer)
    }

    #[test]
    #[should_panic(expected = "done channel is unbuffered")]
    fn zero_capacity_done_channel_panics() {
        let _ = done_channel(0);
    }

    #[test]
    fn close_is_idempotent_at_the_available_level() {
        let (client, _peer) = idle_peer_client();
        assert!(client.is_available());

        client.close().unwrap();
        assert!(!client.is_available());
        assert!(matches!(client.close(), Err(Error::Shutdown)));
    }

    #[test]
    fn go_after_close_fails_with_shutdown() {
        let (client, _peer) = idle_peer_client();
        client.close().unwrap();

        let call = client.go("Foo.Sum", &1u64, None);
        let rx = call.lock().unwrap().done_rx.take().unwrap();
        let completed = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(
            completed.lock().unwrap().error,
            Some(Error::Shutdown)
        ));
    }

    #[test]
    fn broken_stream_fails_all_pending_calls() {
        let (client, peer) = idle_peer_client();

        let call = client.go("Foo.Sum", &1u64, None);
        let rx = call.lock().unwrap().done_rx.take().unwrap();
        drop(peer);

        let completed = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let completed = completed.lock().unwrap();
        assert!(completed.error.is_some());
        assert!(!client.is_available());
    }

    #[test]
    fn sequence_numbers_start_at_one_and_increase() {
        let (client, _peer) = idle_peer_client();

        let first = client.go("Foo.Sum", &1u64, None);
        let second = client.go("Foo.Sum", &2u64, None);
        assert_eq!(first.lock().unwrap().seq, 1);
        assert_eq!(second.lock().unwrap().seq, 2);
    }

    #[test]
    fn cancelled_context_fails_the_call_promptly() {
        let (client, _peer) = idle_peer_client();
        let (ctx, handle) = Context::with_cancel(&Context::background());

        let waiter = thread::spawn(move || {
            handle.cancel();
        });

        // the peer never answers; only cancellation can complete this
        let mut reply = 0u64;
        let err = client.call(&ctx, "Foo.Sum", &1u64, &mut reply).unwrap_err();
        assert!(err.to_string().contains("context canceled"));
        waiter.join().unwrap();
    }
}
