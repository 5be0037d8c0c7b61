pub mod http;
pub mod service;

pub use service::{MethodFn, MethodType, Service};

use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use bytes::Bytes;

use minirpc_protocol::{
    empty_body, lookup_codec, read_opt, Codec, Error, Header, Opt, MAGIC_NUMBER,
};

/// accepts connections and dispatches requests to registered services.
/// One reader thread per connection, one worker per in-flight request.
pub struct Server {
    service_map: RwLock<HashMap<String, Arc<Service>>>,
}

struct Request {
    h: Header,
    svc: Arc<Service>,
    mtype: Arc<MethodType>,
    payload: Bytes,
}

enum ReadError {
    /// header could not be read; the connection is done.
    Fatal(Error),
    /// the request consumed a seq but cannot be invoked; answer with the
    /// error and keep the loop going.
    Respond(Header, Error),
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Server {
        Server {
            service_map: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, svc: Service) -> Result<(), Error> {
        let mut map = self.service_map.write().expect("service map poisoned");
        if map.contains_key(svc.name()) {
            return Err(Error::ServiceAlreadyDefined(svc.name().to_owned()));
        }
        map.insert(svc.name().to_owned(), Arc::new(svc));
        Ok(())
    }

    fn find_service(&self, service_method: &str) -> Result<(Arc<Service>, Arc<MethodType>), Error> {
        let (service_name, method_name) = match service_method.rsplit_once('.') {
            Some((s, m)) if !s.is_empty() && !m.is_empty() => (s, m),
            _ => return Err(Error::IllFormedServiceMethod(service_method.to_owned())),
        };
        let svc = self
            .service_map
            .read()
            .expect("service map poisoned")
            .get(service_name)
            .cloned()
            .ok_or_else(|| Error::ServiceNotFound(service_name.to_owned()))?;
        let mtype = svc
            .method(method_name)
            .ok_or_else(|| Error::MethodNotFound(method_name.to_owned()))?;
        Ok((svc, mtype))
    }

    /// per-method call counts, for the debug endpoint.
    pub fn call_counts(&self) -> Vec<(String, u64)> {
        let map = self.service_map.read().expect("service map poisoned");
        let mut counts = Vec::new();
        for (name, svc) in map.iter() {
            for (method, mtype) in svc.methods() {
                counts.push((format!("{}.{}", name, method), mtype.num_calls()));
            }
        }
        counts.sort();
        counts
    }

    /// accept loop; one connection thread each. Returns when the listener
    /// fails.
    pub fn accept(self: &Arc<Self>, listener: TcpListener) {
        for stream in listener.incoming() {
            match stream {
                Ok(conn) => {
                    let server = self.clone();
                    thread::spawn(move || server.serve_conn(conn));
                }
                Err(err) => {
                    log::error!("rpc server: accept error: {}", err);
                    return;
                }
            }
        }
    }

    /// runs the option handshake and then the request loop on one
    /// connection.
    pub fn serve_conn(self: &Arc<Self>, mut conn: TcpStream) {
        let opt = match read_opt(&mut conn) {
            Ok(opt) => opt,
            Err(err) => {
                log::error!("rpc server: options error: {}", err);
                return;
            }
        };
        if opt.magic_number != MAGIC_NUMBER {
            log::error!("rpc server: {}", Error::InvalidMagic(opt.magic_number));
            return;
        }
        let new_codec = match lookup_codec(&opt.codec_type) {
            Ok(f) => f,
            Err(err) => {
                log::error!("rpc server: {}", err);
                return;
            }
        };
        let codec = match new_codec(conn) {
            Ok(c) => c,
            Err(err) => {
                log::error!("rpc server: codec setup error: {}", err);
                return;
            }
        };
        self.serve_codec(Arc::from(codec), &opt);
    }

    fn serve_codec(self: &Arc<Self>, codec: Arc<dyn Codec>, opt: &Opt) {
        let wg = WaitGroup::default();
        loop {
            let req = match self.read_request(&codec) {
                Ok(req) => req,
                Err(ReadError::Fatal(err)) => {
                    if !err.is_eof() {
                        log::error!("rpc server: read header error: {}", err);
                    }
                    break;
                }
                Err(ReadError::Respond(mut h, err)) => {
                    h.error = err.to_string();
                    send_response(&codec, &h, &empty_body(codec.serialize_type()));
                    continue;
                }
            };
            let server = self.clone();
            let worker_codec = codec.clone();
            let timeout = opt.handle_timeout;
            let guard = wg.guard();
            thread::spawn(move || {
                let _in_flight = guard;
                server.handle_request(worker_codec, req, timeout);
            });
        }
        wg.wait();
        let _ = codec.close();
    }

    fn read_request(&self, codec: &Arc<dyn Codec>) -> Result<Request, ReadError> {
        let mut h = Header::default();
        if let Err(err) = codec.read_header(&mut h) {
            return Err(ReadError::Fatal(err));
        }
        let (svc, mtype) = match self.find_service(&h.service_method) {
            Ok(found) => found,
            Err(err) => {
                // drain the body so the stream stays aligned
                let _ = codec.read_body();
                return Err(ReadError::Respond(h, err));
            }
        };
        let payload = match codec.read_body() {
            Ok(p) => p,
            Err(err) => {
                log::error!("rpc server: read body error: {}", err);
                return Err(ReadError::Respond(h, err));
            }
        };
        Ok(Request {
            h,
            svc,
            mtype,
            payload,
        })
    }

    /// invokes one request and sends exactly one response for its seq,
    /// racing the invocation against `handle_timeout` when it is set.
    fn handle_request(&self, codec: Arc<dyn Codec>, req: Request, timeout: Duration) {
        let Request {
            h,
            svc,
            mtype,
            payload,
        } = req;
        let st = codec.serialize_type();
        let (called_tx, called_rx) = mpsc::channel::<()>();
        let (sent_tx, sent_rx) = mpsc::channel::<()>();
        let responded = Arc::new(AtomicBool::new(false));

        let invoke_codec = codec.clone();
        let invoke_responded = responded.clone();
        let mut invoke_h = h.clone();
        thread::spawn(move || {
            let result = svc.call(&mtype, &payload, st);
            let _ = called_tx.send(());
            match result {
                Ok(reply) => {
                    if !invoke_responded.swap(true, Ordering::SeqCst) {
                        send_response(&invoke_codec, &invoke_h, &reply);
                    }
                }
                Err(err) => {
                    invoke_h.error = err.to_string();
                    if !invoke_responded.swap(true, Ordering::SeqCst) {
                        send_response(&invoke_codec, &invoke_h, &empty_body(st));
                    }
                }
            }
            let _ = sent_tx.send(());
        });

        if timeout.is_zero() {
            let _ = called_rx.recv();
            let _ = sent_rx.recv();
            return;
        }
        match called_rx.recv_timeout(timeout) {
            Ok(()) => {
                let _ = sent_rx.recv();
            }
            Err(_) => {
                // the invocation keeps running but its response, if any,
                // loses the guard and is dropped
                if !responded.swap(true, Ordering::SeqCst) {
                    let mut th = h;
                    th.error = Error::HandleTimeout(timeout).to_string();
                    send_response(&codec, &th, &empty_body(st));
                }
            }
        }
    }
}

fn send_response(codec: &Arc<dyn Codec>, h: &Header, body: &[u8]) {
    if let Err(err) = codec.write(h, body) {
        log::error!("rpc server: write response error: {}", err);
    }
}

/// counts in-flight request workers so shutdown can wait for them.
#[derive(Clone, Default)]
struct WaitGroup {
    inner: Arc<WgInner>,
}

#[derive(Default)]
struct WgInner {
    count: Mutex<usize>,
    cond: Condvar,
}

struct WgGuard(Arc<WgInner>);

impl WaitGroup {
    fn guard(&self) -> WgGuard {
        *self.inner.count.lock().expect("waitgroup poisoned") += 1;
        WgGuard(self.inner.clone())
    }

    fn wait(&self) {
        let mut count = self.inner.count.lock().expect("waitgroup poisoned");
        while *count > 0 {
            count = self.inner.cond.wait(count).expect("waitgroup poisoned");
        }
    }
}

impl Drop for WgGuard {
    fn drop(&mut self) {
        let mut count = self.0.count.lock().expect("waitgroup poisoned");
        *count -= 1;
        if *count == 0 {
            self.0.cond.notify_all();
        }
    }
}
