use std::collections::HashMap;
use std::convert::Infallible;
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::{Empty, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;

use minirpc_protocol::{Error, Result};

pub const DEFAULT_REGISTRY_PATH: &str = "/_minirpc_/registry";

/// a server older than this is dropped from the alive list. Zero disables
/// expiry.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// response header listing alive servers, comma-separated.
pub const SERVERS_HEADER: &str = "X-Minirpc-Servers";
/// request header naming the server sending a keep-alive.
pub const SERVER_HEADER: &str = "X-Minirpc-Server";

/// in-memory registry: servers post keep-alives, clients fetch the alive
/// list from a response header.
pub struct Registry {
    timeout: Duration,
    servers: Mutex<HashMap<String, Instant>>,
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new(DEFAULT_TIMEOUT)
    }
}

impl Registry {
    pub fn new(timeout: Duration) -> Registry {
        Registry {
            timeout,
            servers: Mutex::new(HashMap::new()),
        }
    }

    pub fn put_server(&self, addr: &str) {
        self.servers
            .lock()
            .expect("registry poisoned")
            .insert(addr.to_owned(), Instant::now());
    }

    /// current alive servers, sorted; expired entries are pruned on the
    /// way out.
    pub fn alive_servers(&self) -> Vec<String> {
        let mut servers = self.servers.lock().expect("registry poisoned");
        let timeout = self.timeout;
        servers.retain(|_, seen| timeout.is_zero() || seen.elapsed() < timeout);
        let mut alive: Vec<String> = servers.keys().cloned().collect();
        alive.sort();
        alive
    }

    /// serves the registry protocol on `listener` until the listener
    /// fails. Blocks the calling thread.
    pub fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        listener.set_nonblocking(true)?;
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        rt.block_on(async move {
            let listener = tokio::net::TcpListener::from_std(listener)?;
            log::info!("rpc registry: serving on {}", listener.local_addr()?);
            loop {
                let (stream, _) = listener.accept().await?;
                let registry = self.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let registry = registry.clone();
                        async move { Ok::<_, Infallible>(handle(&registry, req)) }
                    });
                    if let Err(err) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        log::debug!("rpc registry: connection error: {}", err);
                    }
                });
            }
        })
    }
}

fn handle(registry: &Registry, req: Request<Incoming>) -> Response<Full<Bytes>> {
    if req.uri().path() != DEFAULT_REGISTRY_PATH {
        return text_response(StatusCode::NOT_FOUND, "not found\n");
    }
    match *req.method() {
        Method::GET => {
            let mut response = Response::new(Full::new(Bytes::new()));
            match hyper::header::HeaderValue::from_str(&registry.alive_servers().join(",")) {
                Ok(value) => {
                    response.headers_mut().insert(SERVERS_HEADER, value);
                }
                Err(err) => {
                    log::error!("rpc registry: unencodable server list: {}", err);
                    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                }
            }
            response
        }
        Method::POST => match req.headers().get(SERVER_HEADER).and_then(|v| v.to_str().ok()) {
            Some(addr) if !addr.is_empty() => {
                registry.put_server(addr);
                text_response(StatusCode::OK, "")
            }
            _ => text_response(StatusCode::INTERNAL_SERVER_ERROR, "missing server header\n"),
        },
        _ => text_response(StatusCode::METHOD_NOT_ALLOWED, "405 must GET or POST\n"),
    }
}

fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_owned())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain"),
    );
    response
}

/// announces `addr` to the registry now and then periodically from a
/// background thread; the default period leaves one minute of margin
/// inside the registry's liveness window.
pub fn heartbeat(registry: &str, addr: &str, period: Option<Duration>) -> Result<()> {
    let period = period.unwrap_or(DEFAULT_TIMEOUT - Duration::from_secs(60));
    send_heartbeat(registry, addr)?;
    let registry = registry.to_owned();
    let addr = addr.to_owned();
    thread::spawn(move || loop {
        thread::sleep(period);
        if let Err(err) = send_heartbeat(&registry, &addr) {
            log::error!("rpc registry: heartbeat error: {}", err);
            return;
        }
    });
    Ok(())
}

pub fn send_heartbeat(registry: &str, addr: &str) -> Result<()> {
    log::info!("{} send heart beat to registry {}", addr, registry);
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(post_heartbeat(registry, addr))
}

async fn post_heartbeat(registry: &str, addr: &str) -> Result<()> {
    let uri: hyper::Uri = registry
        .parse()
        .map_err(|err| Error::Registry(format!("bad registry url {:?}: {}", registry, err)))?;
    let host = uri
        .host()
        .ok_or_else(|| Error::Registry(format!("bad registry url {:?}", registry)))?
        .to_owned();
    let port = uri.port_u16().unwrap_or(80);

    let stream = tokio::net::TcpStream::connect((host.as_str(), port)).await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|err| Error::Registry(err.to_string()))?;
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let path = uri
        .path_and_query()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());
    let request = Request::builder()
        .method(Method::POST)
        .uri(path)
        .header(hyper::header::HOST, host)
        .header(SERVER_HEADER, addr)
        .body(Empty::<Bytes>::new())
        .map_err(|err| Error::Registry(err.to_string()))?;
    let response = sender
        .send_request(request)
        .await
        .map_err(|err| Error::Registry(err.to_string()))?;
    if !response.status().is_success() {
        return Err(Error::Registry(format!(
            "heartbeat rejected with {}",
            response.status()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_and_list_servers_sorted() {
        let registry = Registry::default();
        registry.put_server("b:2");
        registry.put_server("a:1");
        assert_eq!(registry.alive_servers(), vec!["a:1", "b:2"]);
    }

    #[test]
    fn stale_servers_are_pruned() {
        let registry = Registry::new(Duration::from_millis(20));
        registry.put_server("a:1");
        thread::sleep(Duration::from_millis(40));
        registry.put_server("b:2");
        assert_eq!(registry.alive_servers(), vec!["b:2"]);
    }

    #[test]
    fn zero_timeout_never_expires() {
        let registry = Registry::new(Duration::ZERO);
        registry.put_server("a:1");
        thread::sleep(Duration::from_millis(10));
        assert_eq!(registry.alive_servers(), vec!["a:1"]);
    }

    #[test]
    fn keepalive_refreshes_a_server() {
        let registry = Registry::new(Duration::from_millis(60));
        registry.put_server("a:1");
        thread::sleep(Duration::from_millis(40));
        registry.put_server("a:1");
        thread::sleep(Duration::from_millis(40));
        assert_eq!(registry.alive_servers(), vec!["a:1"]);
    }
}
