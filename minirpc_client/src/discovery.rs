use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use http_body_util::Empty;
use hyper_util::rt::TokioIo;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use minirpc_protocol::{Error, Result};

/// response header carrying the comma-separated server list.
pub const SERVERS_HEADER: &str = "X-Minirpc-Servers";

pub const DEFAULT_UPDATE_TIMEOUT: Duration = Duration::from_secs(10);

/// transport bound for one registry fetch.
const REFRESH_HTTP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SelectMode {
    Random,
    RoundRobin,
    /// recognized but not implemented by the built-in discoveries.
    WeightedRoundRobin,
    /// recognized but not implemented by the built-in discoveries.
    ConsistentHash,
}

/// yields server addresses by selection mode, optionally refreshed from an
/// external registry.
pub trait Discovery: Send + Sync {
    fn refresh(&self) -> Result<()>;
    fn update(&self, servers: Vec<String>) -> Result<()>;
    fn get(&self, mode: SelectMode) -> Result<String>;
    fn get_all(&self) -> Result<Vec<String>>;
}

struct Servers {
    servers: Vec<String>,
    /// round-robin cursor; starts at a random offset so a fleet of fresh
    /// clients does not pile onto index zero.
    index: usize,
    rng: StdRng,
}

/// discovery over a fixed, caller-maintained server list.
pub struct MultiServersDiscovery {
    inner: RwLock<Servers>,
}

impl MultiServersDiscovery {
    pub fn new(servers: Vec<String>) -> MultiServersDiscovery {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let mut rng = StdRng::seed_from_u64(seed);
        let index = rng.gen_range(0..i32::MAX as usize);
        MultiServersDiscovery {
            inner: RwLock::new(Servers {
                servers,
                index,
                rng,
            }),
        }
    }
}

impl Discovery for MultiServersDiscovery {
    fn refresh(&self) -> Result<()> {
        Ok(())
    }

    fn update(&self, servers: Vec<String>) -> Result<()> {
        self.inner.write().expect("discovery poisoned").servers = servers;
        Ok(())
    }

    fn get(&self, mode: SelectMode) -> Result<String> {
        let mut inner = self.inner.write().expect("discovery poisoned");
        let n = inner.servers.len();
        if n == 0 {
            return Err(Error::NoAvailableServers);
        }
        match mode {
            SelectMode::Random => {
                let i = inner.rng.gen_range(0..n);
                Ok(inner.servers[i].clone())
            }
            SelectMode::RoundRobin => {
                let picked = inner.servers[inner.index % n].clone();
                inner.index = (inner.index + 1) % n;
                Ok(picked)
            }
            _ => Err(Error::NotSupportedSelectMode),
        }
    }

    fn get_all(&self) -> Result<Vec<String>> {
        Ok(self.inner.read().expect("discovery poisoned").servers.clone())
    }
}

/// discovery that polls a registry endpoint, with a refresh TTL. A failed
/// fetch surfaces as an error and leaves the last-known list untouched.
pub struct RegistryDiscovery {
    servers: MultiServersDiscovery,
    registry: String,
    timeout: Duration,
    last_update: Mutex<Option<Instant>>,
    rt: tokio::runtime::Runtime,
}

impl RegistryDiscovery {
    /// `timeout` is the refresh TTL; `None` uses the 10 s default.
    pub fn new(registry: &str, timeout: Option<Duration>) -> Result<RegistryDiscovery> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(RegistryDiscovery {
            servers: MultiServersDiscovery::new(Vec::new()),
            registry: registry.to_owned(),
            timeout: timeout.unwrap_or(DEFAULT_UPDATE_TIMEOUT),
            last_update: Mutex::new(None),
            rt,
        })
    }
}

impl Discovery for RegistryDiscovery {
    fn refresh(&self) -> Result<()> {
        {
            let last = self.last_update.lock().expect("discovery poisoned");
            if let Some(at) = *last {
                if at.elapsed() < self.timeout {
                    return Ok(());
                }
            }
        }
        log::info!("rpc registry: refresh servers from registry {}", self.registry);
        let header = self.rt.block_on(async {
            match tokio::time::timeout(REFRESH_HTTP_TIMEOUT, fetch_servers(&self.registry)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Registry(format!(
                    "refresh of {} timed out after {:?}",
                    self.registry, REFRESH_HTTP_TIMEOUT
                ))),
            }
        })?;
        let servers = header
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();
        self.servers.update(servers)?;
        *self.last_update.lock().expect("discovery poisoned") = Some(Instant::now());
        Ok(())
    }

    fn update(&self, servers: Vec<String>) -> Result<()> {
        self.servers.update(servers)?;
        *self.last_update.lock().expect("discovery poisoned") = Some(Instant::now());
        Ok(())
    }

    fn get(&self, mode: SelectMode) -> Result<String> {
        self.refresh()?;
        self.servers.get(mode)
    }

    fn get_all(&self) -> Result<Vec<String>> {
        self.refresh()?;
        self.servers.get_all()
    }
}

async fn fetch_servers(registry: &str) -> Result<String> {
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
    let request = hyper::Request::builder()
        .method(hyper::Method::GET)
        .uri(path)
        .header(hyper::header::HOST, host)
        .body(Empty::<bytes::Bytes>::new())
        .map_err(|err| Error::Registry(err.to_string()))?;
    let response = sender
        .send_request(request)
        .await
        .map_err(|err| Error::Registry(err.to_string()))?;
    if !response.status().is_success() {
        return Err(Error::Registry(format!(
            "registry returned {}",
            response.status()
        )));
    }
    Ok(response
        .headers()
        .get(SERVERS_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_owned())
}
