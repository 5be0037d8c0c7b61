use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;

use minirpc_protocol::{Error, Opt, Param, Result};

use crate::client::Client;
use crate::context::Context;
use crate::discovery::{Discovery, SelectMode};

/// load-balancing front-end: a pool of sessions keyed by address, a
/// discovery source and a selection mode.
pub struct XClient<D: Discovery> {
    d: D,
    mode: SelectMode,
    opt: Opt,
    clients: Mutex<HashMap<String, Arc<Client>>>,
}

struct BroadcastState<'a, R> {
    err: Option<Error>,
    /// the caller's slot; taken by the first successful peer.
    reply: Option<&'a mut R>,
}

impl<D: Discovery> XClient<D> {
    pub fn new(d: D, mode: SelectMode, opt: Opt) -> XClient<D> {
        XClient {
            d,
            mode,
            opt,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// closes every cached session and empties the pool.
    pub fn close(&self) {
        let mut clients = self.clients.lock().expect("xclient pool poisoned");
        for (_, client) in clients.drain() {
            let _ = client.close();
        }
    }

    fn dial(&self, rpc_addr: &str) -> Result<Arc<Client>> {
        let mut clients = self.clients.lock().expect("xclient pool poisoned");
        if let Some(client) = clients.get(rpc_addr) {
            if client.is_available() {
                return Ok(client.clone());
            }
            let _ = client.close();
            clients.remove(rpc_addr);
        }
        let client = Arc::new(Client::xdial(rpc_addr, &self.opt)?);
        clients.insert(rpc_addr.to_owned(), client.clone());
        Ok(client)
    }

    fn call_addr<A: Param, R: Param>(
        &self,
        rpc_addr: &str,
        ctx: &Context,
        service_method: &str,
        args: &A,
        reply: &mut R,
    ) -> Result<()> {
        self.dial(rpc_addr)?.call(ctx, service_method, args, reply)
    }

    /// picks one server by the configured mode and invokes it.
    pub fn call<A: Param, R: Param>(
        &self,
        ctx: &Context,
        service_method: &str,
        args: &A,
        reply: &mut R,
    ) -> Result<()> {
        let rpc_addr = self.d.get(self.mode)?;
        self.call_addr(&rpc_addr, ctx, service_method, args, reply)
    }

    /// invokes every known server in parallel. The first error wins and
    /// cancels the remaining peers; the first success writes its reply
    /// into the caller's slot, later successes are discarded.
    pub fn broadcast<A, R>(
        &self,
        ctx: &Context,
        service_method: &str,
        args: &A,
        reply: Option<&mut R>,
    ) -> Result<()>
    where
        A: Param + Sync,
        R: Param + Default + Send,
    {
        let servers = self.d.get_all()?;
        let (ctx, cancel) = Context::with_cancel(ctx);
        let state = Mutex::new(BroadcastState { err: None, reply });

        thread::scope(|s| {
            for rpc_addr in &servers {
                let ctx = &ctx;
                let cancel = &cancel;
                let state = &state;
                s.spawn(move || {
                    // peers never write into the caller's slot directly
                    let mut cloned = R::default();
                    let result = self.call_addr(rpc_addr, ctx, service_method, args, &mut cloned);
                    let mut state = state.lock().expect("broadcast state poisoned");
                    match result {
                        Err(err) => {
                            if state.err.is_none() {
                                state.err = Some(err);
                                cancel.cancel();
                            }
                        }
                        Ok(()) => {
                            if let Some(slot) = state.reply.take() {
                                *slot = cloned;
                            }
                        }
                    }
                });
            }
        });

        match state.into_inner().expect("broadcast state poisoned").err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
