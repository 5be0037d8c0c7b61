use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use minirpc_protocol::{Error, Param, Result, SerializeType};

/// the generated handler: decodes the argument, invokes the method with a
/// fresh reply, encodes the reply.
pub type MethodFn = Box<dyn Fn(&[u8], SerializeType) -> Result<Vec<u8>> + Send + Sync>;

/// descriptor of one callable method.
pub struct MethodType {
    f: MethodFn,
    num_calls: Arc<AtomicU64>,
}

impl MethodType {
    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MethodType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodType")
            .field("num_calls", &self.num_calls)
            .finish()
    }
}

/// a named group of methods callable as `"Service.Method"`.
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<MethodType>>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Service {
    /// service names follow the exported-name convention: leading
    /// uppercase letter.
    pub fn new(name: &str) -> Result<Service> {
        if !is_exported(name) {
            return Err(Error::InvalidServiceName(name.to_owned()));
        }
        Ok(Service {
            name: name.to_owned(),
            methods: HashMap::new(),
        })
    }

    /// registers `f` under `name`. The handler receives the decoded
    /// argument by value and a freshly defaulted reply slot; maps and
    /// sequences therefore start empty and writable.
    pub fn register_method<A, R, F>(&mut self, name: &str, f: F) -> Result<()>
    where
        A: Param + Default + 'static,
        R: Param + Default + 'static,
        F: Fn(A, &mut R) -> Result<()> + Send + Sync + 'static,
    {
        if !is_exported(name) {
            return Err(Error::InvalidMethodName(name.to_owned()));
        }
        let num_calls = Arc::new(AtomicU64::new(0));
        let counter = num_calls.clone();
        let handler: MethodFn = Box::new(move |payload, st| {
            let mut args = A::default();
            args.from_slice(st, payload)?;
            // a call is counted once the argument decoded, whether or not
            // the method then fails
            counter.fetch_add(1, Ordering::SeqCst);
            let mut reply = R::default();
            f(args, &mut reply)?;
            reply.to_bytes(st)
        });
        log::info!("rpc server: register {}.{}", self.name, name);
        self.methods
            .insert(name.to_owned(), Arc::new(MethodType { f: handler, num_calls }));
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method(&self, name: &str) -> Option<Arc<MethodType>> {
        self.methods.get(name).cloned()
    }

    pub fn methods(&self) -> impl Iterator<Item = (&str, &Arc<MethodType>)> {
        self.methods.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn call(&self, m: &MethodType, payload: &[u8], st: SerializeType) -> Result<Vec<u8>> {
        (m.f)(payload, st)
    }
}

fn is_exported(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_uppercase())
}
