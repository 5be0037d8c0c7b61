use std::net::TcpListener;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use minirpc::{Server, Service};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Args {
    num1: i64,
    num2: i64,
}

fn main() -> minirpc::Result<()> {
    env_logger::init();

    let server = Arc::new(Server::new());
    let mut foo = Service::new("Foo")?;
    foo.register_method("Sum", |args: Args, reply: &mut i64| {
        *reply = args.num1 + args.num2;
        Ok(())
    })?;
    foo.register_method("Mul", |args: Args, reply: &mut i64| {
        *reply = args.num1 * args.num2;
        Ok(())
    })?;
    server.register(foo)?;

    let addr = std::env::args().nth(1).unwrap_or_else(|| "0.0.0.0:8972".to_owned());
    let listener = TcpListener::bind(&addr)?;
    log::info!("start rpc server on {}", listener.local_addr()?);
    server.accept(listener);
    Ok(())
}
