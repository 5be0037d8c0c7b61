use serde::{Deserialize, Serialize};

use minirpc::{Context, MultiServersDiscovery, Opt, SelectMode, XClient};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Args {
    num1: i64,
    num2: i64,
}

fn main() -> minirpc::Result<()> {
    env_logger::init();

    let servers: Vec<String> = std::env::args().skip(1).collect();
    let servers = if servers.is_empty() {
        vec!["127.0.0.1:8972".to_owned(), "127.0.0.1:8973".to_owned()]
    } else {
        servers
    };

    let discovery = MultiServersDiscovery::new(servers);
    let xc = XClient::new(discovery, SelectMode::RoundRobin, Opt::default());

    for i in 0..5 {
        let args = Args { num1: i, num2: i * i };
        let mut reply = 0i64;
        xc.call(&Context::background(), "Foo.Sum", &args, &mut reply)?;
        log::info!("call Foo.Sum: {} + {} = {}", args.num1, args.num2, reply);
    }

    let args = Args { num1: 3, num2: 4 };
    let mut reply = 0i64;
    xc.broadcast(&Context::background(), "Foo.Mul", &args, Some(&mut reply))?;
    log::info!("broadcast Foo.Mul: {} * {} = {}", args.num1, args.num2, reply);

    xc.close();
    Ok(())
}
