use serde::{Deserialize, Serialize};

use minirpc::{Client, Context, Opt};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Args {
    num1: i64,
    num2: i64,
}

fn main() -> minirpc::Result<()> {
    env_logger::init();

    let addr = std::env::args().nth(1).unwrap_or_else(|| "127.0.0.1:8972".to_owned());
    let client = Client::dial(&addr, &Opt::default())?;

    for i in 0..5 {
        let args = Args { num1: i, num2: i * i };
        let mut reply = 0i64;
        client.call(&Context::background(), "Foo.Sum", &args, &mut reply)?;
        log::info!("{} + {} = {}", args.num1, args.num2, reply);
    }
    client.close()?;
    Ok(())
}
