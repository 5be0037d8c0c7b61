use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use minirpc::{
    Client, Context, Error, MultiServersDiscovery, Opt, SelectMode, Server, Service, XClient,
    JSON_CODEC,
};

#[derive(Debug, Default, Serialize, Deserialize, Clone, Copy)]
struct Args {
    num1: i64,
    num2: i64,
}

fn sum_service() -> Service {
    let mut svc = Service::new("Foo").unwrap();
    svc.register_method("Sum", |args: Args, reply: &mut i64| {
        *reply = args.num1 + args.num2;
        Ok(())
    })
    .unwrap();
    svc.register_method("Sleepy", |args: Args, reply: &mut i64| {
        thread::sleep(Duration::from_secs(2));
        *reply = args.num1 + args.num2;
        Ok(())
    })
    .unwrap();
    svc.register_method("Boom", |_: Args, _: &mut i64| {
        Err(Error::Remote("boom".to_owned()))
    })
    .unwrap();
    svc
}

fn start_server() -> String {
    let server = Arc::new(Server::new());
    server.register(sum_service()).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    thread::spawn(move || server.accept(listener));
    addr
}

#[test]
fn sum_over_tcp() {
    let addr = start_server();
    let client = Client::dial(&addr, &Opt::default()).unwrap();

    let mut reply = 0i64;
    client
        .call(
            &Context::background(),
            "Foo.Sum",
            &Args { num1: 1, num2: 3 },
            &mut reply,
        )
        .unwrap();
    assert_eq!(reply, 4);
}

#[test]
fn sum_over_tcp_with_json_codec() {
    let addr = start_server();
    let client = Client::dial(&addr, &Opt::with_codec(JSON_CODEC)).unwrap();

    let mut reply = 0i64;
    client
        .call(
            &Context::background(),
            "Foo.Sum",
            &Args { num1: 20, num2: 22 },
            &mut reply,
        )
        .unwrap();
    assert_eq!(reply, 42);
}

#[test]
fn unknown_method_is_reported() {
    let addr = start_server();
    let client = Client::dial(&addr, &Opt::default()).unwrap();

    let mut reply = 0i64;
    let err = client
        .call(
            &Context::background(),
            "Foo.Missing",
            &Args::default(),
            &mut reply,
        )
        .unwrap_err();
    assert!(
        err.to_string().contains("can't find method Missing"),
        "got {}",
        err
    );
}

#[test]
fn ill_formed_service_method_is_reported() {
    let addr = start_server();
    let client = Client::dial(&addr, &Opt::default()).unwrap();

    let mut reply = 0i64;
    let err = client
        .call(&Context::background(), "NoDot", &Args::default(), &mut reply)
        .unwrap_err();
    assert!(
        err.to_string().contains("service/method request ill-formed"),
        "got {}",
        err
    );
}

#[test]
fn method_error_reaches_the_caller_verbatim() {
    let addr = start_server();
    let client = Client::dial(&addr, &Opt::default()).unwrap();

    let mut reply = 0i64;
    let err = client
        .call(&Context::background(), "Foo.Boom", &Args::default(), &mut reply)
        .unwrap_err();
    assert_eq!(err.to_string(), "boom");
}

#[test]
fn server_handle_timeout_bounds_a_slow_method() {
    let addr = start_server();
    let opt = Opt {
        handle_timeout: Duration::from_millis(500),
        ..Default::default()
    };
    let client = Client::dial(&addr, &opt).unwrap();

    let start = Instant::now();
    let mut reply = 0i64;
    let err = client
        .call(
            &Context::background(),
            "Foo.Sleepy",
            &Args { num1: 1, num2: 1 },
            &mut reply,
        )
        .unwrap_err();
    assert!(
        err.to_string()
            .contains("request timeout: expect within 500ms"),
        "got {}",
        err
    );
    assert!(start.elapsed() < Duration::from_secs(1), "not bounded");
}

#[test]
fn client_context_deadline_bounds_a_slow_method() {
    let addr = start_server();
    let client = Client::dial(&addr, &Opt::default()).unwrap();

    let start = Instant::now();
    let mut reply = 0i64;
    let err = client
        .call(
            &Context::with_timeout(Duration::from_millis(200)),
            "Foo.Sleepy",
            &Args { num1: 1, num2: 1 },
            &mut reply,
        )
        .unwrap_err();
    assert!(
        err.to_string().contains("context deadline exceeded"),
        "got {}",
        err
    );
    assert!(start.elapsed() < Duration::from_secs(1), "not bounded");
}

#[test]
fn concurrent_calls_get_their_own_replies() {
    let addr = start_server();
    let client = Arc::new(Client::dial(&addr, &Opt::default()).unwrap());

    let mut handles = Vec::new();
    for i in 0..5i64 {
        let client = client.clone();
        handles.push(thread::spawn(move || {
            let args = Args { num1: i, num2: i * i };
            let mut reply = 0i64;
            client
                .call(&Context::background(), "Foo.Sum", &args, &mut reply)
                .unwrap();
            assert_eq!(reply, i + i * i);
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn async_go_delivers_on_the_done_channel() {
    let addr = start_server();
    let client = Client::dial(&addr, &Opt::default()).unwrap();

    let call = client.go("Foo.Sum", &Args { num1: 2, num2: 5 }, None);
    let rx = call.lock().unwrap().done_rx.take().unwrap();
    let completed = rx.recv_timeout(Duration::from_secs(2)).unwrap();

    let completed = completed.lock().unwrap();
    assert!(completed.error.is_none());
    let mut reply = 0i64;
    minirpc::Param::from_slice(
        &mut reply,
        minirpc::SerializeType::MsgPack,
        &completed.reply_data,
    )
    .unwrap();
    assert_eq!(reply, 7);
}

#[test]
fn magic_number_mismatch_closes_the_connection() {
    let addr = start_server();
    let mut conn = TcpStream::connect(&addr).unwrap();
    conn.write_all(b"{\"MagicNumber\":12345,\"CodecType\":\"application/msgpack\"}\n")
        .unwrap();

    conn.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = [0u8; 1];
    let n = conn.read(&mut buf).unwrap();
    assert_eq!(n, 0, "server kept the connection open");
}

#[test]
fn xclient_round_robin_calls() {
    let servers = vec![start_server(), start_server()];
    let xc = XClient::new(
        MultiServersDiscovery::new(servers),
        SelectMode::RoundRobin,
        Opt::default(),
    );

    for i in 0..4i64 {
        let args = Args { num1: i, num2: 10 };
        let mut reply = 0i64;
        xc.call(&Context::background(), "Foo.Sum", &args, &mut reply)
            .unwrap();
        assert_eq!(reply, i + 10);
    }
    xc.close();
}

#[test]
fn broadcast_records_exactly_one_reply_on_success() {
    let servers = vec![start_server(), start_server(), start_server()];
    let xc = XClient::new(
        MultiServersDiscovery::new(servers),
        SelectMode::Random,
        Opt::default(),
    );

    let mut reply = -1i64;
    xc.broadcast(
        &Context::background(),
        "Foo.Sum",
        &Args { num1: 4, num2: 5 },
        Some(&mut reply),
    )
    .unwrap();
    assert_eq!(reply, 9);
}

#[test]
fn broadcast_fails_fast_and_cancels_slow_peers() {
    fn start_worker(broken: bool) -> String {
        let mut svc = Service::new("Job").unwrap();
        svc.register_method("Run", move |args: Args, reply: &mut i64| {
            if broken {
                return Err(Error::Remote("boom".to_owned()));
            }
            thread::sleep(Duration::from_secs(2));
            *reply = args.num1 + args.num2;
            Ok(())
        })
        .unwrap();

        let server = Arc::new(Server::new());
        server.register(svc).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        thread::spawn(move || server.accept(listener));
        addr
    }

    // the middle peer errors immediately; the slow peers must be cancelled
    // before they can record a reply
    let servers = vec![start_worker(false), start_worker(true), start_worker(false)];
    let xc = XClient::new(
        MultiServersDiscovery::new(servers),
        SelectMode::Random,
        Opt::default(),
    );

    let start = Instant::now();
    let mut reply = 999i64;
    let err = xc
        .broadcast(
            &Context::background(),
            "Job.Run",
            &Args { num1: 1, num2: 2 },
            Some(&mut reply),
        )
        .unwrap_err();
    assert_eq!(err.to_string(), "boom");
    assert_eq!(reply, 999, "a cancelled peer wrote into the caller's slot");
    assert!(start.elapsed() < Duration::from_secs(1), "broadcast did not fail fast");
}

#[test]
fn http_connect_bridge_serves_rpc_and_debug() {
    let server = Arc::new(Server::new());
    server.register(sum_service()).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    {
        let server = server.clone();
        thread::spawn(move || server.serve_http(listener));
    }

    let client = Client::dial_http(&addr, &Opt::default()).unwrap();
    let mut reply = 0i64;
    client
        .call(
            &Context::background(),
            "Foo.Sum",
            &Args { num1: 6, num2: 7 },
            &mut reply,
        )
        .unwrap();
    assert_eq!(reply, 13);

    // the debug endpoint now reports that call
    let mut conn = TcpStream::connect(&addr).unwrap();
    conn.write_all(b"GET /debug/minirpc HTTP/1.0\r\n\r\n").unwrap();
    let mut page = String::new();
    conn.read_to_string(&mut page).unwrap();
    assert!(page.contains("Foo.Sum: 1 calls"), "got {}", page);

    // anything that is not CONNECT or the debug page is rejected
    let mut conn = TcpStream::connect(&addr).unwrap();
    conn.write_all(b"GET /elsewhere HTTP/1.0\r\n\r\n").unwrap();
    let mut response = String::new();
    conn.read_to_string(&mut response).unwrap();
    assert!(response.contains("405"), "got {}", response);
}

#[test]
fn xdial_routes_by_protocol_prefix() {
    let addr = start_server();
    let client = Client::xdial(&format!("tcp@{}", addr), &Opt::default()).unwrap();
    let mut reply = 0i64;
    client
        .call(
            &Context::background(),
            "Foo.Sum",
            &Args { num1: 1, num2: 1 },
            &mut reply,
        )
        .unwrap();
    assert_eq!(reply, 2);

    assert!(matches!(
        Client::xdial("carrier-pigeon@somewhere:1", &Opt::default()),
        Err(Error::BadAddress(_))
    ));
}
