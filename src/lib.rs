//! minirpc: a compact RPC framework. A server exposes methods of
//! registered services over a stream connection; clients issue
//! synchronous and asynchronous calls with timeouts, with optional
//! load balancing and broadcast over a discovery source.

pub use minirpc_protocol::{
    empty_body, lookup_codec, read_opt, register_codec, write_opt, Codec, Error, Header,
    JsonCodec, MsgpackCodec, NewCodecFn, Opt, Param, Result, SerializeType, CONNECTED,
    DEFAULT_DEBUG_PATH, DEFAULT_RPC_PATH, JSON_CODEC, MAGIC_NUMBER, MAX_BODY_SIZE, MSGPACK_CODEC,
};

pub use minirpc_client::{
    done_channel, ArcCall, Call, CancelHandle, Client, Context, Discovery, MultiServersDiscovery,
    RegistryDiscovery, SelectMode, XClient, DEFAULT_UPDATE_TIMEOUT, SERVERS_HEADER,
};

pub use minirpc_server::{MethodFn, MethodType, Server, Service};

pub use minirpc_registry as registry;
