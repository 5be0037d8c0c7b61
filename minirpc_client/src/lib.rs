pub mod client;
pub mod context;
pub mod discovery;
pub mod xclient;

pub use client::{done_channel, ArcCall, Call, Client};
pub use context::{CancelHandle, Context};
pub use discovery::{
    Discovery, MultiServersDiscovery, RegistryDiscovery, SelectMode, DEFAULT_UPDATE_TIMEOUT,
    SERVERS_HEADER,
};
pub use xclient::XClient;
