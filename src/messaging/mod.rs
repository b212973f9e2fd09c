// src/messaging/mod.rs
// Message bus, topic helpers and the remote messaging transport

pub mod bus;
pub mod remote;
pub mod topic;

pub use bus::{
    InterceptedMessage, InterceptorToken, MessageBus, MessageCallback, MessageInterceptor, callback,
    interceptor,
};
pub use remote::{ConnectionState, RemoteMessagingClient};
pub use topic::REMOTE_PREFIX;
