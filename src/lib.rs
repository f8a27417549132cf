//! An asynchronous, reference-counted RPC core for storage fabrics.
//!
//! A [`Nexus`] owns the process-wide transport class; [`Context`]s are the
//! progress domains all asynchronous work completes in. Every application
//! opcode travels over one shared wire RPC, with the opcode carried in a
//! common request header. Large payloads move through [`bulk`] handles.

pub mod bulk;
mod config;
mod context;
mod error;
mod group;
mod handler;
mod nexus;
mod opcode;
mod pool;
mod proc;
mod request;
pub mod transport;
pub mod type_alias;
mod util;

pub use self::config::{NexusConfig, TransportKind};
pub use self::context::Context;
pub use self::error::{Error, Result};
pub use self::group::{AddressResolver, Endpoint, StaticGroup};
pub use self::handler::RpcHandler;
pub use self::nexus::{Nexus, COMMON_RPC_ID};
pub use self::opcode::{
    OpcInfo, OpcodeMap, OpcodeMapBuilder, RpcFormat, MAX_INPUT_SIZE, MAX_OUTPUT_SIZE,
};
pub use self::pool::{thread_pool, Job, WorkerPool};
pub use self::request::{CbInfo, CompletionCb, ReplyFuture, Request, Role, RpcState};
pub use self::transport::Fabric;

#[cfg(test)]
mod tests;
