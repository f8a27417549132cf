//! In-process network abstraction (NA) and generic RPC (HG) substrate.
//!
//! Every network class lives on a [`Fabric`], a namespace that routes
//! messages between classes by their string address. The substrate offers the
//! primitives the RPC core is built on: classes, contexts with completion
//! queues, handles with forward/respond/cancel, trigger/progress, address
//! lookup and bulk handles. Its message layout is private to this module.

mod bulk;
mod hg;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use ahash::RandomState;
use crossbeam::channel::Sender;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;

pub use self::bulk::*;
pub use self::hg::*;

/// Substrate return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HgError {
    #[error("operation timed out")]
    Timeout,

    #[error("operation canceled")]
    Canceled,

    #[error("no matching entry")]
    NoMatch,

    #[error("out of memory")]
    NoMem,

    #[error("invalid argument")]
    InvalidArg,

    #[error("permission denied")]
    Permission,

    #[error("protocol error")]
    Protocol,

    #[error("address already in use")]
    AddrInUse,

    #[error("destination unreachable")]
    Unreachable,

    #[error("resource busy")]
    Busy,

    #[error("no such entry")]
    NoEntry,

    /// Generic failure, also used for failed remote handlers.
    #[error("other error")]
    Other,
}

/// Substrate result type.
pub type HgResult<T> = Result<T, HgError>;

/// Identifier of an asynchronous substrate operation (lookup, bulk transfer).
pub type OpId = u64;

static NEXT_FABRIC_ID: AtomicU32 = AtomicU32::new(1);
static NEXT_OP_ID: AtomicU64 = AtomicU64::new(1);

#[inline]
pub(crate) fn next_op_id() -> OpId {
    NEXT_OP_ID.fetch_add(1, Ordering::Relaxed)
}

/// A message delivered to an HG context.
pub(crate) enum Event {
    /// Inbound request.
    Request {
        src: NaAddr,
        origin: HandleId,
        rpc_id: RpcId,
        payload: Vec<u8>,
    },

    /// Response to a forwarded handle.
    Response {
        handle: HandleId,
        ret: HgResult<()>,
        payload: Vec<u8>,
    },

    /// Local work was posted; wakes a blocked progress call.
    Wake,
}

/// Per-class state visible to peers on the fabric.
pub(crate) struct Endpoint {
    /// Address of the class.
    uri: Arc<str>,

    /// Whether the class accepts lookups.
    listening: bool,

    /// HG contexts of this class, by target ID.
    targets: DashMap<u32, Sender<Event>, RandomState>,

    /// Exported bulk handles.
    bulks: DashMap<u64, Weak<BulkInner>, RandomState>,
}

/// A simulated network connecting every network class created on it.
///
/// Classes are addressed by strings of the form `proto://host`. A class
/// created without a host part gets a unique one assigned by the fabric.
pub struct Fabric {
    id: u32,
    endpoints: DashMap<Arc<str>, Arc<Endpoint>, RandomState>,
    next_port: AtomicU32,
}

impl Fabric {
    /// Create a new, empty fabric.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_FABRIC_ID.fetch_add(1, Ordering::Relaxed),
            endpoints: DashMap::with_hasher(RandomState::new()),
            next_port: AtomicU32::new(1),
        })
    }

    /// Number of live network classes on this fabric.
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    /// Find the endpoint bound to the given address.
    pub(crate) fn endpoint(&self, uri: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.get(uri).map(|ep| ep.value().clone())
    }

    /// Deliver an event to the context `addr` points to.
    pub(crate) fn deliver(&self, addr: &NaAddr, event: Event) -> HgResult<()> {
        let ep = self.endpoint(&addr.uri).ok_or(HgError::Unreachable)?;
        let tx = ep
            .targets
            .get(&addr.target)
            .map(|tx| tx.value().clone())
            .ok_or(HgError::Unreachable)?;
        tx.send(event).map_err(|_| HgError::Unreachable)
    }
}

/// Resolved address of an HG context.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct NaAddr {
    uri: Arc<str>,
    target: u32,
}

impl NaAddr {
    /// Return the address string of the network class.
    #[inline]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Return the target context ID within the class.
    #[inline]
    pub fn target_id(&self) -> u32 {
        self.target
    }

    /// Return the same class address pointing at another context.
    #[inline]
    pub fn with_target(&self, target: u32) -> Self {
        Self {
            uri: self.uri.clone(),
            target,
        }
    }
}

impl fmt::Debug for NaAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.uri, self.target)
    }
}

impl fmt::Display for NaAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A network class: one bound address on a fabric.
pub struct NaClass {
    fabric: Arc<Fabric>,
    endpoint: Arc<Endpoint>,
    finalized: AtomicBool,
}

impl NaClass {
    /// Initialize a network class from an info string.
    ///
    /// `"proto://"` asks the fabric for a fresh address, `"proto://host"`
    /// binds exactly that address. With `listen == false` the class can still
    /// send, receive responses and expose bulk handles, but lookups of its
    /// address never complete.
    pub fn initialize(fabric: &Arc<Fabric>, info: &str, listen: bool) -> HgResult<Arc<Self>> {
        let (proto, host) = info.split_once("://").ok_or(HgError::InvalidArg)?;
        if proto.is_empty() {
            return Err(HgError::InvalidArg);
        }

        let uri: Arc<str> = if host.is_empty() {
            let port = fabric.next_port.fetch_add(1, Ordering::Relaxed);
            format!("{}://fabric{}:{}", proto, fabric.id, port).into()
        } else {
            info.into()
        };

        let endpoint = Arc::new(Endpoint {
            uri: uri.clone(),
            listening: listen,
            targets: DashMap::with_hasher(RandomState::new()),
            bulks: DashMap::with_hasher(RandomState::new()),
        });
        match fabric.endpoints.entry(uri) {
            Entry::Occupied(_) => return Err(HgError::AddrInUse),
            Entry::Vacant(v) => {
                v.insert(endpoint.clone());
            }
        }

        Ok(Arc::new(Self {
            fabric: fabric.clone(),
            endpoint,
            finalized: AtomicBool::new(false),
        }))
    }

    /// Return the address of this class (target 0).
    #[inline]
    pub fn addr_self(&self) -> NaAddr {
        NaAddr {
            uri: self.endpoint.uri.clone(),
            target: 0,
        }
    }

    /// Format an address as a string that can be looked up.
    #[inline]
    pub fn addr_to_string(&self, addr: &NaAddr) -> String {
        addr.uri.to_string()
    }

    /// Return the fabric this class lives on.
    #[inline]
    pub fn fabric(&self) -> &Arc<Fabric> {
        &self.fabric
    }

    #[inline]
    pub(crate) fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// Return `true` once [`NaClass::finalize`] succeeded.
    #[inline]
    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    /// Unbind this class from the fabric.
    ///
    /// Fails with [`HgError::InvalidArg`] if already finalized.
    pub fn finalize(&self) -> HgResult<()> {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return Err(HgError::InvalidArg);
        }
        self.fabric.endpoints.remove(&self.endpoint.uri);
        Ok(())
    }
}

impl Drop for NaClass {
    fn drop(&mut self) {
        if !self.is_finalized() {
            log::debug!("NA class {} dropped without finalize", self.endpoint.uri);
            self.fabric.endpoints.remove(&self.endpoint.uri);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_and_finalize() {
        let fabric = Fabric::new();
        let a = NaClass::initialize(&fabric, "ofi+tcp://", true).unwrap();
        let b = NaClass::initialize(&fabric, "ofi+tcp://", true).unwrap();
        assert_ne!(a.addr_self(), b.addr_self());
        assert_eq!(fabric.endpoint_count(), 2);

        a.finalize().unwrap();
        assert_eq!(a.finalize(), Err(HgError::InvalidArg));
        assert_eq!(fabric.endpoint_count(), 1);
    }

    #[test]
    fn explicit_address() {
        let fabric = Fabric::new();
        let a = NaClass::initialize(&fabric, "ofi+tcp://node0:7000", true).unwrap();
        assert_eq!(a.addr_to_string(&a.addr_self()), "ofi+tcp://node0:7000");
        assert_eq!(
            NaClass::initialize(&fabric, "ofi+tcp://node0:7000", true).err(),
            Some(HgError::AddrInUse)
        );
        assert_eq!(
            NaClass::initialize(&fabric, "garbage", true).err(),
            Some(HgError::InvalidArg)
        );
    }
}
