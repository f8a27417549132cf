//! Application opcode registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use ahash::RandomState;

use crate::error::{Error, Result};
use crate::handler::RpcHandler;
use crate::request::Request;
use crate::type_alias::*;

/// Largest input body an opcode may declare.
pub const MAX_INPUT_SIZE: usize = 64 << 10;

/// Largest output body an opcode may declare.
pub const MAX_OUTPUT_SIZE: usize = 64 << 10;

/// Declared body sizes of an opcode, in serialized bytes.
///
/// A size of zero means the opcode carries no body in that direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RpcFormat {
    pub input_size: usize,
    pub output_size: usize,
}

impl RpcFormat {
    pub const fn new(input_size: usize, output_size: usize) -> Self {
        Self {
            input_size,
            output_size,
        }
    }
}

/// Registry entry of one opcode.
pub struct OpcInfo {
    opc: Opcode,
    format: RpcFormat,
    handler: Option<Arc<dyn RpcHandler>>,
}

impl OpcInfo {
    #[inline]
    pub fn opc(&self) -> Opcode {
        self.opc
    }

    #[inline]
    pub fn format(&self) -> RpcFormat {
        self.format
    }

    /// Return the handler, or `None` for client-only opcodes.
    #[inline]
    pub fn handler(&self) -> Option<&Arc<dyn RpcHandler>> {
        self.handler.as_ref()
    }
}

impl fmt::Debug for OpcInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpcInfo")
            .field("opc", &format_args!("{:#x}", self.opc))
            .field("format", &self.format)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

/// Immutable map from opcode to its registry entry.
///
/// Built once with [`OpcodeMap::builder`] and shared by every context.
#[derive(Default)]
pub struct OpcodeMap {
    map: HashMap<Opcode, Arc<OpcInfo>, RandomState>,
}

impl OpcodeMap {
    pub fn builder() -> OpcodeMapBuilder {
        OpcodeMapBuilder {
            map: HashMap::with_hasher(RandomState::new()),
        }
    }

    /// Find the entry of an opcode.
    #[inline]
    pub fn lookup(&self, opc: Opcode) -> Option<&Arc<OpcInfo>> {
        self.map.get(&opc)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Builder of an [`OpcodeMap`].
pub struct OpcodeMapBuilder {
    map: HashMap<Opcode, Arc<OpcInfo>, RandomState>,
}

impl OpcodeMapBuilder {
    /// Register an opcode served by a closure.
    pub fn register<F>(self, opc: Opcode, format: RpcFormat, handler: F) -> Result<Self>
    where
        F: Fn(&Request) -> Result<()> + Send + Sync + 'static,
    {
        self.insert(opc, format, Some(Arc::new(handler)))
    }

    /// Register an opcode served by a handler object.
    pub fn register_handler(
        self,
        opc: Opcode,
        format: RpcFormat,
        handler: impl RpcHandler + 'static,
    ) -> Result<Self> {
        self.insert(opc, format, Some(Arc::new(handler)))
    }

    /// Register an opcode this process only sends.
    pub fn register_client(self, opc: Opcode, format: RpcFormat) -> Result<Self> {
        self.insert(opc, format, None)
    }

    fn insert(
        mut self,
        opc: Opcode,
        format: RpcFormat,
        handler: Option<Arc<dyn RpcHandler>>,
    ) -> Result<Self> {
        if format.input_size > MAX_INPUT_SIZE || format.output_size > MAX_OUTPUT_SIZE {
            return Err(Error::inval(format!(
                "opcode {:#x}: declared sizes {:?} exceed the maximum",
                opc, format
            )));
        }
        if self.map.contains_key(&opc) {
            return Err(Error::inval(format!("opcode {:#x} registered twice", opc)));
        }
        self.map.insert(
            opc,
            Arc::new(OpcInfo {
                opc,
                format,
                handler,
            }),
        );
        Ok(self)
    }

    pub fn build(self) -> OpcodeMap {
        OpcodeMap { map: self.map }
    }
}
