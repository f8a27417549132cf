//! Common request and reply headers carried by the shared wire RPC.

use std::fmt;

use bitvec::{field::BitField, prelude as bv};
use paste::paste;

use crate::transport::{HgError, HgResult};
use crate::type_alias::*;

macro_rules! impl_accessor {
    ($field:ident, $field_ty:ty, $integral_ty:ty, $lsb:expr, $msb:expr, $setter:tt, $getter:tt) => {
        #[inline(always)]
        pub fn $setter(&mut self, val: $field_ty) {
            self.bits[$lsb..=$msb].store_le::<$integral_ty>(val as $integral_ty);
        }

        #[inline(always)]
        pub fn $getter(&self) -> $field_ty {
            self.bits[$lsb..=$msb].load_le::<$integral_ty>().into()
        }
    };

    ($field:ident, $field_ty:ty, $lsb:expr, $msb:expr) => {
        paste! {
            impl_accessor!(
                $field,
                $field_ty,
                $field_ty,
                $lsb,
                $msb,
                [< set_ $field >],
                $field
            );
        }
    };
}

const REQUEST_MAGIC: u8 = 0xc5;
const REPLY_MAGIC: u8 = 0x5c;

/// Size of [`RequestHeader`] on the wire.
pub const REQUEST_HEADER_SIZE: usize = 16;

/// Size of [`ReplyHeader`] on the wire.
pub const REPLY_HEADER_SIZE: usize = 8;

/// Common request header, 16-bytes.
///
/// # Layout
///
/// | Lsb | Msb |     Name     |
/// | --: | --: | ------------ |
/// |   0 |   7 | magic        |
/// |   8 |  15 | (reserved)   |
/// |  16 |  31 | grp_id       |
/// |  32 |  63 | opc          |
/// |  64 |  95 | src_rank     |
/// |  96 | 127 | body_len     |
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct RequestHeader {
    bits: bv::BitArr!(for REQUEST_HEADER_SIZE * 8, in u8, bv::Lsb0),
}

impl RequestHeader {
    impl_accessor!(magic, u8, 0, 7);
    impl_accessor!(grp_id, GroupId, 16, 31);
    impl_accessor!(opc, Opcode, 32, 63);
    impl_accessor!(src_rank, Rank, 64, 95);
    impl_accessor!(body_len, u32, 96, 127);

    pub fn new(grp_id: GroupId, opc: Opcode, src_rank: Rank, body_len: u32) -> Self {
        let mut this = Self {
            bits: bv::BitArray::ZERO,
        };
        this.set_magic(REQUEST_MAGIC);
        this.set_grp_id(grp_id);
        this.set_opc(opc);
        this.set_src_rank(src_rank);
        this.set_body_len(body_len);
        this
    }

    #[inline]
    fn as_bytes(&self) -> &[u8] {
        self.bits.as_raw_slice()
    }
}

impl fmt::Debug for RequestHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHeader")
            .field("grp_id", &self.grp_id())
            .field("opc", &self.opc())
            .field("src_rank", &self.src_rank())
            .field("body_len", &self.body_len())
            .finish()
    }
}

/// Common reply header, 8-bytes.
///
/// # Layout
///
/// | Lsb | Msb |     Name     |
/// | --: | --: | ------------ |
/// |   0 |   7 | magic        |
/// |   8 |  31 | (reserved)   |
/// |  32 |  63 | body_len     |
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct ReplyHeader {
    bits: bv::BitArr!(for REPLY_HEADER_SIZE * 8, in u8, bv::Lsb0),
}

impl ReplyHeader {
    impl_accessor!(magic, u8, 0, 7);
    impl_accessor!(body_len, u32, 32, 63);

    pub fn new(body_len: u32) -> Self {
        let mut this = Self {
            bits: bv::BitArray::ZERO,
        };
        this.set_magic(REPLY_MAGIC);
        this.set_body_len(body_len);
        this
    }

    #[inline]
    fn as_bytes(&self) -> &[u8] {
        self.bits.as_raw_slice()
    }
}

impl fmt::Debug for ReplyHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyHeader")
            .field("body_len", &self.body_len())
            .finish()
    }
}

/// Prepend a request header to `body`.
pub(crate) fn pack_request(grp_id: GroupId, opc: Opcode, src_rank: Rank, body: &[u8]) -> Vec<u8> {
    let hdr = RequestHeader::new(grp_id, opc, src_rank, body.len() as u32);
    let mut raw = Vec::with_capacity(REQUEST_HEADER_SIZE + body.len());
    raw.extend_from_slice(hdr.as_bytes());
    raw.extend_from_slice(body);
    raw
}

/// Split a raw request into its header and body.
pub(crate) fn unpack_request(raw: &[u8]) -> HgResult<(RequestHeader, &[u8])> {
    if raw.len() < REQUEST_HEADER_SIZE {
        return Err(HgError::Protocol);
    }
    let (head, body) = raw.split_at(REQUEST_HEADER_SIZE);
    let mut bytes = [0u8; REQUEST_HEADER_SIZE];
    bytes.copy_from_slice(head);
    let hdr = RequestHeader {
        bits: bv::BitArray::new(bytes),
    };
    if hdr.magic() != REQUEST_MAGIC || hdr.body_len() as usize != body.len() {
        return Err(HgError::Protocol);
    }
    Ok((hdr, body))
}

/// Prepend a reply header to `body`.
pub(crate) fn pack_reply(body: &[u8]) -> Vec<u8> {
    let hdr = ReplyHeader::new(body.len() as u32);
    let mut raw = Vec::with_capacity(REPLY_HEADER_SIZE + body.len());
    raw.extend_from_slice(hdr.as_bytes());
    raw.extend_from_slice(body);
    raw
}

/// Strip the reply header from a raw reply.
pub(crate) fn unpack_reply(raw: &[u8]) -> HgResult<&[u8]> {
    if raw.len() < REPLY_HEADER_SIZE {
        return Err(HgError::Protocol);
    }
    let (head, body) = raw.split_at(REPLY_HEADER_SIZE);
    let mut bytes = [0u8; REPLY_HEADER_SIZE];
    bytes.copy_from_slice(head);
    let hdr = ReplyHeader {
        bits: bv::BitArray::new(bytes),
    };
    if hdr.magic() != REPLY_MAGIC || hdr.body_len() as usize != body.len() {
        return Err(HgError::Protocol);
    }
    Ok(body)
}

/// Input check registered with the shared wire RPC.
pub(crate) fn proc_in_common(raw: &[u8]) -> HgResult<()> {
    unpack_request(raw).map(|_| ())
}

/// Output check registered with the shared wire RPC.
pub(crate) fn proc_out_common(raw: &[u8]) -> HgResult<()> {
    unpack_reply(raw).map(|_| ())
}
