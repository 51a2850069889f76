//! The combined request region of one join launch.
//!
//! ```text
//!  0                                param_len            + RESULT_HEADER_LEN
//! ┌──────────────────────────────┬────────────────────┬──────────────────────┐
//! │ ParamBuf                     │ result header      │ row map              │
//! │ length nparams poffset[]     │ nrels nrooms       │ nvalids rindex[]     │
//! │ inline parameter values      │ nitems errcode     │ (nvalids < 0: none)  │
//! │                              │ has_rechecks       │                      │
//! └──────────────────────────────┴────────────────────┴──────────────────────┘
//!  <────────────── send ──────────────────────────────>
//!                                 <───── recv ────────>
//! ```
//!
//! The results array itself is a separate buffer of `nrooms * nrels` i32
//! values; only the first `nitems * nrels` of it are read back.

use std::ops::Range;
use std::slice::ChunksExact;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

use crate::error::{ErrorCode, JoinError, LayoutError, Result};
use crate::layout::{read_i32, read_u32, stromalign, write_bytes, write_i32, write_u32};
use crate::varlena;

const KPARAM_LENGTH: usize = 0;
const KPARAM_NPARAMS: usize = 4;
const KPARAM_POFFSET: usize = 8;

const KRESULT_NRELS: usize = 0;
const KRESULT_NROOMS: usize = 4;
const KRESULT_NITEMS: usize = 8;
const KRESULT_ERRCODE: usize = 12;
const KRESULT_HAS_RECHECKS: usize = 16;
/// Fixed part of the result buffer, padded to the alignment quantum.
pub const RESULT_HEADER_LEN: usize = stromalign(20);

const KROWMAP_NVALIDS: usize = 0;
const KROWMAP_RINDEX: usize = 4;

/// Query parameters, each kept as a plain varlena so the device can size it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParamBuf {
    bytes: Vec<u8>,
    nparams: usize,
}

impl ParamBuf {
    pub fn new(params: &[Option<&[u8]>]) -> Self {
        let nparams = params.len();
        let mut bytes = vec![0u8; stromalign(KPARAM_POFFSET + size_of::<u32>() * nparams)];
        let mut poffsets = Vec::with_capacity(nparams);
        for param in params {
            match param {
                None => poffsets.push(0u32),
                Some(value) => {
                    poffsets.push(bytes.len() as u32);
                    bytes.extend_from_slice(&varlena::encode_long(value));
                    bytes.resize(stromalign(bytes.len()), 0);
                }
            }
        }
        let length = bytes.len() as u32;
        bytes[KPARAM_LENGTH..KPARAM_LENGTH + 4].copy_from_slice(&length.to_le_bytes());
        bytes[KPARAM_NPARAMS..KPARAM_NPARAMS + 4].copy_from_slice(&(nparams as u32).to_le_bytes());
        for (i, poff) in poffsets.into_iter().enumerate() {
            let at = KPARAM_POFFSET + size_of::<u32>() * i;
            bytes[at..at + 4].copy_from_slice(&poff.to_le_bytes());
        }
        Self { bytes, nparams }
    }

    #[inline(always)]
    pub fn nparams(&self) -> usize {
        self.nparams
    }

    #[inline(always)]
    pub fn length(&self) -> usize {
        self.bytes.len()
    }

    /// Value of parameter `index`; `None` for a NULL parameter.
    pub fn param(&self, index: usize) -> Result<Option<&[u8]>, LayoutError> {
        if index >= self.nparams {
            return Err(LayoutError::OutOfBounds {
                offset: index,
                len: 1,
                size: self.nparams,
            });
        }
        let poff = read_u32(&self.bytes, KPARAM_POFFSET + size_of::<u32>() * index)? as usize;
        if poff == 0 {
            return Ok(None);
        }
        let tail = self.bytes.get(poff..).unwrap_or_default();
        varlena::vardata_any(tail).map(Some)
    }

    #[inline(always)]
    pub fn encode(&self) -> &[u8] {
        &self.bytes
    }
}

/// Write-back header of a result buffer.
#[derive(Debug)]
pub struct ResultHeader {
    nrels: u32,
    nrooms: u32,
    nitems: AtomicU32,
    errcode: AtomicI32,
    has_rechecks: AtomicBool,
}

impl ResultHeader {
    #[inline(always)]
    pub fn nrels(&self) -> u32 {
        self.nrels
    }

    #[inline(always)]
    pub fn nrooms(&self) -> u32 {
        self.nrooms
    }

    /// Raw counter; may exceed `nrooms` after an overflow.
    #[inline(always)]
    pub(crate) fn nitems(&self) -> u32 {
        self.nitems.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn errcode(&self) -> ErrorCode {
        ErrorCode::from_code(self.errcode.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn errcode_cell(&self) -> &AtomicI32 {
        &self.errcode
    }

    #[inline(always)]
    pub fn has_rechecks(&self) -> bool {
        self.has_rechecks.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn mark_rechecks(&self) {
        self.has_rechecks.store(true, Ordering::Release);
    }

    /// Claim `total` combinations; returns the index of the first one.
    ///
    /// The counter moves even when the claim does not fit, so `nitems` may
    /// exceed `nrooms` after an overflow.
    #[inline(always)]
    pub fn reserve(&self, total: u32) -> u32 {
        self.nitems.fetch_add(total, Ordering::AcqRel)
    }

    /// Combination count, or the error the launch reported.
    pub fn status(&self) -> Result<u32> {
        let nitems = self.nitems.load(Ordering::Acquire);
        match self.errcode() {
            ErrorCode::DataStoreCorruption => Err(JoinError::Corruption(
                "join kernel reported a corrupted data store".into(),
            )),
            ErrorCode::DataStoreNoSpace => Err(JoinError::NoSpace {
                required: nitems as u64,
                capacity: self.nrooms as u64,
            }),
            _ if nitems > self.nrooms => Err(JoinError::NoSpace {
                required: nitems as u64,
                capacity: self.nrooms as u64,
            }),
            _ => Ok(nitems),
        }
    }

    pub fn encode_into(&self, buf: &mut [u8], offset: usize) -> Result<(), LayoutError> {
        write_u32(buf, offset + KRESULT_NRELS, self.nrels)?;
        write_u32(buf, offset + KRESULT_NROOMS, self.nrooms)?;
        write_u32(buf, offset + KRESULT_NITEMS, self.nitems.load(Ordering::Acquire))?;
        write_i32(buf, offset + KRESULT_ERRCODE, self.errcode.load(Ordering::Acquire))?;
        write_u32(buf, offset + KRESULT_HAS_RECHECKS, self.has_rechecks() as u32)
    }

    pub fn decode(bytes: &[u8], offset: usize) -> Result<Self, LayoutError> {
        Ok(Self {
            nrels: read_u32(bytes, offset + KRESULT_NRELS)?,
            nrooms: read_u32(bytes, offset + KRESULT_NROOMS)?,
            nitems: AtomicU32::new(read_u32(bytes, offset + KRESULT_NITEMS)?),
            errcode: AtomicI32::new(read_i32(bytes, offset + KRESULT_ERRCODE)?),
            has_rechecks: AtomicBool::new(read_u32(bytes, offset + KRESULT_HAS_RECHECKS)? != 0),
        })
    }
}

/// Row-reference combinations produced by the execution kernel.
///
/// Combination `i` occupies `results[i * nrels..(i + 1) * nrels]`: slot 0 is
/// `outer_index + 1` (negated when the row needs a host recheck), slot `d`
/// the entry offset inside the table at depth `d`.
#[derive(Debug)]
pub struct ResultBuffer {
    header: ResultHeader,
    results: Vec<i32>,
}

impl ResultBuffer {
    pub fn new(nrels: u32, nrooms: u32) -> Self {
        Self {
            header: ResultHeader {
                nrels,
                nrooms,
                nitems: AtomicU32::new(0),
                errcode: AtomicI32::new(ErrorCode::Success.code()),
                has_rechecks: AtomicBool::new(false),
            },
            results: vec![0; nrels as usize * nrooms as usize],
        }
    }

    #[inline(always)]
    pub fn header(&self) -> &ResultHeader {
        &self.header
    }

    #[inline(always)]
    pub fn nrels(&self) -> u32 {
        self.header.nrels
    }

    #[inline(always)]
    pub fn nrooms(&self) -> u32 {
        self.header.nrooms
    }

    #[inline(always)]
    pub fn errcode(&self) -> ErrorCode {
        self.header.errcode()
    }

    #[inline(always)]
    pub fn has_rechecks(&self) -> bool {
        self.header.has_rechecks()
    }

    #[inline(always)]
    pub fn reserve(&self, total: u32) -> u32 {
        self.header.reserve(total)
    }

    pub fn status(&self) -> Result<u32> {
        self.header.status()
    }

    /// Raw slots, including rooms past `nitems`.
    #[inline(always)]
    pub fn raw_results(&self) -> &[i32] {
        &self.results
    }

    /// The header for atomics and the results array for disjoint writes.
    pub fn split_mut(&mut self) -> (&ResultHeader, &mut [i32]) {
        (&self.header, &mut self.results)
    }

    /// Combinations of a successful launch.
    pub fn combinations(&self) -> Result<ChunksExact<'_, i32>> {
        let nitems = self.status()? as usize;
        let nrels = (self.header.nrels as usize).max(1);
        Ok(self.results[..nitems * nrels].chunks_exact(nrels))
    }

    /// Read a write-back header received from the device.
    pub fn decode_header(bytes: &[u8]) -> Result<ResultHeader, LayoutError> {
        ResultHeader::decode(bytes, 0)
    }
}

/// Dense list of live outer rows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowMap {
    rindex: Vec<u32>,
}

impl RowMap {
    pub fn new(rindex: Vec<u32>) -> Self {
        Self { rindex }
    }

    #[inline(always)]
    pub fn nvalids(&self) -> usize {
        self.rindex.len()
    }

    /// Outer row selected by worker `position`.
    #[inline(always)]
    pub fn index(&self, position: usize) -> Option<usize> {
        self.rindex.get(position).map(|&r| r as usize)
    }

    fn encoded_len(nvalids: Option<usize>) -> usize {
        stromalign(KROWMAP_RINDEX + size_of::<u32>() * nvalids.unwrap_or(0))
    }
}

/// Byte ranges of the encoded request moved between host and device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DmaLayout {
    /// Host to device before the launch: parameters and result header.
    pub send: Range<usize>,
    /// Device to host after the launch: the result header.
    pub recv: Range<usize>,
    /// Host to device on demand.
    pub rowmap: Range<usize>,
}

/// Parameters, result buffer and optional row map of one join launch.
#[derive(Debug)]
pub struct HashJoinRequest {
    params: ParamBuf,
    result: ResultBuffer,
    row_map: Option<RowMap>,
}

impl HashJoinRequest {
    pub fn new(params: ParamBuf, result: ResultBuffer, row_map: Option<RowMap>) -> Self {
        Self {
            params,
            result,
            row_map,
        }
    }

    #[inline(always)]
    pub fn params(&self) -> &ParamBuf {
        &self.params
    }

    #[inline(always)]
    pub fn result(&self) -> &ResultBuffer {
        &self.result
    }

    #[inline(always)]
    pub fn result_mut(&mut self) -> &mut ResultBuffer {
        &mut self.result
    }

    #[inline(always)]
    pub fn row_map(&self) -> Option<&RowMap> {
        self.row_map.as_ref()
    }

    /// Borrow every part at once; the result buffer mutably.
    pub fn parts_mut(&mut self) -> (&ParamBuf, &mut ResultBuffer, Option<&RowMap>) {
        (&self.params, &mut self.result, self.row_map.as_ref())
    }

    /// Replace the result buffer, e.g. with a larger one after no-space.
    pub fn replace_result(&mut self, result: ResultBuffer) -> ResultBuffer {
        std::mem::replace(&mut self.result, result)
    }

    pub fn dma_layout(&self) -> DmaLayout {
        let param_len = stromalign(self.params.length());
        let rowmap_off = param_len + RESULT_HEADER_LEN;
        let rowmap_len = RowMap::encoded_len(self.row_map.as_ref().map(RowMap::nvalids));
        DmaLayout {
            send: 0..rowmap_off,
            recv: param_len..rowmap_off,
            rowmap: rowmap_off..rowmap_off + rowmap_len,
        }
    }

    /// Serialize the whole request region.
    pub fn encode(&self) -> Result<Vec<u8>, LayoutError> {
        let dma = self.dma_layout();
        let mut buf = vec![0u8; dma.rowmap.end];
        write_bytes(&mut buf, 0, self.params.encode())?;
        self.result.header.encode_into(&mut buf, dma.recv.start)?;
        let base = dma.rowmap.start;
        match &self.row_map {
            None => write_i32(&mut buf, base + KROWMAP_NVALIDS, -1)?,
            Some(map) => {
                write_i32(&mut buf, base + KROWMAP_NVALIDS, map.nvalids() as i32)?;
                for (i, &r) in map.rindex.iter().enumerate() {
                    write_u32(&mut buf, base + KROWMAP_RINDEX + size_of::<u32>() * i, r)?;
                }
            }
        }
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_round_trip_with_nulls() {
        let p = ParamBuf::new(&[Some(&b"abc"[..]), None, Some(&7i64.to_le_bytes()[..])]);
        assert_eq!(p.nparams(), 3);
        assert_eq!(p.length() % 8, 0);
        assert_eq!(p.param(0), Ok(Some(&b"abc"[..])));
        assert_eq!(p.param(1), Ok(None));
        assert_eq!(p.param(2), Ok(Some(&7i64.to_le_bytes()[..])));
        assert!(p.param(3).is_err());
        assert_eq!(read_u32(p.encode(), KPARAM_LENGTH), Ok(p.length() as u32));
    }

    #[test]
    fn empty_params() {
        let p = ParamBuf::new(&[]);
        assert_eq!(p.length(), 8);
        assert_eq!(p.nparams(), 0);
    }

    #[test]
    fn status_reflects_errcode() {
        let rb = ResultBuffer::new(2, 4);
        assert_eq!(rb.status(), Ok(0));
        assert_eq!(rb.reserve(3), 0);
        assert_eq!(rb.status(), Ok(3));
        assert_eq!(rb.combinations().unwrap().count(), 3);

        assert_eq!(rb.reserve(2), 3);
        rb.header()
            .errcode_cell()
            .store(ErrorCode::DataStoreNoSpace.code(), Ordering::Release);
        assert_eq!(
            rb.status(),
            Err(JoinError::NoSpace {
                required: 5,
                capacity: 4
            })
        );
        assert!(rb.combinations().is_err());

        let bad = ResultBuffer::new(2, 4);
        bad.header()
            .errcode_cell()
            .store(ErrorCode::DataStoreCorruption.code(), Ordering::Release);
        assert!(matches!(bad.status(), Err(JoinError::Corruption(_))));
    }

    #[test]
    fn dma_ranges_without_row_map() {
        let params = ParamBuf::new(&[Some(&b"x"[..])]);
        let req = HashJoinRequest::new(params, ResultBuffer::new(3, 10), None);
        let dma = req.dma_layout();
        // 8 header + 4 poffset -> 16, then an 8-byte varlena
        assert_eq!(dma.send, 0..24 + RESULT_HEADER_LEN);
        assert_eq!(dma.recv, 24..24 + RESULT_HEADER_LEN);
        assert_eq!(dma.rowmap, 48..56);

        let bytes = req.encode().unwrap();
        assert_eq!(bytes.len(), 56);
        assert_eq!(read_i32(&bytes, dma.rowmap.start), Ok(-1));
        let header = ResultBuffer::decode_header(&bytes[dma.recv.clone()]).unwrap();
        assert_eq!(header.nrels(), 3);
        assert_eq!(header.nrooms(), 10);
        assert_eq!(header.status(), Ok(0));
    }

    #[test]
    fn row_map_encoding() {
        let map = RowMap::new(vec![4, 1, 9]);
        assert_eq!(map.nvalids(), 3);
        assert_eq!(map.index(2), Some(9));
        assert_eq!(map.index(3), None);

        let mut req = HashJoinRequest::new(ParamBuf::new(&[]), ResultBuffer::new(2, 1), Some(map));
        req.result().reserve(1);
        req.result().header().mark_rechecks();
        let dma = req.dma_layout();
        assert_eq!(dma.rowmap.len(), 16);
        let bytes = req.encode().unwrap();
        assert_eq!(read_i32(&bytes, dma.rowmap.start), Ok(3));
        assert_eq!(read_u32(&bytes, dma.rowmap.start + 12), Ok(9));
        let header = ResultBuffer::decode_header(&bytes[dma.recv]).unwrap();
        assert_eq!(header.status(), Ok(1));
        assert!(header.has_rechecks());

        let old = req.replace_result(ResultBuffer::new(2, 8));
        assert_eq!(old.nrooms(), 1);
        assert_eq!(req.result_mut().nrooms(), 8);
    }
}
