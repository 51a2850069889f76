//! Alignment rules and bounds-checked access to relocatable byte regions.
//!
//! Every structure shared between host and device lives in a plain byte
//! buffer and refers to other structures by byte offset, never by address,
//! so a region stays valid after it is copied to another address space.
//! All multi-byte fields are little-endian.

use std::marker::PhantomData;
use std::ops::Range;

use crate::error::LayoutError;

/// Alignment quantum of every structure and offset in the layout.
pub const STROMALIGN_LEN: usize = 8;
/// Largest alignment an attribute may request.
pub const MAXIMUM_ALIGNOF: usize = 8;

#[inline(always)]
pub const fn typealign(align: usize, len: usize) -> usize {
    (len + align - 1) & !(align - 1)
}

#[inline(always)]
pub const fn stromalign(len: usize) -> usize {
    typealign(STROMALIGN_LEN, len)
}

#[inline(always)]
pub const fn maxalign(len: usize) -> usize {
    typealign(MAXIMUM_ALIGNOF, len)
}

/// Validate `offset..offset + len` against a region of `size` bytes.
#[inline(always)]
pub fn checked_range(size: usize, offset: usize, len: usize) -> Result<Range<usize>, LayoutError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(offset..end),
        _ => Err(LayoutError::OutOfBounds { offset, len, size }),
    }
}

#[inline(always)]
pub fn bytes_at(bytes: &[u8], offset: usize, len: usize) -> Result<&[u8], LayoutError> {
    Ok(&bytes[checked_range(bytes.len(), offset, len)?])
}

#[inline(always)]
fn array_at<const N: usize>(bytes: &[u8], offset: usize) -> Result<[u8; N], LayoutError> {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes_at(bytes, offset, N)?);
    Ok(out)
}

#[inline(always)]
pub fn read_u8(bytes: &[u8], offset: usize) -> Result<u8, LayoutError> {
    bytes
        .get(offset)
        .copied()
        .ok_or(LayoutError::OutOfBounds {
            offset,
            len: 1,
            size: bytes.len(),
        })
}

#[inline(always)]
pub fn read_u16(bytes: &[u8], offset: usize) -> Result<u16, LayoutError> {
    array_at(bytes, offset).map(u16::from_le_bytes)
}

#[inline(always)]
pub fn read_i16(bytes: &[u8], offset: usize) -> Result<i16, LayoutError> {
    array_at(bytes, offset).map(i16::from_le_bytes)
}

#[inline(always)]
pub fn read_u32(bytes: &[u8], offset: usize) -> Result<u32, LayoutError> {
    array_at(bytes, offset).map(u32::from_le_bytes)
}

#[inline(always)]
pub fn read_i32(bytes: &[u8], offset: usize) -> Result<i32, LayoutError> {
    array_at(bytes, offset).map(i32::from_le_bytes)
}

#[inline(always)]
pub fn read_u64(bytes: &[u8], offset: usize) -> Result<u64, LayoutError> {
    array_at(bytes, offset).map(u64::from_le_bytes)
}

#[inline(always)]
pub fn write_bytes(buf: &mut [u8], offset: usize, src: &[u8]) -> Result<(), LayoutError> {
    let range = checked_range(buf.len(), offset, src.len())?;
    buf[range].copy_from_slice(src);
    Ok(())
}

#[inline(always)]
pub fn write_u8(buf: &mut [u8], offset: usize, value: u8) -> Result<(), LayoutError> {
    write_bytes(buf, offset, &[value])
}

#[inline(always)]
pub fn write_u16(buf: &mut [u8], offset: usize, value: u16) -> Result<(), LayoutError> {
    write_bytes(buf, offset, &value.to_le_bytes())
}

#[inline(always)]
pub fn write_i16(buf: &mut [u8], offset: usize, value: i16) -> Result<(), LayoutError> {
    write_bytes(buf, offset, &value.to_le_bytes())
}

#[inline(always)]
pub fn write_u32(buf: &mut [u8], offset: usize, value: u32) -> Result<(), LayoutError> {
    write_bytes(buf, offset, &value.to_le_bytes())
}

#[inline(always)]
pub fn write_i32(buf: &mut [u8], offset: usize, value: i32) -> Result<(), LayoutError> {
    write_bytes(buf, offset, &value.to_le_bytes())
}

#[inline(always)]
pub fn write_u64(buf: &mut [u8], offset: usize, value: u64) -> Result<(), LayoutError> {
    write_bytes(buf, offset, &value.to_le_bytes())
}

/// A mutable slice shared by every work-group of one kernel launch.
///
/// Groups reserve disjoint ranges through an atomic counter and then write
/// only inside their reservation, so no two threads ever touch the same
/// element. The slice borrows the underlying buffer mutably for `'a`, which
/// keeps the host from reading it while the launch is in flight.
pub struct SharedSlice<'a, T> {
    ptr: *mut T,
    len: usize,
    _marker: PhantomData<&'a mut [T]>,
}

// Safety: callers of `slice_mut`/`write` must ensure threads write to
// disjoint ranges.
unsafe impl<T: Send> Send for SharedSlice<'_, T> {}
unsafe impl<T: Send> Sync for SharedSlice<'_, T> {}

impl<'a, T> SharedSlice<'a, T> {
    pub fn new(slice: &'a mut [T]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
            _marker: PhantomData,
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Borrow `start..start + len` mutably.
    ///
    /// # Safety
    ///
    /// No other live borrow obtained from this `SharedSlice` may overlap the
    /// requested range.
    #[inline(always)]
    pub unsafe fn slice_mut(&self, start: usize, len: usize) -> Result<&'a mut [T], LayoutError> {
        checked_range(self.len, start, len)?;
        // SAFETY: bounds checked above, exclusivity guaranteed by the caller.
        unsafe { Ok(std::slice::from_raw_parts_mut(self.ptr.add(start), len)) }
    }

    /// Store `value` at `index`.
    ///
    /// # Safety
    ///
    /// No other thread may access `index` concurrently.
    #[inline(always)]
    pub unsafe fn write(&self, index: usize, value: T) -> Result<(), LayoutError> {
        checked_range(self.len, index, 1)?;
        // SAFETY: bounds checked above, exclusivity guaranteed by the caller.
        unsafe {
            *self.ptr.add(index) = value;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn alignment_helpers() {
        assert_eq!(typealign(4, 0), 0);
        assert_eq!(typealign(4, 1), 4);
        assert_eq!(typealign(2, 3), 4);
        assert_eq!(typealign(1, 7), 7);
        assert_eq!(stromalign(17), 24);
        assert_eq!(maxalign(24), 24);
    }

    #[test]
    fn reads_are_bounds_checked() {
        let buf = [1u8, 0, 0, 0, 2, 0];
        assert_eq!(read_u32(&buf, 0), Ok(1));
        assert_eq!(read_u16(&buf, 4), Ok(2));
        assert_eq!(
            read_u32(&buf, 4),
            Err(LayoutError::OutOfBounds {
                offset: 4,
                len: 4,
                size: 6
            })
        );
        assert!(read_u64(&buf, usize::MAX).is_err());
        assert!(read_u8(&buf, 6).is_err());
    }

    #[test]
    fn writes_are_bounds_checked() {
        let mut buf = [0u8; 8];
        write_u64(&mut buf, 0, 0x0102_0304_0506_0708).unwrap();
        assert_eq!(read_u64(&buf, 0), Ok(0x0102_0304_0506_0708));
        write_i16(&mut buf, 6, -2).unwrap();
        assert_eq!(read_i16(&buf, 6), Ok(-2));
        assert!(write_u32(&mut buf, 6, 1).is_err());
    }

    #[test]
    fn shared_slice_disjoint_writers() {
        let mut data = vec![0u32; 64];
        {
            let shared = SharedSlice::new(&mut data);
            thread::scope(|s| {
                for t in 0..4 {
                    let shared = &shared;
                    s.spawn(move || {
                        let part = unsafe { shared.slice_mut(t * 16, 16).unwrap() };
                        for (i, v) in part.iter_mut().enumerate() {
                            *v = (t * 16 + i) as u32;
                        }
                    });
                }
            });
        }
        assert_eq!(data, (0..64).collect::<Vec<u32>>());
    }

    #[test]
    fn shared_slice_rejects_out_of_range() {
        let mut data = vec![0u8; 4];
        let shared = SharedSlice::new(&mut data);
        assert!(unsafe { shared.slice_mut(2, 3) }.is_err());
        assert!(unsafe { shared.write(4, 1) }.is_err());
        assert!(unsafe { shared.write(3, 1) }.is_ok());
    }
}
