//! Fixed-capacity write cursor and read cursor for wire data.

use crate::error::{Error, Result};

/// A fixed-capacity byte region with an explicit append position.
///
/// Fields whose value is only known later (sizes, CRCs) are reserved with
/// [`reserve_i32`](Self::reserve_i32) / [`reserve`](Self::reserve) and
/// filled in afterwards with [`patch_i32`](Self::patch_i32). The region is
/// allocated once and reused for every request.
#[derive(Debug)]
pub struct WireBuf {
    buf: Vec<u8>,
    pos: usize,
}

impl WireBuf {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            pos: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Reset the append position. The region keeps its contents.
    pub fn clear(&mut self) {
        self.pos = 0;
    }

    /// The written prefix.
    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.pos]
    }

    pub fn slice(&self, from: usize, to: usize) -> &[u8] {
        &self.buf[from..to]
    }

    /// The unwritten suffix, for codecs that write into the region
    /// directly. Pair with [`advance`](Self::advance).
    pub fn tail_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.pos..]
    }

    /// Mark `n` bytes of the tail as written.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.remaining());
        self.pos += n;
    }

    /// Skip `n` bytes to be patched later; returns their start position.
    pub fn reserve(&mut self, n: usize) -> Result<usize> {
        if self.remaining() < n {
            return Err(Error::SendBufferOverflow);
        }
        let at = self.pos;
        self.pos += n;
        Ok(at)
    }

    pub fn reserve_i32(&mut self) -> Result<usize> {
        self.reserve(4)
    }

    pub fn put_i8(&mut self, v: i8) -> Result<()> {
        self.put_slice(&v.to_be_bytes())
    }

    pub fn put_i16(&mut self, v: i16) -> Result<()> {
        self.put_slice(&v.to_be_bytes())
    }

    pub fn put_i32(&mut self, v: i32) -> Result<()> {
        self.put_slice(&v.to_be_bytes())
    }

    pub fn put_i64(&mut self, v: i64) -> Result<()> {
        self.put_slice(&v.to_be_bytes())
    }

    pub fn put_slice(&mut self, src: &[u8]) -> Result<()> {
        if self.remaining() < src.len() {
            return Err(Error::SendBufferOverflow);
        }
        self.buf[self.pos..self.pos + src.len()].copy_from_slice(src);
        self.pos += src.len();
        Ok(())
    }

    /// Overwrite the four bytes at `at` without moving the position.
    pub fn patch_i32(&mut self, at: usize, v: i32) {
        self.buf[at..at + 4].copy_from_slice(&v.to_be_bytes());
    }
}

/// Read cursor over a received frame.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::MalformedResponse(format!(
                "need {} more bytes at offset {}, have {}",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_i8(&mut self) -> Result<i8> {
        let b = self.take(1)?;
        Ok(i8::from_be_bytes([b[0]]))
    }

    pub fn get_i16(&mut self) -> Result<i16> {
        let b = self.take(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        let b = self.take(8)?;
        Ok(i64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn get_slice(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    /// Read a 16-bit-length-prefixed string.
    pub fn get_string(&mut self) -> Result<String> {
        let len = self.get_i16()?;
        let len = usize::try_from(len)
            .map_err(|_| Error::MalformedResponse(format!("negative string length {len}")))?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::MalformedResponse(format!("invalid utf-8 string: {e}")))
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }
}
