use crate::parser::errors::{OpError, OpErrorKind, OpResult};
use byteorder::{ByteOrder, LittleEndian};

///
/// Sequential little-endian reader over a borrowed byte buffer.
///
/// Every read checks the remaining length first and fails with a
/// `ParseError` ("buffer exhausted") instead of reading past the end.
/// The offset is freely settable so that the decoder can rewind to
/// compute hashes over byte spans it has already walked.
///
#[derive(Debug, Clone)]
pub struct ByteCursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        ByteCursor { data, offset: 0 }
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn set_offset(&mut self, offset: usize) {
        self.offset = offset.min(self.data.len());
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrow an arbitrary span of the underlying buffer.
    pub fn slice(&self, begin: usize, end: usize) -> OpResult<&'a [u8]> {
        if begin > end || end > self.data.len() {
            return Err(exhausted(end));
        }
        Ok(&self.data[begin..end])
    }

    /// Look at the next `n` bytes without moving.
    pub fn peek(&self, n: usize) -> OpResult<&'a [u8]> {
        self.slice(self.offset, self.offset + n)
    }

    pub fn read_bytes(&mut self, n: usize) -> OpResult<&'a [u8]> {
        let bytes = self.peek(n)?;
        self.offset += n;
        Ok(bytes)
    }

    pub fn skip(&mut self, n: usize) -> OpResult<()> {
        self.read_bytes(n).map(|_| ())
    }

    #[inline]
    pub fn read_u8(&mut self) -> OpResult<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    #[inline]
    pub fn read_u16(&mut self) -> OpResult<u16> {
        Ok(LittleEndian::read_u16(self.read_bytes(2)?))
    }

    #[inline]
    pub fn read_u32(&mut self) -> OpResult<u32> {
        Ok(LittleEndian::read_u32(self.read_bytes(4)?))
    }

    #[inline]
    pub fn read_u64(&mut self) -> OpResult<u64> {
        Ok(LittleEndian::read_u64(self.read_bytes(8)?))
    }

    pub fn read_varint(&mut self) -> OpResult<u64> {
        match self.read_u8()? {
            0xfd => Ok(self.read_u16()? as u64),
            0xfe => Ok(self.read_u32()? as u64),
            0xff => self.read_u64(),
            n => Ok(n as u64),
        }
    }

    #[inline]
    pub fn read_fixed_hash(&mut self) -> OpResult<[u8; 32]> {
        let mut arr = [0u8; 32];
        arr.copy_from_slice(self.read_bytes(32)?);
        Ok(arr)
    }

    pub fn read_length_prefixed_bytes(&mut self) -> OpResult<&'a [u8]> {
        let len = self.read_len()?;
        self.read_bytes(len)
    }

    pub fn skip_length_prefixed_bytes(&mut self) -> OpResult<()> {
        let len = self.read_len()?;
        self.skip(len)
    }

    fn read_len(&mut self) -> OpResult<usize> {
        let len = self.read_varint()?;
        if len > self.remaining() as u64 {
            return Err(exhausted(self.offset));
        }
        Ok(len as usize)
    }
}

fn exhausted(at: usize) -> OpError {
    OpError::new(OpErrorKind::ParseError).join_msg(&format!("buffer exhausted at offset {}", at))
}

/// Append `n` in the variable-length integer encoding.
pub fn write_varint(out: &mut Vec<u8>, n: u64) {
    let mut buf = [0u8; 8];
    if n < 0xfd {
        out.push(n as u8);
    } else if n <= 0xffff {
        out.push(0xfd);
        LittleEndian::write_u16(&mut buf, n as u16);
        out.extend_from_slice(&buf[..2]);
    } else if n <= 0xffff_ffff {
        out.push(0xfe);
        LittleEndian::write_u32(&mut buf, n as u32);
        out.extend_from_slice(&buf[..4]);
    } else {
        out.push(0xff);
        LittleEndian::write_u64(&mut buf, n);
        out.extend_from_slice(&buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_boundaries() {
        let cases: [(u64, usize); 8] = [
            (0, 1),
            (252, 1),
            (253, 3),
            (255, 3),
            (65535, 3),
            (65536, 5),
            (4294967295, 5),
            (4294967296, 9),
        ];
        for (value, width) in cases.iter() {
            let mut buf = Vec::new();
            write_varint(&mut buf, *value);
            assert_eq!(buf.len(), *width, "encoded width of {}", value);
            let mut cursor = ByteCursor::new(&buf);
            assert_eq!(cursor.read_varint().unwrap(), *value);
            assert_eq!(cursor.offset(), *width);
            assert_eq!(cursor.remaining(), 0);
        }
    }

    #[test]
    fn test_fixed_width_little_endian() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09];
        let mut cursor = ByteCursor::new(&data);
        assert_eq!(cursor.read_u8().unwrap(), 0x01);
        assert_eq!(cursor.read_u16().unwrap(), 0x0302);
        assert_eq!(cursor.read_u32().unwrap(), 0x07060504);
        assert!(cursor.read_u32().is_err());
        // failed read does not move the cursor
        assert_eq!(cursor.offset(), 7);
    }

    #[test]
    fn test_length_prefixed() {
        let data = [0x03, 0xaa, 0xbb, 0xcc, 0x05, 0x00];
        let mut cursor = ByteCursor::new(&data);
        assert_eq!(cursor.read_length_prefixed_bytes().unwrap(), &[0xaa, 0xbb, 0xcc]);
        let err = cursor.skip_length_prefixed_bytes().unwrap_err();
        assert!(err.is_kind(OpErrorKind::ParseError));
    }
}
