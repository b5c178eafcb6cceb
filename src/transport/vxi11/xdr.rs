//! External Data Representation (XDR), as defined by RFC4506

use crate::error::{Error, Result};

pub trait XdrPack {
    /// Consume self, appending XDR representation into out
    fn pack_xdr(self, out: &mut Vec<u8>);
}

impl XdrPack for u32 {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        out.extend(self.to_be_bytes());
    }
}

impl XdrPack for i32 {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        out.extend(self.to_be_bytes());
    }
}

impl XdrPack for bool {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        (self as u32).pack_xdr(out);
    }
}

impl XdrPack for &[u8] {
    /// Variable length opaque data: length, bytes, zero padding to a 4 byte
    /// boundary
    fn pack_xdr(self, out: &mut Vec<u8>) {
        (self.len() as u32).pack_xdr(out);
        out.extend_from_slice(self);
        out.resize(out.len() + padding(self.len()), 0);
    }
}

impl XdrPack for &str {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        self.as_bytes().pack_xdr(out);
    }
}

/// Arguments of procedures that take none
impl XdrPack for () {
    fn pack_xdr(self, _out: &mut Vec<u8>) {}
}

fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

/// Cursor over received XDR data. Reading past the end is an error rather
/// than a panic.
pub struct XdrReader<'a> {
    src: &'a [u8],
}
impl<'a> XdrReader<'a> {
    pub fn new(src: &'a [u8]) -> Self {
        Self { src }
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        if self.src.len() < len {
            return Err(Error::BadResponse(format!(
                "Not enough bytes to read {what}: need {len}, have {}",
                self.src.len()
            )));
        }
        let (head, tail) = self.src.split_at(len);
        self.src = tail;
        Ok(head)
    }

    pub fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4, "u32")?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    pub fn u16(&mut self) -> Result<u16> {
        let val = self.u32()?;
        val.try_into()
            .map_err(|_| Error::BadResponse(format!("Value {val} does not represent a 16-bit value")))
    }

    pub fn bool(&mut self) -> Result<bool> {
        Ok(self.u32()? != 0)
    }

    pub fn opaque(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        let data = self.take(len, "opaque data")?.to_vec();
        self.take(padding(len), "opaque padding")?;
        Ok(data)
    }

    /// Remaining undecoded bytes
    pub fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.src)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opaque_is_padded() {
        let mut out = vec![];
        "inst0".pack_xdr(&mut out);
        assert_eq!(out, [0, 0, 0, 5, b'i', b'n', b's', b't', b'0', 0, 0, 0]);

        let mut reader = XdrReader::new(&out);
        assert_eq!(reader.opaque().unwrap(), b"inst0");
        assert!(reader.rest().is_empty());
    }

    #[test]
    fn short_input_is_an_error() {
        let mut reader = XdrReader::new(&[0, 0, 1]);
        assert!(matches!(reader.u32(), Err(Error::BadResponse(_))));

        let mut reader = XdrReader::new(&[0, 0, 0, 9, 1, 2]);
        assert!(matches!(reader.opaque(), Err(Error::BadResponse(_))));

        let mut reader = XdrReader::new(&[0, 1, 0, 0]);
        assert!(reader.u16().is_err());
    }
}
