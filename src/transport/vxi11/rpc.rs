//! Core channel procedures of VXI-11

use std::fmt;

use super::xdr::{XdrPack, XdrReader};
use crate::error::Result;

pub const DEVICE_CORE_PROG: u32 = 395183;
pub const DEVICE_CORE_VERS: u32 = 1;

/// Client ID sent in `create_link`, instruments ignore it
const CLIENT_ID: i32 = 1;
/// Device lock timeout, in ms
pub const LOCK_TIMEOUT: u32 = 10000;

/// Operation flag: last byte of a write carries END
pub const FLAG_END: u32 = 1 << 3;
/// Read reason: END indicator was read
pub const REASON_END: u32 = 1 << 2;

/// `Device_ErrorCode` returned by every core procedure
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DeviceError(pub u32);
impl DeviceError {
    pub const IO_TIMEOUT: Self = Self(15);

    fn name(self) -> &'static str {
        match self.0 {
            1 => "syntax error",
            3 => "device not accessible",
            4 => "invalid link identifier",
            5 => "parameter error",
            6 => "channel not established",
            8 => "operation not supported",
            9 => "out of resources",
            11 => "device locked by another link",
            12 => "no lock held by this link",
            15 => "I/O timeout",
            17 => "I/O error",
            21 => "invalid address",
            23 => "abort",
            29 => "channel already established",
            _ => "unknown error",
        }
    }

    fn unpack(src: &mut XdrReader) -> Result<std::result::Result<(), Self>> {
        Ok(match src.u32()? {
            0 => Ok(()),
            code => Err(Self(code)),
        })
    }
}
impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}
impl fmt::Debug for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Outcome of a core procedure: transport/decoding failure outside, device
/// error inside
pub type DeviceResult<T> = Result<std::result::Result<T, DeviceError>>;

/// Arguments of the core procedures we issue
#[derive(Debug)]
pub enum CoreCall<'a> {
    CreateLink {
        /// e.g. `inst0` or `gpib0,5`
        device: &'a str,
    },
    Write {
        lid: i32,
        /// ms
        io_timeout: u32,
        flags: u32,
        data: &'a [u8],
    },
    Read {
        lid: i32,
        request_size: u32,
        /// ms
        io_timeout: u32,
    },
    DestroyLink {
        lid: i32,
    },
}
impl CoreCall<'_> {
    pub fn procedure(&self) -> u32 {
        match self {
            Self::CreateLink { .. } => 10,
            Self::Write { .. } => 11,
            Self::Read { .. } => 12,
            Self::DestroyLink { .. } => 23,
        }
    }
}
impl XdrPack for CoreCall<'_> {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        match self {
            Self::CreateLink { device } => {
                CLIENT_ID.pack_xdr(out);
                /* lockDevice */
                false.pack_xdr(out);
                LOCK_TIMEOUT.pack_xdr(out);
                device.pack_xdr(out);
            }
            Self::Write {
                lid,
                io_timeout,
                flags,
                data,
            } => {
                lid.pack_xdr(out);
                io_timeout.pack_xdr(out);
                LOCK_TIMEOUT.pack_xdr(out);
                flags.pack_xdr(out);
                data.pack_xdr(out);
            }
            Self::Read {
                lid,
                request_size,
                io_timeout,
            } => {
                lid.pack_xdr(out);
                request_size.pack_xdr(out);
                io_timeout.pack_xdr(out);
                LOCK_TIMEOUT.pack_xdr(out);
                /* No flags, termChar unused */
                0u32.pack_xdr(out);
                0u32.pack_xdr(out);
            }
            Self::DestroyLink { lid } => lid.pack_xdr(out),
        }
    }
}

#[derive(Debug)]
pub struct LinkParms {
    pub lid: i32,
    /// Largest `device_write` payload the instrument accepts
    pub max_recv_size: u32,
}

pub fn parse_create_link(results: &[u8]) -> DeviceResult<LinkParms> {
    let mut src = XdrReader::new(results);
    if let Err(e) = DeviceError::unpack(&mut src)? {
        return Ok(Err(e));
    }
    let lid = src.i32()?;
    let _abort_port = src.u16()?;
    let max_recv_size = src.u32()?;

    Ok(Ok(LinkParms { lid, max_recv_size }))
}

/// Number of bytes the device accepted
pub fn parse_write(results: &[u8]) -> DeviceResult<u32> {
    let mut src = XdrReader::new(results);
    if let Err(e) = DeviceError::unpack(&mut src)? {
        return Ok(Err(e));
    }
    Ok(Ok(src.u32()?))
}

/// Reason bits and data of a `device_read`
pub fn parse_read(results: &[u8]) -> DeviceResult<(u32, Vec<u8>)> {
    let mut src = XdrReader::new(results);
    if let Err(e) = DeviceError::unpack(&mut src)? {
        return Ok(Err(e));
    }
    let reason = src.u32()?;
    Ok(Ok((reason, src.opaque()?)))
}

/// Procedures answering with a bare error code
pub fn parse_error(results: &[u8]) -> DeviceResult<()> {
    DeviceError::unpack(&mut XdrReader::new(results))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_args_layout() {
        let mut out = vec![];
        CoreCall::Write {
            lid: 7,
            io_timeout: 500,
            flags: FLAG_END,
            data: b"*RST",
        }
        .pack_xdr(&mut out);

        let mut src = XdrReader::new(&out);
        assert_eq!(src.i32().unwrap(), 7);
        assert_eq!(src.u32().unwrap(), 500);
        assert_eq!(src.u32().unwrap(), LOCK_TIMEOUT);
        assert_eq!(src.u32().unwrap(), FLAG_END);
        assert_eq!(src.opaque().unwrap(), b"*RST");
    }

    #[test]
    fn device_errors_are_separate_from_decoding() {
        let mut ok = vec![];
        0u32.pack_xdr(&mut ok);
        REASON_END.pack_xdr(&mut ok);
        (&b"1.0\n"[..]).pack_xdr(&mut ok);
        let (reason, data) = parse_read(&ok).unwrap().unwrap();
        assert_eq!(reason & REASON_END, REASON_END);
        assert_eq!(data, b"1.0\n");

        let mut timeout = vec![];
        15u32.pack_xdr(&mut timeout);
        assert_eq!(parse_read(&timeout).unwrap().unwrap_err(), DeviceError::IO_TIMEOUT);
        assert_eq!(DeviceError(3).to_string(), "device not accessible (3)");

        /* Truncated body */
        assert!(parse_write(&[0, 0, 0, 0, 1]).is_err());
    }
}
