//! Open Network Computing (ONC) RPC protocol, as defined by RFC5531

use log::warn;
use tokio::net::TcpStream;

use crate::{
    error::{Error, Result},
    framing::{MAX_RECORD_LEN, read_record, write_record},
};

use super::xdr::{XdrPack, XdrReader};

pub const RPC_VERSION: u32 = 2;

const MSG_CALL: u32 = 0;
const MSG_REPLY: u32 = 1;

const AUTH_NULL: u32 = 0;
const NO_BODY: &[u8] = &[];

/// Why an RPC call did not produce results
#[derive(Debug, PartialEq, Eq)]
pub enum RpcFailure {
    ProgUnavail,
    ProgMismatch { low: u32, high: u32 },
    ProcUnavail,
    GarbageArgs,
    SystemErr,
    RpcMismatch { low: u32, high: u32 },
    AuthError(u32),
}
impl std::fmt::Display for RpcFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ProgUnavail => write!(f, "program unavailable"),
            Self::ProgMismatch { low, high } => {
                write!(f, "program version mismatch (supported {low}..={high})")
            }
            Self::ProcUnavail => write!(f, "procedure unavailable"),
            Self::GarbageArgs => write!(f, "server could not decode arguments"),
            Self::SystemErr => write!(f, "server system error"),
            Self::RpcMismatch { low, high } => {
                write!(f, "RPC version mismatch (supported {low}..={high})")
            }
            Self::AuthError(stat) => write!(f, "authentication error {stat}"),
        }
    }
}

/// Header of a call message
pub struct CallHeader {
    pub xid: u32,
    pub prog: u32,
    pub vers: u32,
    pub proc: u32,
}
impl CallHeader {
    /// Encode a call with null credentials followed by the procedure arguments
    pub fn encode(&self, args: impl XdrPack) -> Vec<u8> {
        let mut out = vec![];
        self.xid.pack_xdr(&mut out);
        MSG_CALL.pack_xdr(&mut out);
        RPC_VERSION.pack_xdr(&mut out);
        self.prog.pack_xdr(&mut out);
        self.vers.pack_xdr(&mut out);
        self.proc.pack_xdr(&mut out);
        /* cred, verf */
        for _ in 0..2 {
            AUTH_NULL.pack_xdr(&mut out);
            NO_BODY.pack_xdr(&mut out);
        }
        args.pack_xdr(&mut out);
        out
    }

    /// Decode a call message, returning the header and the argument bytes
    #[cfg(test)]
    pub fn decode(msg: &[u8]) -> Result<(Self, &[u8])> {
        let mut reader = XdrReader::new(msg);
        let xid = reader.u32()?;
        if reader.u32()? != MSG_CALL {
            return Err(Error::BadResponse("Not an RPC call".into()));
        }
        let _rpcvers = reader.u32()?;
        let header = Self {
            xid,
            prog: reader.u32()?,
            vers: reader.u32()?,
            proc: reader.u32()?,
        };
        for _ in 0..2 {
            let _flavor = reader.u32()?;
            reader.opaque()?;
        }
        Ok((header, reader.rest()))
    }
}

/// Encode a successful reply carrying `results`
#[cfg(test)]
pub fn encode_success(xid: u32, results: impl XdrPack) -> Vec<u8> {
    let mut out = vec![];
    xid.pack_xdr(&mut out);
    MSG_REPLY.pack_xdr(&mut out);
    /* MSG_ACCEPTED, null verifier, SUCCESS */
    0u32.pack_xdr(&mut out);
    AUTH_NULL.pack_xdr(&mut out);
    NO_BODY.pack_xdr(&mut out);
    0u32.pack_xdr(&mut out);
    results.pack_xdr(&mut out);
    out
}

/// Decode a reply message into its xid and either the procedure results or
/// the reason the call failed
pub fn decode_reply(msg: &[u8]) -> Result<(u32, std::result::Result<&[u8], RpcFailure>)> {
    let mut reader = XdrReader::new(msg);
    let xid = reader.u32()?;
    match reader.u32()? {
        MSG_REPLY => (),
        i => return Err(Error::BadResponse(format!("Unexpected message type {i}"))),
    }

    let outcome = match reader.u32()? {
        /* MSG_ACCEPTED */
        0 => {
            let _verf_flavor = reader.u32()?;
            reader.opaque()?;
            match reader.u32()? {
                0 => Ok(reader.rest()),
                1 => Err(RpcFailure::ProgUnavail),
                2 => Err(RpcFailure::ProgMismatch {
                    low: reader.u32()?,
                    high: reader.u32()?,
                }),
                3 => Err(RpcFailure::ProcUnavail),
                4 => Err(RpcFailure::GarbageArgs),
                5 => Err(RpcFailure::SystemErr),
                i => {
                    return Err(Error::BadResponse(format!(
                        "Unknown accepted reply type {i}"
                    )));
                }
            }
        }
        /* MSG_DENIED */
        1 => match reader.u32()? {
            0 => Err(RpcFailure::RpcMismatch {
                low: reader.u32()?,
                high: reader.u32()?,
            }),
            1 => Err(RpcFailure::AuthError(reader.u32()?)),
            i => {
                return Err(Error::BadResponse(format!(
                    "Unknown rejected reply type {i}"
                )));
            }
        },
        i => return Err(Error::BadResponse(format!("Unknown reply status {i}"))),
    };

    Ok((xid, outcome))
}

/// RPC client over a record-marked TCP stream
pub struct OncClient {
    stream: TcpStream,
    next_xid: u32,
}
impl OncClient {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            next_xid: 1,
        }
    }

    /// Perform one call, returning the undecoded results
    pub async fn call(
        &mut self,
        prog: u32,
        vers: u32,
        proc: u32,
        args: impl XdrPack,
    ) -> Result<std::result::Result<Vec<u8>, RpcFailure>> {
        let xid = self.next_xid;
        self.next_xid = self.next_xid.wrapping_add(1);

        let msg = CallHeader {
            xid,
            prog,
            vers,
            proc,
        }
        .encode(args);
        write_record(&mut self.stream, &msg).await?;

        loop {
            let Some(reply) = read_record(&mut self.stream, MAX_RECORD_LEN).await? else {
                return Err(Error::Read("RPC server closed the connection".into()));
            };

            let (reply_xid, outcome) = decode_reply(&reply)?;
            if reply_xid != xid {
                /* Stale reply to a call abandoned on timeout */
                warn!("Received non-matching xid {reply_xid}, expected {xid}");
                continue;
            }

            return Ok(outcome.map(|results| results.to_vec()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_header_survives_encoding() {
        let msg = CallHeader {
            xid: 42,
            prog: 100000,
            vers: 2,
            proc: 3,
        }
        .encode(7u32);

        let (header, args) = CallHeader::decode(&msg).unwrap();
        assert_eq!((header.xid, header.prog, header.proc), (42, 100000, 3));
        assert_eq!(args, [0, 0, 0, 7]);
    }

    #[test]
    fn decodes_rejections() {
        let reply = encode_success(9, 1234u32);
        let (xid, outcome) = decode_reply(&reply).unwrap();
        assert_eq!(xid, 9);
        assert_eq!(outcome.unwrap(), [0, 0, 0x04, 0xd2]);

        /* xid 3, reply, accepted, null verf, PROG_MISMATCH 1..2 */
        let mut reply = vec![];
        for word in [3u32, 1, 0, 0, 0, 2, 1, 2] {
            word.pack_xdr(&mut reply);
        }
        let (_, outcome) = decode_reply(&reply).unwrap();
        assert_eq!(
            outcome.unwrap_err(),
            RpcFailure::ProgMismatch { low: 1, high: 2 }
        );

        assert!(decode_reply(&[0, 0, 0, 3, 0, 0, 0, 1]).is_err());
    }
}
