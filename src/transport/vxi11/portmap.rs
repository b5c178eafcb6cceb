//! Portmap client, RFC1833

use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use log::debug;
use tokio::{net::UdpSocket, time::Instant};

use crate::error::{Error, Result};

use super::{
    onc::{CallHeader, OncClient, decode_reply},
    xdr::{XdrPack, XdrReader},
};

pub const PORTMAP_PROG: u32 = 100000;
pub const PORTMAP_VERS: u32 = 2;

pub const PORTMAP_PORT: u16 = 111;

pub const PMAPPROC_GETPORT: u32 = 3;

#[allow(unused)]
#[derive(Clone, Copy, Debug)]
#[repr(u32)]
pub enum RpcIpProto {
    Tcp = 6,
    Udp = 17,
}

#[derive(Debug)]
pub struct RpcMapping {
    /// Program number
    pub prog: u32,
    /// Version number
    pub vers: u32,
    /// Protocol number
    pub prot: RpcIpProto,
    /// Port
    pub port: u32,
}
impl XdrPack for RpcMapping {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        self.prog.pack_xdr(out);
        self.vers.pack_xdr(out);
        (self.prot as u32).pack_xdr(out);
        self.port.pack_xdr(out);
    }
}

/// Ask a portmapper which TCP port serves a program. Zero means not
/// registered.
pub async fn request_port(client: &mut OncClient, prog: u32, vers: u32) -> Result<u16> {
    let mapping = RpcMapping {
        prog,
        vers,
        prot: RpcIpProto::Tcp,
        port: 0,
    };

    let results = client
        .call(PORTMAP_PROG, PORTMAP_VERS, PMAPPROC_GETPORT, mapping)
        .await?
        .map_err(|e| Error::Connect(format!("Portmap GETPORT failed: {e}")))?;

    XdrReader::new(&results).u16()
}

/// Broadcast a GETPORT for `prog` over UDP and collect every host that
/// answers with a registered port before `timeout` elapses
pub async fn broadcast_getport(
    port: u16,
    prog: u32,
    vers: u32,
    timeout: Duration,
) -> Result<BTreeMap<IpAddr, u16>> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;

    const XID: u32 = 0x4c48_414c;
    let msg = CallHeader {
        xid: XID,
        prog: PORTMAP_PROG,
        vers: PORTMAP_VERS,
        proc: PMAPPROC_GETPORT,
    }
    .encode(RpcMapping {
        prog,
        vers,
        prot: RpcIpProto::Tcp,
        port: 0,
    });
    socket
        .send_to(&msg, SocketAddr::from((Ipv4Addr::BROADCAST, port)))
        .await?;

    let deadline = Instant::now() + timeout;
    let mut found = BTreeMap::new();
    let mut buf = vec![0; 1024];
    loop {
        let (len, peer) = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Err(_) => break,
            Ok(res) => res?,
        };

        match decode_reply(&buf[..len]) {
            Ok((XID, Ok(results))) => match XdrReader::new(results).u16() {
                Ok(0) => debug!("{peer} does not serve program {prog}"),
                Ok(port) => {
                    found.insert(peer.ip(), port);
                }
                Err(e) => debug!("Bad GETPORT reply from {peer}: {e}"),
            },
            Ok((xid, _)) => debug!("Ignoring reply {xid:#x} from {peer}"),
            Err(e) => debug!("Bad reply from {peer}: {e}"),
        }
    }

    Ok(found)
}
