//! TCP reachability probe (spec §4.A, §4.D).
//!
//! The source IP binding is load-bearing: it is what forces the probe onto
//! a specific interface rather than letting the kernel pick a default
//! route, which would defeat the point of probing each uplink
//! independently.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpSocket;

use super::Error;

#[async_trait]
pub trait ProbeOps: Send + Sync {
    /// Opens a TCP connection from `src_ip` to `dst:dst_port`, bounded by
    /// `timeout`. Any established connection counts as success regardless
    /// of payload (spec §4.D); the connection is dropped immediately after.
    async fn dial_tcp(
        &self,
        src_ip: Ipv4Addr,
        dst: Ipv4Addr,
        dst_port: u16,
        timeout: Duration,
    ) -> Result<(), Error>;
}

pub struct RealProbeOps;

impl RealProbeOps {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RealProbeOps {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProbeOps for RealProbeOps {
    async fn dial_tcp(
        &self,
        src_ip: Ipv4Addr,
        dst: Ipv4Addr,
        dst_port: u16,
        timeout: Duration,
    ) -> Result<(), Error> {
        let socket = TcpSocket::new_v4()?;
        socket.bind(SocketAddr::V4(SocketAddrV4::new(src_ip, 0)))?;
        let dst = SocketAddr::V4(SocketAddrV4::new(dst, dst_port));

        match tokio::time::timeout(timeout, socket.connect(dst)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(Error::IO(e)),
            Err(_) => Err(Error::ProbeTimeout),
        }
    }
}
