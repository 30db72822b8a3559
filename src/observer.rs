//! Route Observer (spec §4.B): a lazy stream of "topology may have changed"
//! ticks.
//!
//! Generalizes the teacher's one-shot `rtnetlink::new_connection()` pattern
//! (used there to issue a handful of requests and drop the connection) into
//! a long-lived multicast subscription: binds to `RTNLGRP_LINK`,
//! `RTNLGRP_IPV4_ROUTE`, and `RTNLGRP_IPV4_IFADDR` so any kernel change
//! that could alter the output of the State Sampler produces at least one
//! `Tick`. The Observer does not classify events (spec §4.B); it just
//! guarantees delivery within bounded time.

use futures::{Stream, StreamExt};

/// Opaque "something changed" signal; the Observer deliberately carries no
/// payload; the Sampler always re-reads full state rather than diffing a
/// netlink message.
#[derive(Debug, Clone, Copy)]
pub struct Tick;

#[cfg(target_os = "linux")]
pub fn subscribe() -> Result<impl Stream<Item = Tick>, std::io::Error> {
    use futures::stream;
    use netlink_sys::{AsyncSocket, SocketAddr};
    use rtnetlink::constants::{RTMGRP_IPV4_IFADDR, RTMGRP_IPV4_ROUTE, RTMGRP_LINK};

    let (mut connection, _handle, _messages) = rtnetlink::new_connection()?;
    let groups = RTMGRP_LINK | RTMGRP_IPV4_ROUTE | RTMGRP_IPV4_IFADDR;
    let addr = SocketAddr::new(0, groups);
    connection.socket_mut().socket_mut().bind(&addr)?;
    tokio::spawn(connection);

    let initial = stream::once(async { Tick });
    let kernel_events = _messages.map(|_msg| Tick);
    Ok(initial.chain(kernel_events))
}

#[cfg(not(target_os = "linux"))]
pub fn subscribe() -> Result<impl Stream<Item = Tick>, std::io::Error> {
    Ok(futures::stream::once(async { Tick }))
}
