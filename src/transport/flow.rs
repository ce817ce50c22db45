//! Flow transport (§4.5): datagram ingress/egress queues with
//! backpressure. Each instance owns its own bounded queues — the source
//! this crate is grounded on used module-level shared queues, which §9
//! calls out as incidental rather than required, so process-wide sharing
//! is dropped here.

use std::collections::HashSet;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::flow::FlowKey;
use crate::id::NodeId;

/// The residual destination list carried by every chunk header — the
/// spanning tree is materialized in the payload, not kept as routing
/// state downstream (§4.6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowHeader {
    pub key: FlowKey,
    pub destinations: HashSet<NodeId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowDatagram {
    pub header: FlowHeader,
    pub frame_number: u64,
    pub chunk: Vec<u8>,
}

/// An outbound datagram plus the physical address it should go to.
struct Outbound {
    addr: SocketAddr,
    datagram: FlowDatagram,
}

const MAX_DATAGRAM_BYTES: usize = 64 * 1024;

pub struct FlowTransport {
    socket: Arc<UdpSocket>,
    egress_tx: Sender<Outbound>,
    ingress_rx: Receiver<FlowDatagram>,
    stop_tx: Sender<()>,
    _dispatcher: thread::JoinHandle<()>,
    _forwarder: thread::JoinHandle<()>,
}

impl FlowTransport {
    /// Binds a UDP socket at `bind_addr` and starts one dispatcher and
    /// one forwarder worker, each backed by a bounded queue of `queue_size`.
    pub fn bind(bind_addr: SocketAddr, queue_size: usize) -> std::io::Result<FlowTransport> {
        let socket = Arc::new(UdpSocket::bind(bind_addr)?);
        socket.set_read_timeout(Some(std::time::Duration::from_millis(200)))?;
        let (ingress_tx, ingress_rx) = bounded::<FlowDatagram>(queue_size);
        let (egress_tx, egress_rx) = bounded::<Outbound>(queue_size);
        let (stop_tx, stop_rx) = bounded::<()>(0);

        let dispatcher = {
            let socket = socket.clone();
            thread::spawn(move || dispatcher_loop(socket, ingress_tx, stop_rx))
        };
        let forwarder = {
            let socket = socket.clone();
            thread::spawn(move || forwarder_loop(socket, egress_rx))
        };

        Ok(FlowTransport {
            socket,
            egress_tx,
            ingress_rx,
            stop_tx,
            _dispatcher: dispatcher,
            _forwarder: forwarder,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Enqueues a datagram for `destination`; blocks when the egress
    /// queue is full (§4.5 backpressure).
    pub fn send(&self, header: FlowHeader, frame_number: u64, chunk: Vec<u8>, destination: SocketAddr) {
        let datagram = FlowDatagram { header, frame_number, chunk };
        // A full egress queue backpressures the caller; a closed queue
        // (transport shutting down) silently drops the send.
        let _ = self.egress_tx.send(Outbound { addr: destination, datagram });
    }

    /// Blocks until a datagram is available.
    pub fn receive(&self) -> Option<FlowDatagram> {
        self.ingress_rx.recv().ok()
    }

    /// Signals the dispatcher worker to stop; it notices within its read
    /// timeout. The forwarder stops when the last `egress_tx` clone (and
    /// thus the transport itself) is dropped.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }
}

fn dispatcher_loop(socket: Arc<UdpSocket>, ingress_tx: Sender<FlowDatagram>, stop_rx: Receiver<()>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
    loop {
        if stop_rx.try_recv().is_ok() {
            return;
        }
        match socket.recv_from(&mut buf) {
            Ok((n, _peer)) => match bincode::deserialize::<FlowDatagram>(&buf[..n]) {
                Ok(datagram) => {
                    if ingress_tx.send(datagram).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    trace!("dropping malformed flow datagram: {}", e);
                }
            },
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(e) => {
                trace!("flow socket recv error: {}", e);
                return;
            }
        }
    }
}

fn forwarder_loop(socket: Arc<UdpSocket>, egress_rx: Receiver<Outbound>) {
    while let Ok(Outbound { addr, datagram }) = egress_rx.recv() {
        match bincode::serialize(&datagram) {
            Ok(bytes) => {
                // Chunk send failures are silently dropped (§7: the
                // datagram loss model tolerates this).
                let _ = socket.send_to(&bytes, addr);
            }
            Err(e) => trace!("failed to encode flow datagram: {}", e),
        }
    }
}
