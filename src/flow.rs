use crate::session::SocketSession;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{error, trace};

/// Abstraction for sending a datagram on a UDP socket, introduced to
/// facilitate mocking the I/O part away for testing (and to let tests
/// interpose loss).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]);

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        trace!("UDP socket: sending {} bytes to {:?}", packet_buf.len(), to);
        if let Err(e) = self.send_to(packet_buf, to).await {
            error!("error sending UDP packet to {:?}: {}", to, e);
        }
    }

    fn local_addr(&self) -> SocketAddr {
        UdpSocket::local_addr(self).expect("UdpSocket should have an initialized local addr")
    }
}

struct FlowEntry {
    deadline: Instant,
    /// registration order breaks deadline ties
    order: u64,
    session: Weak<SocketSession>,
}

impl PartialEq for FlowEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.order == other.order
    }
}
impl Eq for FlowEntry {}

impl PartialOrd for FlowEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FlowEntry {
    /// reversed, so the `BinaryHeap` pops the earliest deadline first
    fn cmp(&self, other: &Self) -> Ordering {
        (other.deadline, other.order).cmp(&(self.deadline, self.order))
    }
}

struct FlowInner {
    heap: BinaryHeap<FlowEntry>,
    next_order: u64,
}

/// The paced outbound scheduler: owns the send half of the shared UDP
/// endpoint and drains one packet per tick from the session whose next
/// scheduled send time is soonest. Sessions register themselves on every
/// event that may have produced sendable data.
pub struct Flow {
    socket: Arc<dyn DatagramSocket>,
    inner: StdMutex<FlowInner>,
    notify: Notify,
}

impl Flow {
    pub fn new(socket: Arc<dyn DatagramSocket>) -> Arc<Flow> {
        Arc::new(Flow {
            socket,
            inner: StdMutex::new(FlowInner {
                heap: BinaryHeap::new(),
                next_order: 0,
            }),
            notify: Notify::new(),
        })
    }

    /// (re-)schedule a session according to its current pacing delay
    pub fn register(&self, session: &Arc<SocketSession>) {
        let deadline = Instant::now() + session.next_scheduled_packet_time();
        {
            let mut inner = self.inner.lock().unwrap();
            let order = inner.next_order;
            inner.next_order += 1;
            inner.heap.push(FlowEntry {
                deadline,
                order,
                session: Arc::downgrade(session),
            });
        }
        self.notify.notify_one();
    }

    /// the scheduler loop; runs until the owning multiplexer is dropped
    pub(crate) async fn run(self: Arc<Self>) {
        loop {
            let next_deadline = self.inner.lock().unwrap().heap.peek().map(|e| e.deadline);

            let Some(deadline) = next_deadline else {
                self.notify.notified().await;
                continue;
            };

            if deadline > Instant::now() {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    // an earlier deadline may have been registered
                    _ = self.notify.notified() => continue,
                }
            }

            let entry = self.inner.lock().unwrap().heap.pop();
            let Some(entry) = entry else { continue };
            let Some(session) = entry.session.upgrade() else {
                continue;
            };

            if let Some((packet_buf, seq)) = session.next_scheduled_packet().await {
                self.socket
                    .send_packet(session.remote_addr(), &packet_buf)
                    .await;
                session.after_packet_sent(seq).await;

                if session.has_packet_to_send().await {
                    self.register(&session);
                }
            }
            // a session that had nothing sendable (e.g. its flow window is
            // full) is NOT re-registered; the event that unblocks it - an
            // ACK, a NAK, a write, an EXP requeue - registers it again
        }
    }
}
