//! The virtual Ethernet device behind each netif.
//!
//! Inbound frames (decrypted by the overlay) are queued by the tap and
//! consumed by the interface's poll; outbound frames the stack emits are
//! handed whole to a [`FrameSink`], which is the tap's transmit hook.

use std::collections::VecDeque;
use std::sync::Arc;

use smoltcp::phy::{self, Checksum, ChecksumCapabilities, DeviceCapabilities, Medium};
use smoltcp::time::Instant;

/// Receives complete outbound Ethernet frames from the stack.
///
/// Implementations must not block and must not call back into the stack
/// driver; they run on the stack thread with the core lock held.
pub trait FrameSink: Send + Sync {
    fn transmit(&self, frame: &[u8]);
}

/// Cap on queued inbound frames per netif; overflow drops the oldest.
const RX_QUEUE_LIMIT: usize = 1024;

const ETHERNET_HEADER_LEN: usize = 14;

/// One netif's packet queues.
pub struct TapDevice {
    mtu: usize,
    rx: VecDeque<Vec<u8>>,
    sink: Arc<dyn FrameSink>,
    /// Frames dropped because the receive queue was full.
    pub rx_overruns: u64,
}

impl TapDevice {
    pub fn new(mtu: usize, sink: Arc<dyn FrameSink>) -> Self {
        Self { mtu, rx: VecDeque::new(), sink, rx_overruns: 0 }
    }

    /// Queue one inbound Ethernet frame for the next poll.
    pub fn enqueue_rx(&mut self, frame: Vec<u8>) {
        if self.rx.len() >= RX_QUEUE_LIMIT {
            self.rx.pop_front();
            self.rx_overruns += 1;
        }
        self.rx.push_back(frame);
    }

    pub fn set_mtu(&mut self, mtu: usize) {
        self.mtu = mtu;
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn rx_pending(&self) -> usize {
        self.rx.len()
    }
}

pub struct RxToken(Vec<u8>);

impl phy::RxToken for RxToken {
    fn consume<R, F>(mut self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        f(&mut self.0)
    }
}

pub struct TxToken<'a> {
    sink: &'a dyn FrameSink,
}

impl phy::TxToken for TxToken<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buf = vec![0u8; len];
        let result = f(&mut buf);
        self.sink.transmit(&buf);
        result
    }
}

impl phy::Device for TapDevice {
    type RxToken<'a> = RxToken;
    type TxToken<'a> = TxToken<'a>;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let frame = self.rx.pop_front()?;
        Some((RxToken(frame), TxToken { sink: &*self.sink }))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(TxToken { sink: &*self.sink })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut checksum = ChecksumCapabilities::default();
        // Frames cross a real network to another stack; compute and verify
        // everything.
        checksum.ipv4 = Checksum::Both;
        checksum.tcp = Checksum::Both;
        checksum.udp = Checksum::Both;
        checksum.icmpv4 = Checksum::Both;
        checksum.icmpv6 = Checksum::Both;
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ethernet;
        caps.max_transmission_unit = self.mtu + ETHERNET_HEADER_LEN;
        caps.checksum = checksum;
        caps
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use parking_lot::Mutex;
    use smoltcp::phy::Device;

    #[derive(Default)]
    struct CollectSink(Mutex<Vec<Vec<u8>>>);
    impl FrameSink for CollectSink {
        fn transmit(&self, frame: &[u8]) {
            self.0.lock().push(frame.to_vec());
        }
    }

    #[test]
    fn rx_queue_hands_frames_to_poll() {
        let sink = Arc::new(CollectSink::default());
        let mut dev = TapDevice::new(1500, sink);
        assert!(dev.receive(Instant::from_millis(0)).is_none());
        dev.enqueue_rx(vec![1, 2, 3]);
        let (rx, _tx) = dev.receive(Instant::from_millis(0)).unwrap();
        let got = phy::RxToken::consume(rx, |buf| buf.to_vec());
        assert_eq!(got, vec![1, 2, 3]);
    }

    #[test]
    fn tx_token_delivers_to_sink() {
        let sink = Arc::new(CollectSink::default());
        let mut dev = TapDevice::new(1500, sink.clone());
        let tx = dev.transmit(Instant::from_millis(0)).unwrap();
        phy::TxToken::consume(tx, 4, |buf| buf.copy_from_slice(&[9, 9, 9, 9]));
        assert_eq!(sink.0.lock().as_slice(), &[vec![9, 9, 9, 9]]);
    }

    #[test]
    fn overflowing_rx_drops_oldest() {
        let sink = Arc::new(CollectSink::default());
        let mut dev = TapDevice::new(1500, sink);
        for i in 0..(RX_QUEUE_LIMIT + 5) {
            dev.enqueue_rx(vec![i as u8]);
        }
        assert_eq!(dev.rx_pending(), RX_QUEUE_LIMIT);
        assert_eq!(dev.rx_overruns, 5);
    }

    #[test]
    fn capabilities_cover_ethernet_header() {
        let sink = Arc::new(CollectSink::default());
        let dev = TapDevice::new(2800, sink);
        assert_eq!(dev.capabilities().max_transmission_unit, 2814);
    }
}
