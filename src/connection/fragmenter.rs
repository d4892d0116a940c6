//! Packetised characteristic writes
//!
//! Payloads longer than the configured packet size are split into
//! sequential chunks. In acknowledged mode a chunk is only sent once the
//! previous one was confirmed; in burst mode chunks go out back to back and
//! the write completes once the last one has been submitted.

use std::collections::VecDeque;
use std::time::Duration;

use crate::ble::gatt::CharacteristicId;
use crate::ble::transport::WriteType;

/// Split `payload` into chunks of at most `size` bytes.
pub fn split(payload: &[u8], size: usize) -> VecDeque<Vec<u8>> {
    payload.chunks(size.max(1)).map(<[u8]>::to_vec).collect()
}

/// What to do after a chunk was handed to the transport.
#[derive(Debug, PartialEq, Eq)]
pub enum AfterSubmit {
    /// Wait for the peer to confirm this chunk.
    AwaitAck,
    /// Send the next chunk after the packet delay.
    SendNext(Duration),
    /// Every chunk is out; the write is done.
    Done,
}

/// What to do after the peer confirmed a chunk.
#[derive(Debug, PartialEq, Eq)]
pub enum AfterAck {
    SendNext(Duration),
    Done,
}

#[derive(Debug)]
pub struct FragmentedWrite {
    target: CharacteristicId,
    write_type: WriteType,
    remaining: VecDeque<Vec<u8>>,
    wait_ack: bool,
    packet_delay: Duration,
    awaiting_ack: bool,
    sent: usize,
}

impl FragmentedWrite {
    pub fn new(
        target: CharacteristicId,
        payload: &[u8],
        package_size: usize,
        write_type: WriteType,
        wait_ack: bool,
        packet_delay: Duration,
    ) -> Self {
        Self {
            target,
            write_type,
            remaining: split(payload, package_size),
            wait_ack,
            packet_delay,
            awaiting_ack: false,
            sent: 0,
        }
    }

    pub fn target(&self) -> &CharacteristicId {
        &self.target
    }

    pub fn write_type(&self) -> WriteType {
        self.write_type
    }

    /// Take the next chunk to submit, unless one is still unconfirmed.
    pub fn next_chunk(&mut self) -> Option<Vec<u8>> {
        if self.awaiting_ack {
            return None;
        }
        self.remaining.pop_front()
    }

    /// Record that the chunk from `next_chunk` was accepted by the transport.
    pub fn submitted(&mut self) -> AfterSubmit {
        self.sent += 1;
        if self.wait_ack {
            self.awaiting_ack = true;
            AfterSubmit::AwaitAck
        } else if self.remaining.is_empty() {
            AfterSubmit::Done
        } else {
            AfterSubmit::SendNext(self.packet_delay)
        }
    }

    pub fn is_awaiting_ack(&self) -> bool {
        self.awaiting_ack
    }

    /// Record a confirmation for the outstanding chunk.
    pub fn acknowledged(&mut self) -> AfterAck {
        self.awaiting_ack = false;
        if self.remaining.is_empty() {
            AfterAck::Done
        } else {
            AfterAck::SendNext(self.packet_delay)
        }
    }

    pub fn packets_sent(&self) -> usize {
        self.sent
    }

    pub fn packets_remaining(&self) -> usize {
        self.remaining.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::gatt::uuid_from_short;

    fn target() -> CharacteristicId {
        CharacteristicId::new(uuid_from_short(0xFFE0), uuid_from_short(0xFFE1))
    }

    #[test]
    fn test_split_sizes() {
        let payload: Vec<u8> = (0..45).collect();
        let chunks = split(&payload, 20);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 20);
        assert_eq!(chunks[2], (40..45).collect::<Vec<u8>>());

        assert_eq!(split(&payload, 45).len(), 1);
        assert_eq!(split(&payload[..40], 20).len(), 2);
        assert_eq!(split(&payload[..3], 0).len(), 3);
    }

    #[test]
    fn test_ack_mode_waits_for_each_chunk() {
        let delay = Duration::from_millis(5);
        let mut write = FragmentedWrite::new(target(), &[0u8; 50], 20, WriteType::Default, true, delay);

        assert_eq!(write.next_chunk().map(|c| c.len()), Some(20));
        assert_eq!(write.submitted(), AfterSubmit::AwaitAck);
        assert!(write.next_chunk().is_none(), "blocked until ack");

        assert_eq!(write.acknowledged(), AfterAck::SendNext(delay));
        assert_eq!(write.next_chunk().map(|c| c.len()), Some(20));
        write.submitted();
        assert_eq!(write.acknowledged(), AfterAck::SendNext(delay));
        assert_eq!(write.next_chunk().map(|c| c.len()), Some(10));
        write.submitted();
        assert_eq!(write.acknowledged(), AfterAck::Done);
        assert_eq!(write.packets_sent(), 3);
    }

    #[test]
    fn test_burst_mode_runs_to_completion() {
        let delay = Duration::from_millis(2);
        let mut write =
            FragmentedWrite::new(target(), &[1u8; 41], 20, WriteType::NoResponse, false, delay);

        write.next_chunk().unwrap();
        assert_eq!(write.submitted(), AfterSubmit::SendNext(delay));
        write.next_chunk().unwrap();
        assert_eq!(write.submitted(), AfterSubmit::SendNext(delay));
        assert_eq!(write.next_chunk().map(|c| c.len()), Some(1));
        assert_eq!(write.submitted(), AfterSubmit::Done);
        assert!(!write.is_awaiting_ack());
        assert_eq!(write.packets_remaining(), 0);
    }
}
