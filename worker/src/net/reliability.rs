// Per-peer sequencing state and the retransmission ledger.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;

use treelet_shared::{AckEntry, SeqNo};

use super::packet::RayPacket;

/// Everything the reliable-UDP layer remembers between ticks. All state is
/// keyed by the remote address a packet travels to or from; sequence
/// numbers are per-peer and never reused within a job.
#[derive(Default)]
pub struct Reliability {
    /// Next sequence number to assign, per destination
    sequence_numbers: HashMap<SocketAddr, SeqNo>,
    /// Inbound reliable packets awaiting an ack, per source
    to_be_acked: HashMap<SocketAddr, Vec<AckEntry>>,
    /// Sequence numbers already delivered, per source (duplicate suppression)
    received_seq_nos: HashMap<SocketAddr, HashSet<SeqNo>>,
    /// Sequence numbers our peers have acknowledged, per destination
    received_acks: HashMap<SocketAddr, HashSet<SeqNo>>,
    /// Reliable packets on the wire, front-ordered by retransmit deadline
    outstanding: VecDeque<(Instant, RayPacket)>,
    next_ack_id: SeqNo,
}

impl Reliability {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next sequence number on the link to `destination`
    pub fn next_seq_no(&mut self, destination: SocketAddr) -> SeqNo {
        let counter = self.sequence_numbers.entry(destination).or_insert(0);
        let seq_no = *counter;
        *counter += 1;
        seq_no
    }

    pub fn next_ack_id(&mut self) -> SeqNo {
        let ack_id = self.next_ack_id;
        self.next_ack_id += 1;
        ack_id
    }

    /// Record an inbound reliable packet for the next ack batch. Returns
    /// false for a duplicate, whose payload the caller must discard (the
    /// ack is still owed).
    pub fn note_received(&mut self, source: SocketAddr, entry: AckEntry) -> bool {
        self.to_be_acked.entry(source).or_default().push(entry);
        self.received_seq_nos
            .entry(source)
            .or_default()
            .insert(entry.seq_no)
    }

    /// Record an ack our peer sent for one of our sequence numbers
    pub fn note_acked(&mut self, destination: SocketAddr, seq_no: SeqNo) {
        self.received_acks
            .entry(destination)
            .or_default()
            .insert(seq_no);
    }

    pub fn has_pending_acks(&self) -> bool {
        !self.to_be_acked.is_empty()
    }

    pub fn take_pending_acks(&mut self) -> HashMap<SocketAddr, Vec<AckEntry>> {
        std::mem::take(&mut self.to_be_acked)
    }

    /// Park a reliable packet until its ack or its deadline
    pub fn push_outstanding(&mut self, deadline: Instant, packet: RayPacket) {
        self.outstanding.push_back((deadline, packet));
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    /// Whether the head of the retransmission ledger is due
    pub fn front_due(&self, now: Instant) -> bool {
        self.outstanding
            .front()
            .is_some_and(|(deadline, _)| *deadline <= now)
    }

    /// Walk expired entries off the front of the ledger. Acked packets are
    /// dropped; the rest come back with their attempt counter bumped and
    /// the retransmission flag set, ready to re-enter the send queue.
    pub fn collect_due(&mut self, now: Instant) -> Vec<RayPacket> {
        let mut due = Vec::new();

        while self.front_due(now) {
            let (_, mut packet) = self
                .outstanding
                .pop_front()
                .expect("front_due implies a front entry");

            let acked = self
                .received_acks
                .get(&packet.destination)
                .is_some_and(|acks| acks.contains(&packet.seq_no()));
            if acked {
                continue;
            }

            packet.message.attempt += 1;
            packet.retransmission = true;
            due.push(packet);
        }

        due
    }

    pub fn acked(&self, destination: SocketAddr, seq_no: SeqNo) -> bool {
        self.received_acks
            .get(&destination)
            .is_some_and(|acks| acks.contains(&seq_no))
    }
}

#[cfg(test)]
mod reliability_tests {
    use super::Reliability;
    use crate::net::packet::RayPacket;
    use std::net::SocketAddr;
    use std::time::{Duration, Instant};
    use treelet_shared::{AckEntry, Message, OpCode};

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn packet(destination: SocketAddr, seq_no: u64) -> RayPacket {
        RayPacket {
            destination,
            destination_id: 2,
            target_treelet: 5,
            ray_count: 1,
            message: Message::reliable(1, OpCode::SendRays, vec![0; 64], seq_no, false),
            retransmission: false,
            tracked_rays: Vec::new(),
        }
    }

    #[test]
    fn sequence_numbers_are_monotonic_per_destination() {
        let mut reliability = Reliability::new();
        let a = addr(9001);
        let b = addr(9002);

        assert_eq!(reliability.next_seq_no(a), 0);
        assert_eq!(reliability.next_seq_no(a), 1);
        assert_eq!(reliability.next_seq_no(b), 0);
        assert_eq!(reliability.next_seq_no(a), 2);
    }

    #[test]
    fn duplicate_delivery_is_detected_but_still_owed_an_ack() {
        let mut reliability = Reliability::new();
        let source = addr(9001);
        let entry = AckEntry {
            seq_no: 17,
            tracked: false,
            attempt: 1,
        };

        assert!(reliability.note_received(source, entry));
        assert!(!reliability.note_received(source, entry));

        // Both deliveries are owed an ack.
        let pending = reliability.take_pending_acks();
        assert_eq!(pending[&source].len(), 2);
        assert!(!reliability.has_pending_acks());
    }

    #[test]
    fn expired_unacked_packets_come_back_for_retransmission() {
        let mut reliability = Reliability::new();
        let destination = addr(9001);
        let now = Instant::now();

        reliability.push_outstanding(now, packet(destination, 42));
        assert!(reliability.front_due(now));

        let due = reliability.collect_due(now);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].seq_no(), 42);
        assert_eq!(due[0].attempt(), 2);
        assert!(due[0].retransmission);
        assert_eq!(reliability.outstanding_len(), 0);
    }

    #[test]
    fn acked_packets_are_dropped_from_the_ledger() {
        let mut reliability = Reliability::new();
        let destination = addr(9001);
        let now = Instant::now();

        reliability.push_outstanding(now, packet(destination, 7));
        reliability.note_acked(destination, 7);

        assert!(reliability.collect_due(now).is_empty());
        assert_eq!(reliability.outstanding_len(), 0);
    }

    #[test]
    fn undue_packets_stay_parked() {
        let mut reliability = Reliability::new();
        let destination = addr(9001);
        let now = Instant::now();
        let later = now + Duration::from_secs(1);

        reliability.push_outstanding(later, packet(destination, 3));
        assert!(!reliability.front_due(now));
        assert!(reliability.collect_due(now).is_empty());
        assert_eq!(reliability.outstanding_len(), 1);
    }

    #[test]
    fn retransmission_reuses_the_sequence_number() {
        let mut reliability = Reliability::new();
        let destination = addr(9001);
        let now = Instant::now();

        reliability.push_outstanding(now, packet(destination, 42));
        let due = reliability.collect_due(now);

        // An ack for either attempt resolves the entry on the next pass.
        reliability.push_outstanding(now, due.into_iter().next().unwrap());
        reliability.note_acked(destination, 42);
        assert!(reliability.collect_due(now).is_empty());
        assert_eq!(reliability.outstanding_len(), 0);
    }
}
