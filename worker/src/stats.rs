// Counters pushed upstream every stats tick, per-second diagnostics, and
// the benchmark checkpoint records.

use std::time::Instant;

use serde::Serialize;

use treelet_shared::WorkerStatsReport;

/// Ray counters accumulated between stats pushes; reset after each push so
/// the coordinator sees deltas.
pub struct WorkerStats {
    pub start_time: Instant,
    pub rays_generated: u64,
    pub rays_processed: u64,
    pub rays_sent: u64,
    pub rays_resent: u64,
    pub rays_received: u64,
    pub finished_paths: u64,
    pub stale_responses: u64,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            rays_generated: 0,
            rays_processed: 0,
            rays_sent: 0,
            rays_resent: 0,
            rays_received: 0,
            finished_paths: 0,
            stale_responses: 0,
        }
    }

    /// Fold the queue depths in and produce the upstream report
    pub fn report(&self, queues: QueueDepths) -> WorkerStatsReport {
        WorkerStatsReport {
            timestamp_us: self.start_time.elapsed().as_micros() as u64,
            ray_queue: queues.ray,
            out_queue: queues.out,
            pending_queue: queues.pending,
            finished_queue: queues.finished,
            peers_connecting: queues.peers_connecting,
            peers_connected: queues.peers_connected,
            outstanding_udp: queues.outstanding_udp,
            queued_udp: queues.queued_udp,
            rays_generated: self.rays_generated,
            rays_processed: self.rays_processed,
            rays_sent: self.rays_sent,
            rays_resent: self.rays_resent,
            rays_received: self.rays_received,
            finished_paths: self.finished_paths,
            stale_responses: self.stale_responses,
        }
    }

    pub fn reset(&mut self) {
        let start_time = self.start_time;
        *self = Self::new();
        self.start_time = start_time;
    }
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of queue and peer depths at report time
#[derive(Default)]
pub struct QueueDepths {
    pub ray: usize,
    pub out: usize,
    pub pending: usize,
    pub finished: usize,
    pub peers_connecting: usize,
    pub peers_connected: usize,
    pub outstanding_udp: usize,
    pub queued_udp: usize,
}

/// One diagnostics line, logged locally each second
#[derive(Serialize)]
pub struct DiagnosticsReport {
    pub timestamp_us: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub queued_ray_packets: usize,
}

/// Tracks the previous endpoint counters so diagnostics report deltas
#[derive(Default)]
pub struct DiagnosticsBaseline {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Byte and packet totals over one benchmark interval
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
}

impl NetStats {
    pub fn merge(&mut self, other: &NetStats) {
        self.bytes_sent += other.bytes_sent;
        self.bytes_received += other.bytes_received;
        self.packets_sent += other.packets_sent;
        self.packets_received += other.packets_received;
    }
}

/// Everything benchmark mode records: per-second checkpoints and the
/// running totals, flushed to the log when the worker exits.
pub struct BenchmarkData {
    pub start: Instant,
    pub end: Option<Instant>,
    pub checkpoint: NetStats,
    pub checkpoints: Vec<(u64, NetStats)>,
    pub totals: NetStats,
    pub send_iface: usize,
    pub recv_iface: usize,
}

impl BenchmarkData {
    pub fn new(send_iface: usize, recv_iface: usize) -> Self {
        Self {
            start: Instant::now(),
            end: None,
            checkpoint: NetStats::default(),
            checkpoints: Vec::new(),
            totals: NetStats::default(),
            send_iface,
            recv_iface,
        }
    }

    /// Close the current interval and start the next one
    pub fn take_checkpoint(&mut self) {
        let timestamp_us = self.start.elapsed().as_micros() as u64;
        let interval = self.checkpoint;
        self.totals.merge(&interval);
        self.checkpoints.push((timestamp_us, interval));
        self.checkpoint = NetStats::default();
    }
}

#[cfg(test)]
mod stats_tests {
    use super::{BenchmarkData, NetStats, QueueDepths, WorkerStats};

    #[test]
    fn reset_clears_counters_but_keeps_the_epoch() {
        let mut stats = WorkerStats::new();
        let epoch = stats.start_time;
        stats.rays_sent = 12;
        stats.reset();
        assert_eq!(stats.rays_sent, 0);
        assert_eq!(stats.start_time, epoch);
    }

    #[test]
    fn report_carries_queue_depths() {
        let mut stats = WorkerStats::new();
        stats.rays_received = 3;
        let report = stats.report(QueueDepths {
            ray: 10,
            out: 4,
            ..QueueDepths::default()
        });
        assert_eq!(report.ray_queue, 10);
        assert_eq!(report.out_queue, 4);
        assert_eq!(report.rays_received, 3);
    }

    #[test]
    fn checkpoints_accumulate_into_totals() {
        let mut data = BenchmarkData::new(0, 1);
        data.checkpoint = NetStats {
            bytes_sent: 100,
            bytes_received: 50,
            packets_sent: 2,
            packets_received: 1,
        };
        data.take_checkpoint();
        data.checkpoint.bytes_sent = 11;
        data.take_checkpoint();

        assert_eq!(data.checkpoints.len(), 2);
        assert_eq!(data.totals.bytes_sent, 111);
        assert_eq!(data.checkpoint, NetStats::default());
    }
}
