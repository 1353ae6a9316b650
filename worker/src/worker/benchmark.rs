// Benchmark mode: the worker becomes a pure traffic generator between two
// endpoints until the duration timer cancels the loop. Terminal; the
// checkpoints are flushed to the log on exit.

use std::net::SocketAddr;
use std::time::Duration;

use log::{error, info};

use treelet_shared::{Message, OpCode, StartBenchmark, Timer, BENCHMARK_PING_BYTES};

use crate::error::WorkerError;
use crate::poller::{ActionKind, ActionResult, ActionSource, Direction, TimerId};
use crate::stats::BenchmarkData;
use crate::worker::Worker;

/// Live benchmark state: the measurement records plus the prebuilt flood
/// packet and its destinations.
pub struct BenchmarkRuntime {
    pub data: BenchmarkData,
    pub destinations: [SocketAddr; 2],
    pub packet: Vec<u8>,
}

impl Worker {
    /// Swap the steady-state action table for the traffic generator
    pub(crate) fn init_benchmark(&mut self, request: &StartBenchmark) -> Result<(), WorkerError> {
        let peer = self
            .peers
            .get(request.destination)
            .ok_or(WorkerError::UnknownBenchmarkPeer {
                id: request.destination,
            })?;
        let destinations = peer.addresses;

        let send_iface = (request.address_no.min(1)) as usize;
        let recv_iface = 1 - send_iface;
        info!(
            "benchmark: {}s of pings to worker {} out of endpoint {}",
            request.duration_secs, request.destination, send_iface
        );

        self.deactivate_actions(&[
            ActionKind::RayQueue,
            ActionKind::OutQueue,
            ActionKind::FinishedQueue,
            ActionKind::Peers,
            ActionKind::NeededTreelets,
            ActionKind::FinishedPaths,
            ActionKind::UdpReceive(0),
            ActionKind::UdpReceive(1),
            ActionKind::UdpSend(0),
            ActionKind::UdpSend(1),
            ActionKind::RayAcks,
            ActionKind::WorkerStats,
            ActionKind::Diagnostics,
        ]);

        if request.rate_mbps > 0 {
            self.endpoints[recv_iface].set_rate(request.rate_mbps as u64);
        }

        let packet = Message::new(
            self.my_id(),
            OpCode::Ping,
            vec![b'x'; BENCHMARK_PING_BYTES],
        )
        .encode();

        self.benchmark = Some(BenchmarkRuntime {
            data: BenchmarkData::new(send_iface, recv_iface),
            destinations,
            packet,
        });

        self.timers.insert(
            TimerId::BenchmarkDone,
            Timer::new(Duration::from_secs(request.duration_secs as u64)),
        );
        self.timers.insert(
            TimerId::BenchmarkCheckpoint,
            Timer::new(Duration::from_secs(1)),
        );

        for iface in 0..2 {
            self.register_action(
                ActionSource::Udp {
                    iface,
                    direction: Direction::In,
                },
                ActionKind::BenchmarkReceive(iface),
            );
        }
        for iface in 0..2 {
            self.register_action(
                ActionSource::Udp {
                    iface,
                    direction: Direction::Out,
                },
                ActionKind::BenchmarkSend(iface),
            );
        }
        self.register_action(
            ActionSource::Timer(TimerId::BenchmarkCheckpoint),
            ActionKind::BenchmarkCheckpoint,
        );
        self.register_action(
            ActionSource::Timer(TimerId::BenchmarkDone),
            ActionKind::BenchmarkDone,
        );

        Ok(())
    }

    pub(crate) fn handle_benchmark_send(&mut self, iface: usize) -> Result<ActionResult, WorkerError> {
        let Worker {
            endpoints,
            benchmark,
            ..
        } = self;
        let Some(bench) = benchmark.as_mut() else {
            return Ok(ActionResult::Continue);
        };

        endpoints[iface]
            .send(bench.destinations[iface], &bench.packet)
            .map_err(WorkerError::Udp)?;
        if iface == bench.data.send_iface {
            bench.data.checkpoint.bytes_sent += bench.packet.len() as u64;
            bench.data.checkpoint.packets_sent += 1;
        }
        Ok(ActionResult::Continue)
    }

    pub(crate) fn handle_benchmark_receive(
        &mut self,
        iface: usize,
    ) -> Result<ActionResult, WorkerError> {
        let Worker {
            endpoints,
            benchmark,
            ..
        } = self;
        let Some(bench) = benchmark.as_mut() else {
            return Ok(ActionResult::Continue);
        };

        let received = endpoints[iface].try_recv().map_err(WorkerError::Udp)?;
        if let Some((_, data)) = received {
            if iface == bench.data.recv_iface {
                bench.data.checkpoint.bytes_received += data.len() as u64;
                bench.data.checkpoint.packets_received += 1;
            }
        }
        Ok(ActionResult::Continue)
    }

    pub(crate) fn handle_benchmark_checkpoint(&mut self) -> Result<ActionResult, WorkerError> {
        self.timer_reset(TimerId::BenchmarkCheckpoint);
        if let Some(bench) = self.benchmark.as_mut() {
            bench.data.take_checkpoint();
        }
        Ok(ActionResult::Continue)
    }

    /// The duration elapsed: stop the generator and cancel the loop
    pub(crate) fn handle_benchmark_done(&mut self) -> Result<ActionResult, WorkerError> {
        self.deactivate_actions(&[
            ActionKind::BenchmarkReceive(0),
            ActionKind::BenchmarkReceive(1),
            ActionKind::BenchmarkSend(0),
            ActionKind::BenchmarkSend(1),
            ActionKind::BenchmarkCheckpoint,
        ]);
        if let Some(bench) = self.benchmark.as_mut() {
            bench.data.end = Some(std::time::Instant::now());
        }
        Ok(ActionResult::CancelAll)
    }

    /// Best-effort final log flush and upload; called by the binary after
    /// `run` returns, successful or not.
    pub fn upload_logs(&mut self) {
        let Some(worker_id) = self.worker_id else {
            return;
        };

        let mut summary = String::new();

        if let Some(bench) = self.benchmark.as_mut() {
            bench.data.take_checkpoint();
            let elapsed = bench
                .data
                .end
                .unwrap_or_else(std::time::Instant::now)
                .duration_since(bench.data.start);
            info!(target: "bench", "duration_ms {}", elapsed.as_millis());
            for (timestamp_us, interval) in &bench.data.checkpoints {
                info!(
                    target: "bench",
                    "checkpoint {} {} {} {} {}",
                    timestamp_us,
                    interval.bytes_sent,
                    interval.bytes_received,
                    interval.packets_sent,
                    interval.packets_received
                );
                summary.push_str(&format!(
                    "checkpoint {} {} {} {} {}\n",
                    timestamp_us,
                    interval.bytes_sent,
                    interval.bytes_received,
                    interval.packets_sent,
                    interval.packets_received
                ));
            }
            let totals = bench.data.totals;
            info!(
                target: "bench",
                "totals {} {} {} {}",
                totals.bytes_sent, totals.bytes_received, totals.packets_sent, totals.packets_received
            );
            summary.push_str(&format!(
                "totals {} {} {} {}\n",
                totals.bytes_sent, totals.bytes_received, totals.packets_sent, totals.packets_received
            ));
        }

        let job_id = self.job_id.clone().unwrap_or_default();
        let key = format!("logs/{job_id}/{worker_id}.INFO");
        if let Err(err) = self.store.put(&key, summary.as_bytes()) {
            error!("log upload failed: {err}");
        }
    }
}
