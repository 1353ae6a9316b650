use std::net::ToSocketAddrs;

use anyhow::{bail, Context};
use clap::Parser;

use treelet_worker::config::{FinishedRayAction, WorkerConfig};
use treelet_worker::scene::NullSceneBuilder;
use treelet_worker::storage::open_store;
use treelet_worker::Worker;

#[derive(Debug, Parser)]
#[command(name = "treelet-worker", about = "Worker node of the treelet render cluster")]
struct Args {
    /// IP or hostname of the coordinator
    #[arg(short = 'i', long = "ip")]
    ip: String,

    /// Port of the coordinator
    #[arg(short = 'p', long = "port", default_value_t = 50000)]
    port: u16,

    /// Storage backend URI (file://PATH, a bare path, or mem://)
    #[arg(short = 's', long = "storage-backend")]
    storage_backend: String,

    /// Send ray packets reliably
    #[arg(short = 'R', long = "reliable-udp")]
    reliable_udp: bool,

    /// Maximum UDP rate per endpoint (Mb/s)
    #[arg(short = 'M', long = "max-udp-rate", default_value_t = 80)]
    max_udp_rate: u64,

    /// Samples per pixel (0 keeps the sampler's default)
    #[arg(short = 'S', long = "samples", default_value_t = 0)]
    samples: u32,

    /// Fraction of rays sampled into the ray trace log
    #[arg(short = 'L', long = "log-rays", default_value_t = 0.0)]
    log_rays: f64,

    /// Fraction of packets sampled into the packet trace log
    #[arg(short = 'P', long = "log-packets", default_value_t = 0.0)]
    log_packets: f64,

    /// Finished-ray policy: 0 discard, 1 send back, 2 upload
    #[arg(short = 'f', long = "finished-ray", default_value_t = 0)]
    finished_ray: u8,

    /// Finished rays accumulated before a Discard pass clears them
    #[arg(long = "discard-threshold", default_value_t = treelet_shared::DEFAULT_DISCARD_THRESHOLD)]
    discard_threshold: usize,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if !(0.0..=1.0).contains(&args.log_rays) || !(0.0..=1.0).contains(&args.log_packets) {
        bail!("log rates must be within [0, 1]");
    }
    if args.max_udp_rate == 0 {
        bail!("max UDP rate must be positive");
    }
    let finished_ray_action = FinishedRayAction::from_index(args.finished_ray)
        .context("finished-ray action must be 0, 1, or 2")?;

    let coordinator_addr = (args.ip.as_str(), args.port)
        .to_socket_addrs()
        .context("resolving coordinator address")?
        .next()
        .context("coordinator address resolved to nothing")?;

    let store = open_store(&args.storage_backend)?;
    let config = WorkerConfig {
        send_reliably: args.reliable_udp,
        max_udp_rate_mbps: args.max_udp_rate,
        samples_per_pixel: args.samples,
        finished_ray_action,
        ray_log_rate: args.log_rays,
        packet_log_rate: args.log_packets,
        discard_threshold: args.discard_threshold,
    };

    let mut worker = Worker::new(
        coordinator_addr,
        "0.0.0.0",
        config,
        store,
        Box::new(NullSceneBuilder),
    )
    .context("starting worker")?;

    let result = worker.run();
    worker.upload_logs();
    result.context("worker terminated abnormally")?;
    Ok(())
}
