use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;

use clap::Parser;
use log::{error, info, warn, LevelFilter};
use simple_logger::SimpleLogger;

use peridem::command::Command;
use peridem::config::Parameters;
use peridem::error::{Error, Result};
use peridem::message::tcp::{TcpCommunicator, TcpHost};
use peridem::message::ChannelCommunicator;
use peridem::snapshot::Snapshot;

#[derive(Debug, Parser)]
#[clap(version, about = "Distributed discrete element and peridynamics simulation")]
struct Opts {
    /// The simulation to run
    #[clap(arg_enum)]
    command: Command,

    /// JSON parameter file
    #[clap(short, long)]
    config: PathBuf,

    /// Number of ranks to run as threads of this process
    #[clap(short = 'n', long, default_value = "1", conflicts_with = "rank")]
    ranks: usize,

    /// Rank of this process in a TCP run
    #[clap(short, long, requires = "peers")]
    rank: Option<usize>,

    /// Listening address of every rank in a TCP run, in rank order
    #[clap(short, long, multiple_values = true)]
    peers: Vec<SocketAddr>,

    /// One of off, error, warn, info, debug, trace
    #[clap(short, long, default_value = "info")]
    log_level: String,
}

fn main() {
    let opts = Opts::parse();

    let level: LevelFilter = match opts.log_level.parse() {
        Ok(level) => level,
        Err(_) => {
            eprintln!("unknown log level '{}'", opts.log_level);
            process::exit(2);
        }
    };
    if let Err(e) = SimpleLogger::new().with_level(level).init() {
        eprintln!("logger already installed: {}", e);
    }

    if let Err(e) = run(opts) {
        error!("{}", e);
        process::exit(1);
    }
}

fn run(opts: Opts) -> Result<()> {
    let params = Parameters::load_json(&opts.config)?;
    let stop = Arc::new(AtomicBool::new(false));

    if let Err(e) = signal_hook::flag::register(signal_hook::consts::SIGINT, stop.clone()) {
        warn!("interrupt handler not installed: {}", e);
    }

    match opts.rank {
        Some(rank) => run_tcp(opts.command, rank, opts.peers, &params, stop),
        None => run_local(opts.command, opts.ranks, &params, stop),
    }
}

fn run_local(command: Command, ranks: usize, params: &Parameters, stop: Arc<AtomicBool>) -> Result<()> {
    let handles: Vec<_> = ChannelCommunicator::cluster(ranks)
        .into_iter()
        .map(|comm| {
            let params = params.clone();
            let stop = stop.clone();
            thread::spawn(move || command.execute(comm, &params, stop))
        })
        .collect();

    // Rank 0 is joined first: if it fails, the other ranks may be blocked
    // waiting on it, and the error ends the process.
    for handle in handles {
        let last = handle.join().unwrap_or_else(|e| std::panic::resume_unwind(e))?;
        report(last);
    }
    Ok(())
}

fn run_tcp(
    command: Command,
    rank: usize,
    peers: Vec<SocketAddr>,
    params: &Parameters,
    stop: Arc<AtomicBool>,
) -> Result<()> {
    if rank >= peers.len() {
        return Err(Error::Topology(format!(
            "rank {} is not in a peer list of {} addresses",
            rank,
            peers.len()
        )));
    }
    let local = peers[rank].to_string();
    let (mut host, send_sink, recv_src) = TcpHost::new(rank, peers.clone());
    let comm = TcpCommunicator::new(rank, peers, send_sink, recv_src);
    let last = command.execute(comm, params, stop);
    let flushed = host.join();

    report(last?);
    flushed.map_err(|e| Error::io(local, e))
}

fn report(last: Option<Snapshot>) {
    if let Some(last) = last {
        info!(
            "finished at iteration {} (t = {:e}) with {} particles",
            last.iteration, last.time, last.num_particles
        );
    }
}
