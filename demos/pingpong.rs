// Ping-pong benchmark between two processes over a pair of queues.
//
//   cargo run --release --example pingpong -- /pp_server /pp_client --repetitions 100000
//
// The parent creates both queues, re-runs itself as a server and a client,
// waits for both, prints the totals and unlinks the queues.
use std::io::{self, Write};
use std::process::{Command, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use shmemq::ShmemQueue;
use tracing_subscriber::EnvFilter;

/// Bytes per message: an i32 type tag followed by the payload.
const DATA_SIZE: usize = 256;
const QUEUE_SIZE: usize = 1000;
const MESSAGE_TYPE: i32 = 42;

/// How long one retry round waits before re-checking the stop flag.
const POLL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum Role {
    Server,
    Client,
}

#[derive(clap::Parser)]
#[clap(about = "Round-trip messages between two processes through shared memory queues")]
struct Opts {
    /// Queue the server reads from
    server_queue: String,

    /// Queue the client reads from
    client_queue: String,

    /// Round trips to perform
    #[clap(long, default_value_t = 100_000)]
    repetitions: usize,

    #[clap(long, value_enum, hide = true)]
    role: Option<Role>,
}

fn message() -> [u8; DATA_SIZE] {
    let mut msg = [0u8; DATA_SIZE];
    msg[..4].copy_from_slice(&MESSAGE_TYPE.to_ne_bytes());
    msg[4..9].copy_from_slice(b"Hello");
    msg
}

fn open(name: &str) -> io::Result<ShmemQueue> {
    Ok(ShmemQueue::create_or_attach(name, QUEUE_SIZE, DATA_SIZE)?)
}

/// Retry `op` until it succeeds; false if a stop was requested first.
fn until(stop: &AtomicBool, mut op: impl FnMut() -> bool) -> bool {
    while !op() {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
    }
    true
}

fn progress(mark: &str, i: usize, repetitions: usize) {
    if i % (repetitions / 10).max(1) == 0 {
        print!("{mark}");
        let _ = io::stdout().flush();
    }
}

fn server(opts: &Opts, stop: &AtomicBool) -> io::Result<()> {
    let inbox = open(&opts.server_queue)?;
    let outbox = open(&opts.client_queue)?;
    println!(
        "server started on queue {} with client queue {}",
        inbox.name(),
        outbox.name()
    );

    let mut msg = message();
    for i in 0..opts.repetitions {
        if !until(stop, || inbox.dequeue_timeout(&mut msg, POLL)) {
            break;
        }
        if !until(stop, || outbox.enqueue_timeout(&msg, POLL)) {
            break;
        }
        progress("s", i, opts.repetitions);
    }

    inbox.destroy(false)?;
    outbox.destroy(false)?;
    Ok(())
}

fn client(opts: &Opts, stop: &AtomicBool) -> io::Result<()> {
    let outbox = open(&opts.server_queue)?;
    let inbox = open(&opts.client_queue)?;
    println!(
        "client started on queue {} with server queue {}",
        inbox.name(),
        outbox.name()
    );

    let mut msg = message();
    for i in 0..opts.repetitions {
        if !until(stop, || outbox.enqueue_timeout(&msg, POLL)) {
            break;
        }
        if !until(stop, || inbox.dequeue_timeout(&mut msg, POLL)) {
            break;
        }
        progress("c", i, opts.repetitions);
    }

    outbox.destroy(false)?;
    inbox.destroy(false)?;
    Ok(())
}

fn spawn(opts: &Opts, role: &str) -> io::Result<std::process::Child> {
    Command::new(std::env::current_exe()?)
        .arg(&opts.server_queue)
        .arg(&opts.client_queue)
        .arg("--repetitions")
        .arg(opts.repetitions.to_string())
        .arg("--role")
        .arg(role)
        .spawn()
}

fn report(role: &str, pid: u32, status: ExitStatus) {
    if !status.success() {
        println!("{role} {pid} did not exit successfully: {status}");
    }
}

fn run_parent(opts: &Opts) -> io::Result<()> {
    // Preallocate the queues so the children only ever attach
    let server_queue = open(&opts.server_queue)?;
    let client_queue = open(&opts.client_queue)?;

    let start = Instant::now();
    let mut server = spawn(opts, "server")?;
    let mut client = spawn(opts, "client")?;
    let (server_pid, client_pid) = (server.id(), client.id());

    report("server", server_pid, server.wait()?);
    report("client", client_pid, client.wait()?);
    let elapsed = start.elapsed();

    let packets = 2 * opts.repetitions;
    println!(
        "\n\ntotal data passed between client and server: {:.2} MB, {:.2} million packets",
        (packets * DATA_SIZE) as f64 / (1024.0 * 1024.0),
        packets as f64 / 1e6
    );
    println!(
        "elapsed {:.2?}, {:.2} million packets/s",
        elapsed,
        packets as f64 / elapsed.as_secs_f64() / 1e6
    );

    server_queue.destroy(true)?;
    client_queue.destroy(true)?;
    Ok(())
}

fn main() -> io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    // Ctrl-C reaches the whole process group; every process stops its loop and tears down
    let stop = Arc::new(AtomicBool::new(false));
    let stop_for_handler = Arc::clone(&stop);
    ctrlc::set_handler(move || stop_for_handler.store(true, Ordering::SeqCst))
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    match opts.role {
        Some(Role::Server) => server(&opts, &stop),
        Some(Role::Client) => client(&opts, &stop),
        None => run_parent(&opts),
    }
}
