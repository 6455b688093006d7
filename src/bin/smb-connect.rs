//! Connect to an SMB server and watch its framing

use clap::Parser;
use rust_smb_async::async_req::Scheduler;
use rust_smb_async::config::{ConnectConfig, SocketOptions};
use rust_smb_async::net::io::write_all_recv;
use rust_smb_async::net::{connect_any_recv, connect_any_send};
use rust_smb_async::netbios::{read_frame_recv, read_frame_send, write_keepalive_send};
use rust_smb_async::transport::SocketTransport;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "smb-connect")]
#[command(about = "Connect with retry and read NetBIOS frames", long_about = None)]
struct Args {
    /// SMB server address or hostname
    #[arg(short = 'H', long)]
    host: String,

    /// Port to connect to
    #[arg(short = 'p', long, default_value = "445")]
    port: u16,

    /// Overall connect deadline in milliseconds
    #[arg(short = 't', long, default_value = "5000")]
    timeout_ms: u64,

    /// Delay between racing consecutive resolved addresses, in milliseconds
    #[arg(long, default_value = "0")]
    stagger_ms: u64,

    /// Socket options, e.g. "TCP_NODELAY SO_KEEPALIVE"
    #[arg(short = 'O', long, default_value = "")]
    socket_options: SocketOptions,

    /// Send a keepalive frame once connected
    #[arg(short = 'k', long)]
    keepalive: bool,

    /// Number of frames to read before exiting
    #[arg(short = 'n', long, default_value = "0")]
    frames: usize,

    /// Log level
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let addrs: Vec<SocketAddr> = (args.host.as_str(), args.port).to_socket_addrs()?.collect();
    tracing::info!("{} resolved to {:?}", args.host, addrs);

    let config = ConnectConfig {
        timeout: Duration::from_millis(args.timeout_ms),
        stagger: Duration::from_millis(args.stagger_ms),
        socket_options: args.socket_options.clone(),
        ..ConnectConfig::default()
    };

    let sched = Scheduler::new()?;
    let req = connect_any_send(&sched, &addrs, &config)?;
    sched.wait(&req);
    let (index, socket) = connect_any_recv(&req)?;
    drop(req);

    let transport = SocketTransport::new(socket)?;
    tracing::info!(
        "Connected to {} (candidate {}) from {}",
        transport.peer_addr()?,
        index,
        transport.local_addr()?
    );

    if args.keepalive {
        let req = write_keepalive_send(&sched, &transport)?;
        sched.wait(&req);
        write_all_recv(&req)?;
        tracing::info!("Sent keepalive");
    }

    for n in 0..args.frames {
        let req = read_frame_send(&sched, &transport)?;
        sched.wait(&req);
        let skipped = req.data().keepalives();
        let frame = read_frame_recv(&req)?;
        tracing::info!(
            "Frame {}: type 0x{:02x}, {} payload bytes, {} keepalive(s) skipped",
            n,
            frame.kind(),
            frame.payload().len(),
            skipped
        );
    }

    Ok(())
}
