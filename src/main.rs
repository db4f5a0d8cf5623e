//! Shadowsocks gateway daemon: one listen address, TCP relay always, UDP
//! relay whenever the configured cipher can carry datagrams.

// Use mimalloc as global allocator for better p99 latency
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use ss_gateway::{cipher_list, PacketServer, Server};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "ss-gateway")]
#[command(about = "Shadowsocks tunnel server")]
struct Args {
    /// Listen on the address
    #[arg(short = 'a', default_value = ":8379")]
    address: String,

    /// Cipher method
    #[arg(short = 'c', default_value = "chacha20-ietf-poly1305")]
    cipher: String,

    /// Your password
    #[arg(short = 'p', default_value = "password")]
    password: String,
}

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .enable_all()
        .thread_name("ss-gateway-worker")
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ss_gateway=info".parse()?),
        )
        .init();

    let args = Args::parse();
    info!("available ciphers: {}", cipher_list().join(", "));

    let tcp = match Server::new(&args.cipher, &args.password) {
        Ok(server) => server,
        Err(e) => {
            error!("invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    // AEAD methods have no one-shot packet form; serve TCP alone then.
    let udp = match PacketServer::new(&args.cipher, &args.password) {
        Ok(server) => Some(server),
        Err(e) => {
            warn!("UDP relay disabled: {}", e);
            None
        }
    };

    let address = args.address.clone();
    let udp_task = async {
        match &udp {
            Some(server) => server.listen_and_serve(&address).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        result = tcp.listen_and_serve(&args.address) => {
            if let Err(e) = result {
                error!("TCP relay failed: {}", e);
            }
            std::process::exit(1);
        }
        result = udp_task => {
            if let Err(e) = result {
                error!("UDP relay failed: {}", e);
            }
            std::process::exit(1);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    Ok(())
}
