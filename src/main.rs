use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ccgate::fetch::ResolveMode;
use ccgate::proxy::{Config, Proxy};

#[derive(Parser, Debug)]
#[command(name = "ccgate", version, about = "HTTP forwarding proxy with a content-centric fetch path")]
struct Args {
    /// Port to listen on for client connections.
    #[clap(long, default_value_t = 8080, value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,
    /// Root namespace for content names on the fetch channel.
    #[clap(long, default_value = "TestCCN")]
    content_root: String,
    /// Address of the local content daemon.
    #[clap(long, default_value = "127.0.0.1:9695")]
    content_daemon: SocketAddr,
    /// Host routing list; a missing file means every host uses plain HTTP.
    #[clap(long, default_value = "ccgate.list")]
    route_file: PathBuf,
    /// Keep-alive seconds assumed when a peer does not say.
    #[clap(long, default_value_t = 13, value_parser = clap::value_parser!(i64).range(1..=120))]
    keep_alive: i64,
    /// Seconds a stalled read may sit before the request is torn down.
    #[clap(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..=120))]
    timeout_secs: u64,
    /// Concurrent origin connections allowed per host.
    #[clap(long, default_value_t = 2, value_parser = clap::value_parser!(u32).range(1..=16))]
    max_conn: u32,
    /// Strip Proxy-Connection headers before forwarding.
    #[clap(long)]
    remove_proxy: bool,
    /// Leave the Host header in place instead of rewriting it.
    #[clap(long)]
    keep_host: bool,
    /// Rebuild the Host header from the request line's host.
    #[clap(long)]
    host_from_get: bool,
    /// Version resolution for fetch-channel names.
    #[clap(long, value_enum, default_value_t = ResolveArg::Highest)]
    resolve: ResolveArg,
    /// Log at debug level.
    #[clap(long)]
    debug: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum ResolveArg {
    Default,
    High,
    Highest,
}

impl From<ResolveArg> for ResolveMode {
    fn from(a: ResolveArg) -> ResolveMode {
        match a {
            ResolveArg::Default => ResolveMode::Default,
            ResolveArg::High => ResolveMode::High,
            ResolveArg::Highest => ResolveMode::Highest,
        }
    }
}

fn main() {
    let args = Args::parse();

    // a dead client mid-write must not kill the process
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let default = if args.debug { "ccgate=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cfg = Config {
        port: args.port,
        content_root: args.content_root,
        content_daemon: args.content_daemon,
        route_file: args.route_file,
        default_keep_alive: args.keep_alive,
        timeout_secs: args.timeout_secs,
        max_conn: args.max_conn,
        remove_proxy: args.remove_proxy,
        // --host-from-get implies rewriting, whatever --keep-host says
        remove_host: !args.keep_host || args.host_from_get,
        host_from_get: args.host_from_get,
        resolve: args.resolve.into(),
    };

    let mut proxy = match Proxy::new(cfg) {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "startup failed");
            process::exit(1);
        }
    };
    info!("ccgate running");
    if let Err(e) = proxy.run() {
        error!(error = %e, "dispatch loop failed");
        process::exit(1);
    }
}
