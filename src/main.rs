use std::env;
use std::error::Error;
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;

use getopts::Options;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dnswire::dns::client::{DnsClient, DnsTcpClient};
use dnswire::dns::context::{ServerContext, TransportConfig};
use dnswire::dns::hosts::{HostsAuthority, HostsFile};
use dnswire::dns::protocol::{DnsMessage, DnsQuestion, QueryType};
use dnswire::dns::tcp::DnsTcpServer;

fn print_usage(program: &str, opts: &Options) {
    let brief = format!(
        "Usage: {} serve [options]\n       {} query -s SERVER NAME [TYPE]",
        program, program
    );
    print!("{}", opts.usage(&brief));
}

/// `--log-level` wins over `RUST_LOG`; anything unparsable falls back to info.
fn log_filter(level: Option<String>) -> EnvFilter {
    match level {
        Some(level) => EnvFilter::try_new(level).ok(),
        None => EnvFilter::try_from_default_env().ok(),
    }
    .unwrap_or_else(|| EnvFilter::new("info"))
}

fn init_logging(level: Option<String>) {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(level))
        .with_target(true)
        .init();
}

fn load_config(path: Option<String>) -> Result<TransportConfig, Box<dyn Error>> {
    match path {
        Some(path) => Ok(TransportConfig::load(path)?),
        None => Ok(TransportConfig::default()),
    }
}

async fn serve(config: TransportConfig, hosts_path: Option<String>) -> Result<(), Box<dyn Error>> {
    let hosts = match hosts_path {
        Some(path) => HostsFile::load(&path)?,
        None => {
            warn!("no hosts file given, every query will get NXDOMAIN");
            HostsFile::default()
        }
    };
    info!(entries = hosts.len(), "hosts table loaded");

    let listen = config.listen;
    let context = Arc::new(ServerContext::new(config));

    let shutdown = context.shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received ctrl-c, shutting down"),
            Err(e) => error!(error = %e, "failed to listen for ctrl-c"),
        }
        shutdown.cancel();
    });

    let server = Arc::new(DnsTcpServer::new(
        context,
        Arc::new(HostsAuthority::new(hosts)),
    ));
    server.listen(listen).await?;

    Ok(())
}

async fn query(
    config: TransportConfig,
    server: SocketAddr,
    name: &str,
    qtype: QueryType,
) -> Result<(), Box<dyn Error>> {
    let client = DnsTcpClient::new(config);
    let request = DnsMessage::query(rand::random(), DnsQuestion::new(name, qtype));

    let response = client
        .send_query(server, &request, &CancellationToken::new())
        .await?;
    println!("{}", response);

    Ok(())
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    let program = args.first().cloned().unwrap_or_else(|| "dnswire".to_string());

    let mut opts = Options::new();
    opts.optopt("c", "config", "transport configuration (json)", "FILE");
    opts.optopt("l", "listen", "address to listen on", "ADDR");
    opts.optopt("H", "hosts", "hosts file to serve", "FILE");
    opts.optopt("s", "server", "server to query", "ADDR");
    opts.optopt("", "log-level", "log filter, overrides RUST_LOG", "FILTER");
    opts.optflag("h", "help", "print this help menu");

    let matches = match opts.parse(args.iter().skip(1)) {
        Ok(m) => m,
        Err(f) => {
            eprintln!("{}", f);
            print_usage(&program, &opts);
            process::exit(2);
        }
    };
    if matches.opt_present("h") || matches.free.is_empty() {
        print_usage(&program, &opts);
        return;
    }

    init_logging(matches.opt_str("log-level"));

    let mut config = match load_config(matches.opt_str("c")) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            process::exit(1);
        }
    };

    let result = match matches.free[0].as_str() {
        "serve" => {
            if let Some(listen) = matches.opt_str("l") {
                match listen.parse() {
                    Ok(listen) => config.listen = listen,
                    Err(e) => {
                        error!(%listen, error = %e, "invalid listen address");
                        process::exit(2);
                    }
                }
            }
            serve(config, matches.opt_str("H")).await
        }
        "query" => {
            let server = match matches.opt_str("s").map(|s| s.parse::<SocketAddr>()) {
                Some(Ok(server)) => server,
                _ => {
                    eprintln!("query needs a server address, e.g. -s 127.0.0.1:53");
                    process::exit(2);
                }
            };
            let name = match matches.free.get(1) {
                Some(name) => name.clone(),
                None => {
                    print_usage(&program, &opts);
                    process::exit(2);
                }
            };
            let qtype = match matches.free.get(2) {
                Some(qtype) => match QueryType::from_name(qtype) {
                    Some(qtype) => qtype,
                    None => {
                        eprintln!("unknown record type {}", qtype);
                        process::exit(2);
                    }
                },
                None => QueryType::A,
            };
            query(config, server, &name, qtype).await
        }
        other => {
            eprintln!("unknown command {}", other);
            print_usage(&program, &opts);
            process::exit(2);
        }
    };

    if let Err(e) = result {
        error!(error = %e, "{} failed", matches.free[0]);
        process::exit(1);
    }
}
