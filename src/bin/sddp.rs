//! Command-line front end for the SDDP server and client: parses
//! arguments, drives the library, prints JSON, and installs signal
//! handlers. None of this belongs in the library itself (see §6 of the
//! design): it is a thin, replaceable collaborator around `sddp_rs`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use clap::{Parser, Subcommand};
use human_panic::setup_panic;
use tracing_subscriber::EnvFilter;

use sddp_rs::sddp::{
    AdvertisementInfo, ClientOptions, Datagram, HeaderValue, NotifyHandler, ResponseInfo,
    SddpClient, SddpServer, SearchOptions, ServerOptions,
};
use sddp_rs::Error;

#[derive(Parser, Debug)]
#[command(name = "sddp", about = "Simple Device Discovery Protocol server and client")]
struct Cli {
    /// Increase logging verbosity; repeat for more detail.
    #[arg(short = 'v', long = "verbose", global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Advertise a local device and answer SEARCH queries until signaled.
    Server {
        #[arg(long = "advertise-interval", default_value_t = 1200)]
        advertise_interval: u64,

        #[arg(short = 'H', long = "header", value_name = "NAME=VALUE")]
        headers: Vec<NameValue>,

        #[arg(short = 'b', long = "bind", value_name = "IP")]
        bind: Vec<IpAddr>,
    },
    /// Send a SEARCH and print matching responses as they arrive.
    Search {
        #[arg(long, default_value = "*")]
        pattern: String,

        #[arg(long = "wait-time", default_value_t = 4)]
        wait_time: u64,

        #[arg(short = 'b', long = "bind", value_name = "IP")]
        bind: Vec<IpAddr>,

        #[arg(long = "include-error-responses")]
        include_error_responses: bool,

        #[arg(long = "max-responses", default_value_t = 0)]
        max_responses: usize,

        #[arg(short = 'F', long = "filter", value_name = "NAME=VALUE")]
        filter: Vec<NameValue>,
    },
    /// Print the package version and exit.
    Version,
}

#[derive(Clone, Debug)]
struct NameValue {
    name: String,
    value: String,
}

impl FromStr for NameValue {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((name, value)) => Ok(Self {
                name: name.to_string(),
                value: value.to_string(),
            }),
            None => Err(format!("expected NAME=VALUE, got `{}`", s)),
        }
    }
}

/// `Max-Age` is always carried as an integer; every other header is a
/// plain string. This matches the typed headers fixed by the wire format
/// (§3 of the design).
fn header_value(name: &str, value: &str) -> HeaderValue {
    if name.eq_ignore_ascii_case("Max-Age") {
        match value.parse::<i64>() {
            Ok(i) => HeaderValue::Int(i),
            Err(_) => HeaderValue::String(value.to_string()),
        }
    } else {
        HeaderValue::String(value.to_string())
    }
}

fn main() {
    setup_panic!();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    let exit_code = runtime.block_on(run(cli.command));
    std::process::exit(exit_code);
}

fn init_tracing(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(command: Command) -> i32 {
    let result = match command {
        Command::Server {
            advertise_interval,
            headers,
            bind,
        } => run_server(advertise_interval, headers, bind).await,
        Command::Search {
            pattern,
            wait_time,
            bind,
            include_error_responses,
            max_responses,
            filter,
        } => run_search(pattern, wait_time, bind, include_error_responses, max_responses, filter).await,
        Command::Version => {
            println!("sddp {}", env!("CARGO_PKG_VERSION"));
            return 0;
        }
    };
    match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("error: {}", e);
            1
        }
    }
}

async fn run_server(
    advertise_interval: u64,
    headers: Vec<NameValue>,
    bind: Vec<IpAddr>,
) -> Result<(), sddp_rs::Error> {
    let mut device_headers = HashMap::new();
    for NameValue { name, value } in headers {
        device_headers.insert(name.clone(), header_value(&name, &value));
    }

    let options = ServerOptions {
        device_headers,
        advertise_interval: Some(Duration::from_secs(advertise_interval)),
        bind_addresses: if bind.is_empty() { None } else { Some(bind) },
        ..ServerOptions::default()
    };

    let server = SddpServer::start(options).await?;
    let handler: NotifyHandler = Arc::new(|info: AdvertisementInfo| {
        Box::pin(async move {
            print_advertisement(&info);
            Ok(())
        })
    });
    server.add_notify_handler(handler);

    wait_for_shutdown_signal().await;
    server.stop_and_wait().await
}

async fn run_search(
    pattern: String,
    wait_time: u64,
    bind: Vec<IpAddr>,
    include_error_responses: bool,
    max_responses: usize,
    filter: Vec<NameValue>,
) -> Result<(), sddp_rs::Error> {
    let mut filter_headers = HashMap::new();
    for NameValue { name, value } in filter {
        filter_headers.insert(name.clone(), header_value(&name, &value));
    }

    let client_options = ClientOptions {
        bind_addresses: if bind.is_empty() { None } else { Some(bind) },
        ..ClientOptions::default()
    };
    let client = SddpClient::start(client_options).await?;

    let search_options = SearchOptions {
        pattern,
        response_wait_time: Duration::from_secs(wait_time),
        max_responses,
        include_error_responses,
        filter_headers: if filter_headers.is_empty() {
            None
        } else {
            Some(filter_headers)
        },
    };
    let mut request = client.search(search_options).await?;
    while let Some(response) = request.receive().await? {
        print_response(&response);
    }
    client.stop().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(s) => s,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn headers_json(datagram: &Datagram) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (name, raw) in datagram.raw_headers() {
        let value = match datagram.header(name) {
            Some(HeaderValue::String(s)) => serde_json::Value::String(s.clone()),
            Some(HeaderValue::Int(i)) => serde_json::Value::from(*i),
            Some(HeaderValue::Float(f)) => serde_json::Value::from(*f),
            None => serde_json::Value::String(raw.to_string()),
        };
        map.insert(name.to_string(), value);
    }
    serde_json::Value::Object(map)
}

fn body_base64(datagram: &Datagram) -> Option<String> {
    if datagram.is_empty_body() {
        None
    } else {
        Some(base64::engine::general_purpose::STANDARD.encode(datagram.body()))
    }
}

fn print_advertisement(info: &AdvertisementInfo) {
    let mut output = serde_json::json!({
        "sddp_version": info.sddp_version,
        "src_addr": info.source_addr.to_string(),
        "local_addr": info.binding.unicast_addr().to_string(),
        "headers": headers_json(&info.datagram),
        "monotonic_time": info.monotonic_time,
        "utc_time": info.utc_time.to_rfc3339(),
    });
    if let Some(body) = body_base64(&info.datagram) {
        output["body"] = serde_json::Value::String(body);
    }
    println!("{}", output);
}

fn print_response(info: &ResponseInfo) {
    let mut output = serde_json::json!({
        "sddp_version": info.sddp_version,
        "status_code": info.status_code,
        "status": info.status,
        "src_addr": info.source_addr.to_string(),
        "local_addr": info.binding.unicast_addr().to_string(),
        "headers": headers_json(&info.datagram),
        "monotonic_time": info.monotonic_time,
        "utc_time": info.utc_time.to_rfc3339(),
    });
    if let Some(body) = body_base64(&info.datagram) {
        output["body"] = serde_json::Value::String(body);
    }
    println!("{}", output);
}
