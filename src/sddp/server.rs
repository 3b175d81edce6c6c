/*!
`SddpServer`: an engine specialization that advertises a local device,
collects NOTIFY advertisements from other devices on the network, and
answers SEARCH queries.

On `finish_start` it spawns up to three background tasks sharing the
engine: a collector that invokes registered notify handlers, a responder
that answers SEARCH with a copy of the server's own advertisement, and
(only when `advertise_interval` is non-zero) a periodic advertiser.
*/

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::BoxFuture;
use lazy_static::lazy_static;
use regex::Regex;
use tokio::task::JoinHandle;

use super::binding::SocketBinding;
use super::constants::{DEFAULT_MAX_AGE, SDDP_MULTICAST_ADDRESS, SDDP_PORT};
use super::datagram::{Datagram, HeaderValue};
use super::engine::{Engine, FinalResult};
use super::info::AdvertisementInfo;
use super::interfaces::{self, AddressFamily};
use crate::error::Error;

/// A callback invoked, in registration order, for every `NOTIFY ALIVE`
/// advertisement the collector receives. Returning an error fails the
/// collector task and, through it, the whole engine.
pub type NotifyHandler =
    Arc<dyn Fn(AdvertisementInfo) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

/// Configuration consumed by [`SddpServer::start`].
#[derive(Clone, Debug)]
pub struct ServerOptions {
    /// Headers describing the advertised device. `Max-Age` defaults to
    /// [`DEFAULT_MAX_AGE`] when absent.
    pub device_headers: HashMap<String, HeaderValue>,
    /// Interval between periodic advertisements. `None` selects two-thirds
    /// of `Max-Age`; `Some(Duration::ZERO)` disables the advertiser.
    pub advertise_interval: Option<Duration>,
    /// Whether SEARCH queries are answered. Default `true`.
    pub respond_to_queries: bool,
    pub multicast_address: IpAddr,
    pub multicast_port: u16,
    /// Local addresses to bind to. `None` enumerates all local interfaces.
    pub bind_addresses: Option<Vec<IpAddr>>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            device_headers: HashMap::new(),
            advertise_interval: None,
            respond_to_queries: true,
            multicast_address: IpAddr::from_str(SDDP_MULTICAST_ADDRESS).unwrap(),
            multicast_port: SDDP_PORT,
            bind_addresses: None,
        }
    }
}

/// A running SDDP server: owns the engine, the advertisement datagram,
/// the set of registered notify handlers, and the background tasks.
#[derive(Clone)]
pub struct SddpServer {
    engine: Engine,
    advertise_datagram: Datagram,
    multicast_address: IpAddr,
    multicast_port: u16,
    notify_handlers: Arc<StdMutex<Vec<NotifyHandler>>>,
    tasks: Arc<StdMutex<Vec<JoinHandle<()>>>>,
}

impl std::fmt::Debug for SddpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SddpServer")
            .field("multicast_address", &self.multicast_address)
            .field("multicast_port", &self.multicast_port)
            .finish()
    }
}

impl SddpServer {
    /// Bind, join the multicast group on every selected interface, and
    /// start the collector/responder/advertiser tasks.
    pub async fn start(options: ServerOptions) -> Result<Self, Error> {
        let mut advertise_datagram =
            Datagram::with_headers("NOTIFY ALIVE SDDP/1.0", options.device_headers.clone());
        if advertise_datagram.max_age().is_none() {
            advertise_datagram.set_header("Max-Age", Some(HeaderValue::Int(DEFAULT_MAX_AGE as i64)));
        }
        let max_age = advertise_datagram.max_age().unwrap_or(DEFAULT_MAX_AGE as i64);
        let advertise_interval = options
            .advertise_interval
            .unwrap_or_else(|| Duration::from_secs_f64(max_age as f64 * 2.0 / 3.0));

        let family = if options.multicast_address.is_ipv6() {
            AddressFamily::V6
        } else {
            AddressFamily::V4
        };
        let bind_ips = match options.bind_addresses {
            Some(ips) => ips,
            None => interfaces::local_ip_addresses(family, true),
        };
        if bind_ips.is_empty() {
            return Err(Error::NoUsableInterfaces);
        }

        let mut bindings = Vec::with_capacity(bind_ips.len());
        for ip in bind_ips {
            bindings.push(SocketBinding::new_multicast_receiver(
                ip,
                options.multicast_address,
                options.multicast_port,
            )?);
        }
        let engine = Engine::start(bindings)?;

        let server = Self {
            engine,
            advertise_datagram,
            multicast_address: options.multicast_address,
            multicast_port: options.multicast_port,
            notify_handlers: Arc::new(StdMutex::new(Vec::new())),
            tasks: Arc::new(StdMutex::new(Vec::new())),
        };
        server.finish_start(options.respond_to_queries, advertise_interval);
        Ok(server)
    }

    /// Register a handler invoked for every collected NOTIFY advertisement,
    /// in registration order. May be called before or after `start`.
    pub fn add_notify_handler(&self, handler: NotifyHandler) {
        self.notify_handlers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(handler);
    }

    fn finish_start(&self, respond_to_queries: bool, advertise_interval: Duration) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());

        let collector_engine = self.engine.clone();
        let handlers = self.notify_handlers.clone();
        tasks.push(tokio::spawn(async move {
            run_collector(collector_engine, handlers).await;
        }));

        if respond_to_queries {
            let responder_engine = self.engine.clone();
            let advertise_datagram = self.advertise_datagram.clone();
            tasks.push(tokio::spawn(async move {
                run_responder(responder_engine, advertise_datagram).await;
            }));
        }

        if !advertise_interval.is_zero() {
            let advertiser_engine = self.engine.clone();
            let advertise_datagram = self.advertise_datagram.clone();
            let multicast_address = self.multicast_address;
            let multicast_port = self.multicast_port;
            tasks.push(tokio::spawn(async move {
                run_advertiser(
                    advertiser_engine,
                    advertise_datagram,
                    multicast_address,
                    multicast_port,
                    advertise_interval,
                )
                .await;
            }));
        }
    }

    /// Close every binding; `final_result` resolves to success if it was
    /// not already set by a transport error.
    pub async fn stop(&self) {
        self.engine.stop().await;
    }

    /// Await the engine's terminal result, then the three background
    /// tasks. Dependent-task cancellation is expected and swallowed;
    /// unexpected dependent-task panics are logged, not propagated.
    pub async fn wait_for_done(&self) -> Result<(), Error> {
        let result = self.engine.wait_for_done().await;
        self.wait_for_dependents_done().await;
        result
    }

    /// Convenience combining `stop` and `wait_for_done`.
    pub async fn stop_and_wait(&self) -> Result<(), Error> {
        self.stop().await;
        self.wait_for_done().await
    }

    async fn wait_for_dependents_done(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut *tasks)
        };
        for handle in handles {
            handle.abort();
            match handle.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!("server dependent task exited abnormally: {}", e),
            }
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}

lazy_static! {
    static ref NOTIFY_RE: Regex =
        Regex::new(r"^NOTIFY +ALIVE +SDDP/([0-9]+)\.([0-9]+) *$").unwrap();
    static ref SEARCH_RE: Regex =
        Regex::new(r"^SEARCH +([^ ]+) +(HTTP|SDDP)/([0-9]+)\.([0-9]+) *$").unwrap();
}

async fn run_collector(engine: Engine, handlers: Arc<StdMutex<Vec<NotifyHandler>>>) {
    debug!("device collector task starting");
    let mut subscriber = engine.subscribe();
    loop {
        let item = match subscriber.receive().await {
            Ok(Some(item)) => item,
            Ok(None) => break,
            Err(e) => {
                warn!("device collector task exiting with error: {}", e);
                break;
            }
        };
        let (binding, addr, datagram) = item;
        let captures = match NOTIFY_RE.captures(datagram.statement_line()) {
            Some(c) => c,
            None => continue,
        };
        let major: i64 = match captures[1].parse() {
            Ok(v) => v,
            Err(_) => continue,
        };
        if major < 1 {
            continue;
        }
        let version = format!("{}.{}", &captures[1], &captures[2]);
        let info = AdvertisementInfo::new(binding, addr, datagram, version);

        let snapshot: Vec<NotifyHandler> =
            handlers.lock().unwrap_or_else(|p| p.into_inner()).clone();
        for handler in snapshot {
            if let Err(e) = handler(info.clone()).await {
                error!("notify handler failed: {}", e);
                engine.set_final_result(FinalResult::Error(Arc::new(e.to_string())));
                return;
            }
        }
    }
    debug!("device collector task exiting");
}

async fn run_responder(engine: Engine, advertise_datagram: Datagram) {
    debug!("sddp responder task starting");
    let mut subscriber = engine.subscribe();
    loop {
        let item = match subscriber.receive().await {
            Ok(Some(item)) => item,
            Ok(None) => break,
            Err(e) => {
                warn!("sddp responder task exiting with error: {}", e);
                break;
            }
        };
        let (binding, addr, datagram) = item;
        let captures = match SEARCH_RE.captures(datagram.statement_line()) {
            Some(c) => c,
            None => continue,
        };
        let protocol = &captures[2];
        let major: i64 = match captures[3].parse() {
            Ok(v) => v,
            Err(_) => continue,
        };
        let minor = &captures[4];
        if major < 1 {
            continue;
        }
        debug!(
            "sddp responder received SEARCH from {} on {}: pattern='{}'",
            addr,
            binding.display_name(),
            &captures[1]
        );
        let mut response = advertise_datagram.copy();
        response.set_statement_line(format!("{}/{}.{} 200 OK", protocol, major, minor));
        fill_from_header(&mut response, &binding);
        let bytes = response.to_bytes();
        if let Err(e) = binding.send_to(&bytes, addr).await {
            warn!("responder send to {} failed: {}", addr, e);
        }
    }
    debug!("sddp responder task exiting");
}

async fn run_advertiser(
    engine: Engine,
    advertise_datagram: Datagram,
    multicast_address: IpAddr,
    multicast_port: u16,
    interval: Duration,
) {
    debug!("sddp advertiser task starting, interval={:?}", interval);
    let mut final_rx = engine.final_result_receiver();
    let destination = SocketAddr::new(multicast_address, multicast_port);
    loop {
        if engine.is_done() {
            break;
        }
        for binding in engine.bindings() {
            let mut datagram = advertise_datagram.copy();
            fill_from_header(&mut datagram, binding);
            let bytes = datagram.to_bytes();
            if let Err(e) = binding.send_to(&bytes, destination).await {
                warn!("advertiser send on {} failed: {}", binding.display_name(), e);
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = final_rx.changed() => { break; }
        }
    }
    debug!("sddp advertiser task exiting");
}

fn fill_from_header(datagram: &mut Datagram, binding: &SocketBinding) {
    if datagram.raw_header("From").is_none() {
        let addr = binding.unicast_addr();
        datagram.set_header(
            "From",
            Some(HeaderValue::String(format!("{}:{}", addr.ip(), addr.port()))),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_regex_requires_major_version() {
        assert!(NOTIFY_RE.is_match("NOTIFY ALIVE SDDP/1.0"));
        assert!(!NOTIFY_RE.is_match("NOTIFY GONE SDDP/1.0"));
    }

    #[test]
    fn search_regex_accepts_http_and_sddp_tokens() {
        assert!(SEARCH_RE.is_match("SEARCH * SDDP/1.0"));
        assert!(SEARCH_RE.is_match("SEARCH * HTTP/1.1"));
        assert!(!SEARCH_RE.is_match("SEARCH * FOO/1.0"));
    }
}
