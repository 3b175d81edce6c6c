/*!
`SddpClient`: an engine specialization that sends SEARCH queries to the
multicast group and collects the unicast `SDDP/<ver> 200 OK` responses
they provoke.

Bindings are unicast-only (ephemeral local port, no group membership).
A [`SearchRequest`] is a scoped object: it registers a subscriber and
sends the SEARCH datagrams *before* returning, so no response can be
missed between send and subscribe.
*/

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::{Duration, Instant};

use futures::Stream;
use lazy_static::lazy_static;
use regex::Regex;

use super::binding::SocketBinding;
use super::constants::{SDDP_MULTICAST_ADDRESS, SDDP_PORT};
use super::datagram::{Datagram, HeaderValue};
use super::engine::Engine;
use super::info::ResponseInfo;
use super::interfaces::{self, AddressFamily};
use super::subscriber::Subscriber;
use crate::error::Error;

/// Configuration consumed by [`SddpClient::start`].
#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub multicast_address: IpAddr,
    pub multicast_port: u16,
    /// Local addresses to bind to. `None` enumerates all local interfaces.
    pub bind_addresses: Option<Vec<IpAddr>>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            multicast_address: IpAddr::from_str(SDDP_MULTICAST_ADDRESS).unwrap(),
            multicast_port: SDDP_PORT,
            bind_addresses: None,
        }
    }
}

/// Configuration for one [`SddpClient::search`] call.
#[derive(Clone, Debug)]
pub struct SearchOptions {
    pub pattern: String,
    pub response_wait_time: Duration,
    /// 0 means no limit.
    pub max_responses: usize,
    pub include_error_responses: bool,
    /// Every name/value pair must equal (case-insensitive name, exact
    /// decoded value) the corresponding header on a response for it to
    /// be yielded.
    pub filter_headers: Option<HashMap<String, HeaderValue>>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            pattern: "*".to_string(),
            response_wait_time: Duration::from_secs(4),
            max_responses: 0,
            include_error_responses: false,
            filter_headers: None,
        }
    }
}

/// A running SDDP client: owns a set of unicast-bound bindings and knows
/// the multicast destination to send SEARCH queries to.
#[derive(Clone, Debug)]
pub struct SddpClient {
    engine: Engine,
    multicast_address: IpAddr,
    multicast_port: u16,
}

impl SddpClient {
    /// Bind one unicast socket per local interface.
    pub async fn start(options: ClientOptions) -> Result<Self, Error> {
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
            bindings.push(SocketBinding::new_unicast(ip)?);
        }
        let engine = Engine::start(bindings)?;
        Ok(Self {
            engine,
            multicast_address: options.multicast_address,
            multicast_port: options.multicast_port,
        })
    }

    pub async fn stop(&self) {
        self.engine.stop().await;
    }

    pub async fn wait_for_done(&self) -> Result<(), Error> {
        self.engine.wait_for_done().await
    }

    /// Send a SEARCH on every binding and return a request that collects
    /// responses for `options.response_wait_time`.
    pub async fn search(&self, options: SearchOptions) -> Result<SearchRequest, Error> {
        let subscriber = self.engine.subscribe();
        let destination = SocketAddr::new(self.multicast_address, self.multicast_port);
        for binding in self.engine.bindings() {
            let unicast_addr = binding.unicast_addr();
            let mut datagram = Datagram::new(format!("SEARCH {} SDDP/1.0", options.pattern));
            datagram.set_header(
                "Host",
                Some(HeaderValue::String(format!(
                    "{}:{}",
                    unicast_addr.ip(),
                    unicast_addr.port()
                ))),
            );
            let bytes = datagram.to_bytes();
            if let Err(e) = binding.send_to(&bytes, destination).await {
                // subscriber's Drop deregisters it from the engine.
                return Err(Error::NetworkTransport(e));
            }
        }
        let end_time = Instant::now() + options.response_wait_time;
        Ok(SearchRequest {
            subscriber,
            end_time,
            max_responses: options.max_responses,
            received_count: 0,
            include_error_responses: options.include_error_responses,
            filter_headers: options.filter_headers,
        })
    }

    /// Run a search to completion and return every matching response.
    pub async fn simple_search(&self, options: SearchOptions) -> Result<Vec<ResponseInfo>, Error> {
        let mut request = self.search(options).await?;
        let mut results = Vec::new();
        while let Some(item) = request.receive().await? {
            results.push(item);
        }
        Ok(results)
    }
}

lazy_static! {
    static ref RESPONSE_RE: Regex =
        Regex::new(r"^SDDP/([0-9]+)\.([0-9]+) +([0-9]+) +(.*?) *$").unwrap();
}

/// A single SEARCH request in flight: a subscriber collecting responses
/// until `max_responses` is reached, the deadline passes, or the engine
/// reaches end-of-stream. Dropping it (including by early `break` out of
/// a loop over it) tears down the subscriber.
#[derive(Debug)]
pub struct SearchRequest {
    subscriber: Subscriber,
    end_time: Instant,
    max_responses: usize,
    received_count: usize,
    include_error_responses: bool,
    filter_headers: Option<HashMap<String, HeaderValue>>,
}

impl SearchRequest {
    /// The next matching response, or `None` once the request has
    /// terminated (max responses reached, deadline passed, or engine
    /// end-of-stream).
    pub async fn receive(&mut self) -> Result<Option<ResponseInfo>, Error> {
        loop {
            if self.max_responses > 0 && self.received_count >= self.max_responses {
                return Ok(None);
            }
            let now = Instant::now();
            if now >= self.end_time {
                return Ok(None);
            }
            let remaining = self.end_time - now;
            let item = match tokio::time::timeout(remaining, self.subscriber.receive()).await {
                Ok(Ok(Some(item))) => item,
                Ok(Ok(None)) => return Ok(None),
                Ok(Err(e)) => return Err(e),
                Err(_elapsed) => return Ok(None),
            };
            let (binding, addr, datagram) = item;
            let captures = match RESPONSE_RE.captures(datagram.statement_line()) {
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
            let status_code: u16 = match captures[3].parse() {
                Ok(v) => v,
                Err(_) => continue,
            };
            if status_code != 200 && !self.include_error_responses {
                continue;
            }
            if let Some(filters) = &self.filter_headers {
                let all_match = filters
                    .iter()
                    .all(|(name, value)| datagram.header(name) == Some(value));
                if !all_match {
                    continue;
                }
            }
            self.received_count += 1;
            let version = format!("{}.{}", &captures[1], &captures[2]);
            let status = captures[4].to_string();
            return Ok(Some(ResponseInfo::new(
                binding,
                addr,
                datagram,
                version,
                status_code,
                status,
            )));
        }
    }

    /// Adapt this request into a `Stream` of responses; a transport or
    /// protocol error ends the stream after yielding it once.
    pub fn into_stream(self) -> impl Stream<Item = Result<ResponseInfo, Error>> {
        futures::stream::unfold(Some(self), |state| async move {
            let mut this = state?;
            match this.receive().await {
                Ok(Some(item)) => Some((Ok(item), Some(this))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_regex_requires_major_version_and_splits_status() {
        let captures = RESPONSE_RE.captures("SDDP/1.0 200 OK").unwrap();
        assert_eq!(&captures[1], "1");
        assert_eq!(&captures[3], "200");
        assert_eq!(&captures[4], "OK");
        assert!(!RESPONSE_RE.is_match("HTTP/1.0 200 OK"));
    }
}
