/*!
An implementation of Control4's Simple Device Discovery Protocol (SDDP):
an HTTP-like, line-oriented protocol carried over UDP multicast, used by
home-automation devices to advertise themselves and answer search
queries from controllers on the same link.

See [`datagram`] for the wire format, [`binding`]/[`engine`] for the
multicast transport, [`server`] for the advertiser/responder/collector,
and [`client`] for the SEARCH abstraction.
*/

pub mod binding;
pub mod client;
pub mod constants;
pub mod datagram;
pub mod engine;
pub mod info;
pub mod interfaces;
pub mod server;
pub mod subscriber;

#[cfg(test)]
mod integration_tests;

pub use binding::SocketBinding;
pub use client::{ClientOptions, SddpClient, SearchOptions, SearchRequest};
pub use datagram::{Datagram, HeaderValue};
pub use engine::{Engine, FinalResult};
pub use info::{AdvertisementInfo, ResponseInfo};
pub use server::{NotifyHandler, SddpServer, ServerOptions};
pub use subscriber::Subscriber;
