/*!
Receive-time wrappers around a [`Datagram`](super::datagram::Datagram):
`AdvertisementInfo` for NOTIFY advertisements collected by a server, and
`ResponseInfo` for SEARCH responses collected by a client. Both carry the
binding and source address the datagram arrived on plus a monotonic and
a wall-clock timestamp, the former for age calculations and the latter
for logging/UX.
*/

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use chrono::{DateTime, Utc};

use super::binding::SocketBinding;
use super::datagram::Datagram;

fn monotonic_epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Seconds elapsed since an arbitrary, process-lifetime epoch. Only
/// meaningful relative to other calls within the same process.
pub fn monotonic_now() -> f64 {
    monotonic_epoch().elapsed().as_secs_f64()
}

/// A `NOTIFY ALIVE` advertisement as received by a server's collector.
#[derive(Clone, Debug)]
pub struct AdvertisementInfo {
    pub binding: Arc<SocketBinding>,
    pub source_addr: SocketAddr,
    pub datagram: Datagram,
    pub sddp_version: String,
    pub monotonic_time: f64,
    pub utc_time: DateTime<Utc>,
}

impl AdvertisementInfo {
    pub(crate) fn new(
        binding: Arc<SocketBinding>,
        source_addr: SocketAddr,
        datagram: Datagram,
        sddp_version: String,
    ) -> Self {
        Self {
            binding,
            source_addr,
            datagram,
            sddp_version,
            monotonic_time: monotonic_now(),
            utc_time: Utc::now(),
        }
    }
}

/// An `SDDP/<ver> <status> <text>` response as received by a client search.
#[derive(Clone, Debug)]
pub struct ResponseInfo {
    pub binding: Arc<SocketBinding>,
    pub source_addr: SocketAddr,
    pub datagram: Datagram,
    pub sddp_version: String,
    pub status_code: u16,
    pub status: String,
    pub monotonic_time: f64,
    pub utc_time: DateTime<Utc>,
}

impl ResponseInfo {
    pub(crate) fn new(
        binding: Arc<SocketBinding>,
        source_addr: SocketAddr,
        datagram: Datagram,
        sddp_version: String,
        status_code: u16,
        status: String,
    ) -> Self {
        Self {
            binding,
            source_addr,
            datagram,
            sddp_version,
            status_code,
            status,
            monotonic_time: monotonic_now(),
            utc_time: Utc::now(),
        }
    }
}
