/*!
An implementation of Control4's Simple Device Discovery Protocol (SDDP):
an HTTP-like, line-oriented protocol carried over IPv4/IPv6 UDP
multicast, used by home-automation devices to advertise themselves and
to answer search queries from controllers on the same link.

The [`sddp`] module holds the whole of the implementation: the datagram
codec, per-interface socket bindings, the multicast engine, the bounded
subscriber channel, and the server/client specializations built on top
of it. [`error`] holds the crate-wide error type.

More information: [Control4 SDDP, as reverse-engineered by the
`sddp-discovery-protocol` project](https://github.com/sammck/sddp-discovery-protocol).
*/

#![warn(
    missing_debug_implementations,
    missing_docs,
    unused_extern_crates,
    rust_2018_idioms
)]

#[macro_use]
extern crate tracing;

// ------------------------------------------------------------------------------------------------
// Modules
// ------------------------------------------------------------------------------------------------

pub mod error;
pub mod sddp;

pub use error::{DatagramFormatError, Error};
