//! # Orbit Pairing
//!
//! A secondary, low-latency message channel used to exchange the first
//! application/acceptance pair faster than the record store's propagation
//! delay allows. The channel only accelerates: whatever it produces lands
//! in the same circle state through the same generation compare-and-swap
//! as a store-mediated join.
//!
//! Payloads are sealed to the recipient, fragmented into bounded-size
//! chunks, acknowledged per fragment, and resent with backoff until a
//! ceiling, after which the exchange fails with `PairingTimedOut` and the
//! caller falls back to the store-mediated path.

#![forbid(unsafe_code)]

pub mod channel;
pub mod fragment;
pub mod transport;

pub use channel::{ExchangeState, PairingChannel, PairingConfig, PairingPayload};
pub use fragment::{Fragment, PairingMessage, ReassemblyBuffer, MAX_FRAGMENT_PAYLOAD};
pub use transport::{MemoryTransport, MemoryTransportHub, PairingTransport};
