//! # Orbit Trust
//!
//! Who is trusted: self-signed peer identities, join/retire tickets, and
//! the generation-counted membership [`Circle`].
//!
//! A circle is never mutated in place. Every membership-changing operation
//! produces a successor circle with a strictly higher generation; competing
//! writers are arbitrated by the record store's compare-and-swap, and a
//! circle with a lower generation is never accepted over a higher one.

#![forbid(unsafe_code)]

pub mod circle;
pub mod identity;
pub mod tickets;

pub use circle::{Circle, CircleSignature, CircleStanding};
pub use identity::PeerIdentity;
pub use tickets::{ApplicationTicket, Approval, RetirementTicket};
