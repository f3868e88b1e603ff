//! Multi-node WebSocket fan-out bus.

pub mod client;
pub mod handlers;
pub mod hub;
pub mod message;

pub use client::{Client, SendOutcome};
pub use hub::Hub;
pub use message::{Envelope, Frame, Target};
