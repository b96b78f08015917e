//! Bluetooth Hands-Free Profile audio-gateway service.
//!
//! This crate implements the audio-gateway side of the Hands-Free
//! profile: the service-level connection lifecycle for a bounded set of
//! headsets, exclusive ownership of the single voice-audio (SCO) link,
//! telephony call-state synchronization and the AT command protocol.
//!
//! The core lives in [`hfp`]; everything platform-facing (RFCOMM
//! transport, D-Bus surface) is an adapter over the traits in
//! [`hfp::ports`].

pub mod config;
pub mod dbus;
pub mod error;
pub mod event;
pub mod hfp;
pub mod rfcomm;
