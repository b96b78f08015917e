//! Hands-Free profile core: connection state machine, device registry,
//! AT command processing and audio admission policy.

pub mod at;
pub mod envelope;
pub mod machine;
pub mod phone;
pub mod policy;
pub mod ports;
pub mod registry;

/// Profile-level connection state of a single device, as reported to
/// outer layers.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum ConnectionState {
   Disconnected = 0,
   Connecting = 1,
   Connected = 2,
   Disconnecting = 3,
}

/// State of the one shared voice-audio (SCO) link.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::FromRepr, strum::Display)]
pub enum AudioState {
   #[default]
   Disconnected = 0,
   Connecting = 1,
   Connected = 2,
   Disconnecting = 3,
}
