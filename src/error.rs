//! Error types for the Hands-Free service.
//!
//! This module defines all error types that can occur during operation
//! of the service, covering Bluetooth, D-Bus, I/O and configuration
//! failures as well as the protocol-level timeout taxonomy handled by
//! the connection state machine.

use bluer::Address;
use thiserror::Error;

/// Main error type for the Hands-Free service.
#[derive(Error, Debug)]
pub enum HfpError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Device not found: {0}")]
   DeviceNotFound(Address),

   #[error("Device not connected")]
   DeviceNotConnected,

   #[error("Connect attempt to {0} timed out")]
   ConnectTimeout(Address),

   #[error("Audio connect attempt to {0} timed out")]
   AudioConnectTimeout(Address),

   #[error("Service-level connection to {0} failed")]
   SlcEstablishmentFailure(Address),

   #[error("Event for device {0} in no tracked role")]
   UnknownDeviceEvent(Address),

   #[error("Native command failed: {0}")]
   NativeCommandFailure(&'static str),

   #[error("Telephony service unavailable")]
   TelephonyUnavailable,

   #[error("Voice recognition did not start in time")]
   VoiceRecognitionTimeout,

   #[error("No dialing confirmation received in time")]
   DialingTimeout,

   #[error("Call-list response timed out")]
   CallListResponseTimeout,

   #[error("Phone-state query timed out")]
   QueryPhoneStateTimeout,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("State machine has been shut down")]
   MachineShutdown,
}

/// Convenience type alias for Results with `HfpError`.
pub type Result<T> = std::result::Result<T, HfpError>;
