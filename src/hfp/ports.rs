//! Collaborator traits at the platform seams.
//!
//! The state machine depends only on these traits; the binary wires in
//! real adapters (RFCOMM transport, system audio, D-Bus telephony) and
//! the tests wire in recording doubles.

use bluer::Address;
use smol_str::SmolStr;

use crate::error::Result;

/// Volume channel addressed by `AT+VGS`/`AT+VGM`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum VolumeKind {
   Speaker = 0,
   Microphone = 1,
}

/// Final result code for an AT command exchange.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum AtResponseCode {
   Error = 0,
   Ok = 1,
}

/// Negotiated SCO codec.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum CodecId {
   Cvsd = 1,
   Msbc = 2,
}

/// One `+CLCC` call-list line; `index == 0` terminates the listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClccEntry {
   pub index: u32,
   pub direction: u32,
   pub status: u32,
   pub mode: u32,
   pub multiparty: bool,
   pub number: SmolStr,
   pub kind: u16,
}

impl ClccEntry {
   /// The terminating entry that closes a call listing.
   pub fn terminator() -> Self {
      Self {
         index: 0,
         direction: 0,
         status: 0,
         mode: 0,
         multiparty: false,
         number: SmolStr::default(),
         kind: 0,
      }
   }
}

/// Network registration snapshot pushed to connected headsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus {
   pub service: u32,
   pub roam: u32,
   pub signal: u32,
   pub battery: u32,
}

/// Imperative surface of the native stack.
///
/// Calls are fire-and-forget: `false` means the command failed
/// synchronously, every asynchronous outcome arrives later as a stack
/// event through the mailbox.
pub trait NativeControl: Send + Sync {
   fn connect(&self, device: Address) -> bool;
   fn disconnect(&self, device: Address) -> bool;
   fn connect_audio(&self, device: Address) -> bool;
   fn disconnect_audio(&self, device: Address) -> bool;
   fn start_voice_recognition(&self, device: Address) -> bool;
   fn stop_voice_recognition(&self, device: Address) -> bool;
   fn set_volume(&self, kind: VolumeKind, volume: u8, device: Address) -> bool;
   fn at_response_code(&self, code: AtResponseCode, error: i32, device: Address) -> bool;
   fn at_response_string(&self, response: &str, device: Address) -> bool;
   #[allow(clippy::too_many_arguments)]
   fn cind_response(
      &self,
      service: u32,
      num_active: u32,
      num_held: u32,
      call_state: crate::hfp::phone::CallState,
      signal: u32,
      roam: u32,
      battery: u32,
      device: Address,
   ) -> bool;
   fn cops_response(&self, operator: &str, device: Address) -> bool;
   fn clcc_response(&self, entry: &ClccEntry, device: Address) -> bool;
   fn bind_response(&self, indicator: u16, enabled: bool, device: Address) -> bool;
   fn phone_state_change(
      &self,
      num_active: u32,
      num_held: u32,
      call_state: crate::hfp::phone::CallState,
      number: &str,
      kind: u16,
   ) -> bool;
   fn configure_codec(&self, device: Address, codec: CodecId) -> bool;
   fn notify_device_status(&self, status: DeviceStatus) -> bool;
}

/// Call-control collaborator.
///
/// Every call may fail or never complete; failures map to AT error
/// responses and slow answers are bounded by the machine's timers.
pub trait Telephony: Send + Sync {
   fn answer_call(&self) -> Result<()>;
   fn hangup_call(&self) -> Result<()>;
   fn dial(&self, number: &str) -> Result<()>;
   fn send_dtmf(&self, digit: char) -> Result<()>;
   fn process_chld(&self, action: u32) -> Result<bool>;
   fn subscriber_number(&self) -> Result<Option<SmolStr>>;
   fn network_operator(&self) -> Result<Option<SmolStr>>;
   /// Returns `true` when a call listing was started and `+CLCC`
   /// responses will be pushed back asynchronously.
   fn list_current_calls(&self) -> Result<bool>;
   fn query_phone_state(&self) -> Result<()>;
   fn last_dialed_number(&self) -> Option<SmolStr>;
}

/// System audio-routing collaborator.
pub trait AudioRouting: Send + Sync {
   fn set_sco_routing(&self, enabled: bool);
   fn stream_volume(&self) -> u8;
   fn set_stream_volume(&self, volume: u8, show_ui: bool);
   fn set_parameter(&self, key: &str, value: &str);
}

/// Bonding/permission policy for inbound and outbound connections.
pub trait ConnectPolicy: Send + Sync {
   fn ok_to_connect(&self, device: Address) -> bool;
}
