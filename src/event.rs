//! Event fan-out for profile status updates.
//!
//! This module provides the event infrastructure for notifying outer
//! layers about connection and audio state changes, vendor AT commands,
//! HF indicator updates and telephony actions requested by a headset.

use std::sync::Arc;

use bluer::Address;
use smol_str::SmolStr;

use crate::hfp::{AudioState, ConnectionState, at::AtArgs};

/// Telephony action requested by a connected headset.
///
/// The daemon does not own a dialer; these are forwarded to whatever
/// call-control service is listening and the resulting call state comes
/// back through the phone-state entry points.
#[derive(Debug, Clone)]
pub enum TelephonyAction {
   Answer,
   Hangup,
   Dial(SmolStr),
   Dtmf(char),
   CallHold(u32),
   QueryPhoneState,
   ListCurrentCalls,
}

/// Events emitted by the Hands-Free service.
#[derive(Debug, Clone)]
pub enum ProfileEvent {
   ConnectionStateChanged {
      device: Address,
      prev: ConnectionState,
      state: ConnectionState,
   },
   AudioStateChanged {
      device: Address,
      prev: AudioState,
      state: AudioState,
   },
   VendorCommand {
      device: Address,
      command: SmolStr,
      company_id: u16,
      args: AtArgs,
   },
   IndicatorChanged {
      device: Address,
      indicator: u16,
      value: i32,
   },
   VoiceRecognitionRequested {
      device: Address,
   },
   TelephonyRequest(TelephonyAction),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: ProfileEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
