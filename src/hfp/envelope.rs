//! The mailbox event union.
//!
//! Every inbound trigger (local API call, decoded stack event,
//! telephony notification, audio volume change, timer firing) is one
//! [`Envelope`] appended to the machine's single ordered mailbox.

use bluer::Address;
use smol_str::SmolStr;

use crate::hfp::{
   phone::CallUpdate,
   ports::{ClccEntry, CodecId, DeviceStatus, VolumeKind},
};

/// Connection-channel event codes reported by the native stack.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum ConnectionEvent {
   Disconnected = 0,
   Connecting = 1,
   Connected = 2,
   SlcConnected = 3,
   Disconnecting = 4,
}

/// Audio-channel event codes reported by the native stack.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum AudioEvent {
   Disconnected = 0,
   Connecting = 1,
   Connected = 2,
   Disconnecting = 3,
}

/// Remote voice-recognition toggle.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum VrState {
   Stopped = 0,
   Started = 1,
}

/// Timer identities; at most one of each kind is armed at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum TimeoutKind {
   Connect,
   ConnectAudio,
   DialingOut,
   VoiceRecognitionStart,
   ClccResponse,
   QueryPhoneState,
}

/// A decoded notification from the native stack, tagged with the peer
/// that produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum StackEvent {
   ConnectionState(ConnectionEvent),
   AudioState(AudioEvent),
   VoiceRecognition(VrState),
   AnswerCall,
   HangupCall,
   VolumeChanged { kind: VolumeKind, volume: u8 },
   DialCall(SmolStr),
   SendDtmf(char),
   NoiseReduction(bool),
   WidebandSpeech(CodecId),
   AtChld(u32),
   SubscriberNumberRequest,
   AtCind,
   AtCops,
   AtClcc,
   UnknownAt(SmolStr),
   KeyPressed,
   AtBind(SmolStr),
   AtBiev { indicator: u16, value: i32 },
}

/// Everything the machine can be asked to process.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
   // Local API calls
   Connect(Address),
   Disconnect(Address),
   ConnectAudio(Address),
   DisconnectAudio,
   VoiceRecognitionStart(Address),
   VoiceRecognitionStop(Address),
   VirtualCallStart(Address),
   VirtualCallStop(Address),
   EnableWbs(Address),
   DisableWbs(Address),
   SetAudioRouteAllowed(bool),
   SetForceScoAudio(bool),

   // Telephony and audio-subsystem notifications
   CallStateChanged {
      update: CallUpdate,
      virtual_call: bool,
   },
   BatteryChanged {
      level: i32,
      scale: i32,
   },
   DeviceStatusChanged(DeviceStatus),
   SendClccResponse(ClccEntry),
   SendVendorResultCode {
      device: Address,
      command: SmolStr,
      arg: SmolStr,
   },
   BindResponse {
      device: Address,
      indicator: u16,
      enabled: bool,
   },
   ScoVolumeChanged(u8),

   // Native stack
   Stack {
      device: Address,
      event: StackEvent,
   },

   // Timer firings
   Timeout {
      kind: TimeoutKind,
      device: Address,
   },
}
