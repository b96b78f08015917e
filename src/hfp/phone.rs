//! Synthesized telephony state.
//!
//! The machine owns one [`PhoneState`] per profile instance. It is
//! mutated only on telephony notifications and virtual-call synthesis,
//! and read when answering `+CIND` or pushing phone-state updates to
//! connected headsets.

use smol_str::SmolStr;

/// Call setup state, with the discriminants used on the wire.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum CallState {
   Active = 0,
   Held = 1,
   Dialing = 2,
   Alerting = 3,
   Incoming = 4,
   Waiting = 5,
   Idle = 6,
}

/// One telephony notification: the full call-state snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallUpdate {
   pub num_active: u32,
   pub num_held: u32,
   pub state: CallState,
   pub number: SmolStr,
   pub kind: u16,
}

impl CallUpdate {
   pub fn new(num_active: u32, num_held: u32, state: CallState) -> Self {
      Self {
         num_active,
         num_held,
         state,
         number: SmolStr::default(),
         kind: 0,
      }
   }
}

/// Voice-recognition session flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VoiceRecognitionSession {
   /// Recognition is running.
   pub started: bool,
   /// A headset asked for recognition and we are waiting for the local
   /// confirmation, bounded by a timer.
   pub awaiting_start: bool,
}

impl VoiceRecognitionSession {
   pub fn reset(&mut self) {
      *self = Self::default();
   }
}

/// Phone-side state mirrored to headsets through CIND/CIEV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneState {
   pub num_active: u32,
   pub num_held: u32,
   pub call_state: CallState,
   pub number: SmolStr,
   pub kind: u16,
   pub service: u32,
   pub signal: u32,
   pub roam: u32,
   pub battery_charge: u32,
   pub speaker_volume: u8,
   pub mic_volume: u8,
}

impl Default for PhoneState {
   fn default() -> Self {
      Self {
         num_active: 0,
         num_held: 0,
         call_state: CallState::Idle,
         number: SmolStr::default(),
         kind: 0,
         service: 0,
         signal: 0,
         roam: 0,
         battery_charge: 0,
         speaker_volume: 0,
         mic_volume: 0,
      }
   }
}

impl PhoneState {
   pub fn apply(&mut self, update: &CallUpdate) {
      self.num_active = update.num_active;
      self.num_held = update.num_held;
      self.call_state = update.state;
      self.number = update.number.clone();
      self.kind = update.kind;
   }

   /// A call exists that justifies keeping SCO up: active or held calls,
   /// or any setup phase past ringing.
   pub fn is_in_call(&self) -> bool {
      self.num_active > 0
         || self.num_held > 0
         || (self.call_state != CallState::Idle && self.call_state != CallState::Incoming)
   }

   pub fn is_ringing(&self) -> bool {
      self.call_state == CallState::Incoming
   }
}

/// Type-of-address for a dialable number: 145 international, 129 otherwise.
pub fn toa_for_number(number: &str) -> u16 {
   if number.starts_with('+') { 145 } else { 129 }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn call_state_round_trips_wire_values() {
      assert_eq!(CallState::from_repr(0), Some(CallState::Active));
      assert_eq!(CallState::from_repr(4), Some(CallState::Incoming));
      assert_eq!(CallState::from_repr(6), Some(CallState::Idle));
      assert_eq!(CallState::from_repr(7), None);
   }

   #[test]
   fn in_call_predicate() {
      let mut phone = PhoneState::default();
      assert!(!phone.is_in_call());

      phone.call_state = CallState::Incoming;
      assert!(!phone.is_in_call());
      assert!(phone.is_ringing());

      phone.call_state = CallState::Dialing;
      assert!(phone.is_in_call());

      phone.call_state = CallState::Idle;
      phone.num_held = 1;
      assert!(phone.is_in_call());
   }

   #[test]
   fn apply_overwrites_call_fields_only() {
      let mut phone = PhoneState::default();
      phone.service = 1;
      phone.battery_charge = 4;

      let update = CallUpdate {
         number: "+491701234567".into(),
         kind: 145,
         ..CallUpdate::new(1, 0, CallState::Idle)
      };
      phone.apply(&update);

      assert_eq!(phone.num_active, 1);
      assert_eq!(phone.number, "+491701234567");
      assert_eq!(phone.service, 1);
      assert_eq!(phone.battery_charge, 4);
   }

   #[test]
   fn toa_matches_number_prefix() {
      assert_eq!(toa_for_number("+15551234"), 145);
      assert_eq!(toa_for_number("5551234"), 129);
   }
}
