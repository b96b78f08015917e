//! Audio (SCO) admission policy.
//!
//! One total function over the current snapshot. The machine consults
//! it before honoring any local or remote audio request and tears down
//! links that open while it answers `false`.

use crate::hfp::phone::{PhoneState, VoiceRecognitionSession};

/// Whether a SCO connection is currently acceptable.
///
/// A force flag overrides everything; otherwise audio routing must be
/// allowed and one of the usual reasons must hold: a call past ringing,
/// voice recognition, or an unanswered incoming call with in-band
/// ringing enabled.
pub fn evaluate_sco_acceptable(
   phone: &PhoneState,
   vr: &VoiceRecognitionSession,
   force_sco: bool,
   audio_route_allowed: bool,
   inband_ringing: bool,
) -> bool {
   if force_sco {
      return true;
   }
   audio_route_allowed
      && (vr.started || phone.is_in_call() || (inband_ringing && phone.is_ringing()))
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::hfp::phone::CallState;

   fn phone(num_active: u32, num_held: u32, state: CallState) -> PhoneState {
      PhoneState {
         num_active,
         num_held,
         call_state: state,
         ..PhoneState::default()
      }
   }

   #[test]
   fn force_flag_overrides_everything() {
      let idle = phone(0, 0, CallState::Idle);
      let vr = VoiceRecognitionSession::default();
      assert!(evaluate_sco_acceptable(&idle, &vr, true, false, false));
   }

   #[test]
   fn idle_phone_rejects_audio() {
      let idle = phone(0, 0, CallState::Idle);
      let vr = VoiceRecognitionSession::default();
      assert!(!evaluate_sco_acceptable(&idle, &vr, false, true, true));
   }

   #[test]
   fn active_call_accepts_audio() {
      let active = phone(1, 0, CallState::Idle);
      let vr = VoiceRecognitionSession::default();
      assert!(evaluate_sco_acceptable(&active, &vr, false, true, false));
   }

   #[test]
   fn ringing_needs_inband_support() {
      let ringing = phone(0, 0, CallState::Incoming);
      let vr = VoiceRecognitionSession::default();
      assert!(!evaluate_sco_acceptable(&ringing, &vr, false, true, false));
      assert!(evaluate_sco_acceptable(&ringing, &vr, false, true, true));
   }

   #[test]
   fn voice_recognition_accepts_audio() {
      let idle = phone(0, 0, CallState::Idle);
      let vr = VoiceRecognitionSession {
         started: true,
         awaiting_start: false,
      };
      assert!(evaluate_sco_acceptable(&idle, &vr, false, true, false));
   }

   #[test]
   fn audio_route_disallowed_blocks_everything_but_force() {
      let active = phone(1, 0, CallState::Idle);
      let vr = VoiceRecognitionSession {
         started: true,
         awaiting_start: false,
      };
      assert!(!evaluate_sco_acceptable(&active, &vr, false, false, true));
   }

   #[test]
   fn evaluation_is_pure() {
      let held = phone(0, 1, CallState::Idle);
      let vr = VoiceRecognitionSession::default();
      let first = evaluate_sco_acceptable(&held, &vr, false, true, false);
      for _ in 0..8 {
         assert_eq!(
            evaluate_sco_acceptable(&held, &vr, false, true, false),
            first
         );
      }
   }
}
