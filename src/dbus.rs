use std::str::FromStr;

use bluer::Address;
use log::info;
use serde_json::json;
use zbus::{interface, object_server::SignalEmitter};

use crate::hfp::{
   envelope::Envelope,
   machine::Handsfree,
   phone::{CallState, CallUpdate},
   ports::{ClccEntry, DeviceStatus},
};

pub struct HandsfreeService {
   handsfree: Handsfree,
}

impl HandsfreeService {
   pub const fn new(handsfree: Handsfree) -> Self {
      Self { handsfree }
   }
}

fn parse_address(address: &str) -> zbus::fdo::Result<Address> {
   Address::from_str(address).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))
}

fn to_fdo(err: crate::error::HfpError) -> zbus::fdo::Error {
   zbus::fdo::Error::Failed(err.to_string())
}

#[interface(name = "org.handsfreed.Manager1")]
impl HandsfreeService {
   async fn connect(&self, address: String) -> zbus::fdo::Result<()> {
      let addr = parse_address(&address)?;
      self.handsfree.connect(addr).await.map_err(to_fdo)
   }

   async fn disconnect(&self, address: String) -> zbus::fdo::Result<()> {
      let addr = parse_address(&address)?;
      self.handsfree.disconnect(addr).await.map_err(to_fdo)
   }

   async fn connect_audio(&self, address: String) -> zbus::fdo::Result<()> {
      let addr = parse_address(&address)?;
      self.handsfree.connect_audio(addr).await.map_err(to_fdo)
   }

   async fn disconnect_audio(&self) -> zbus::fdo::Result<()> {
      self.handsfree.disconnect_audio().await.map_err(to_fdo)
   }

   async fn start_voice_recognition(&self, address: String) -> zbus::fdo::Result<()> {
      let addr = parse_address(&address)?;
      self
         .handsfree
         .start_voice_recognition(addr)
         .await
         .map_err(to_fdo)
   }

   async fn stop_voice_recognition(&self, address: String) -> zbus::fdo::Result<()> {
      let addr = parse_address(&address)?;
      self
         .handsfree
         .stop_voice_recognition(addr)
         .await
         .map_err(to_fdo)
   }

   async fn start_virtual_call(&self, address: String) -> zbus::fdo::Result<()> {
      let addr = parse_address(&address)?;
      self.handsfree.start_virtual_call(addr).await.map_err(to_fdo)
   }

   async fn stop_virtual_call(&self, address: String) -> zbus::fdo::Result<()> {
      let addr = parse_address(&address)?;
      self.handsfree.stop_virtual_call(addr).await.map_err(to_fdo)
   }

   async fn set_audio_route_allowed(&self, allowed: bool) -> zbus::fdo::Result<()> {
      info!("audio routing allowed: {allowed}");
      self
         .handsfree
         .send(Envelope::SetAudioRouteAllowed(allowed))
         .await
         .map_err(to_fdo)
   }

   async fn set_force_sco_audio(&self, forced: bool) -> zbus::fdo::Result<()> {
      info!("forced SCO audio: {forced}");
      self
         .handsfree
         .send(Envelope::SetForceScoAudio(forced))
         .await
         .map_err(to_fdo)
   }

   /// Entry point for the telephony collaborator: full call-state
   /// snapshot after any change.
   async fn phone_state_changed(
      &self,
      num_active: u32,
      num_held: u32,
      call_state: u8,
      number: String,
      kind: u16,
   ) -> zbus::fdo::Result<()> {
      let state = CallState::from_repr(call_state)
         .ok_or_else(|| zbus::fdo::Error::InvalidArgs(format!("bad call state {call_state}")))?;
      self
         .handsfree
         .send(Envelope::CallStateChanged {
            update: CallUpdate {
               num_active,
               num_held,
               state,
               number: number.into(),
               kind,
            },
            virtual_call: false,
         })
         .await
         .map_err(to_fdo)
   }

   async fn battery_changed(&self, level: i32, scale: i32) -> zbus::fdo::Result<()> {
      self
         .handsfree
         .send(Envelope::BatteryChanged { level, scale })
         .await
         .map_err(to_fdo)
   }

   async fn device_status_changed(
      &self,
      service: u32,
      roam: u32,
      signal: u32,
      battery: u32,
   ) -> zbus::fdo::Result<()> {
      self
         .handsfree
         .send(Envelope::DeviceStatusChanged(DeviceStatus {
            service,
            roam,
            signal,
            battery,
         }))
         .await
         .map_err(to_fdo)
   }

   /// One +CLCC line from the telephony collaborator; index 0 ends the
   /// listing.
   #[allow(clippy::too_many_arguments)]
   async fn clcc_response(
      &self,
      index: u32,
      direction: u32,
      status: u32,
      mode: u32,
      multiparty: bool,
      number: String,
      kind: u16,
   ) -> zbus::fdo::Result<()> {
      self
         .handsfree
         .send(Envelope::SendClccResponse(ClccEntry {
            index,
            direction,
            status,
            mode,
            multiparty,
            number: number.into(),
            kind,
         }))
         .await
         .map_err(to_fdo)
   }

   async fn vendor_result_code(
      &self,
      address: String,
      command: String,
      arg: String,
   ) -> zbus::fdo::Result<()> {
      let addr = parse_address(&address)?;
      self
         .handsfree
         .send(Envelope::SendVendorResultCode {
            device: addr,
            command: command.into(),
            arg: arg.into(),
         })
         .await
         .map_err(to_fdo)
   }

   async fn bind_response(
      &self,
      address: String,
      indicator: u16,
      enabled: bool,
   ) -> zbus::fdo::Result<()> {
      let addr = parse_address(&address)?;
      self
         .handsfree
         .send(Envelope::BindResponse {
            device: addr,
            indicator,
            enabled,
         })
         .await
         .map_err(to_fdo)
   }

   async fn sco_volume_changed(&self, volume: u8) -> zbus::fdo::Result<()> {
      self
         .handsfree
         .send(Envelope::ScoVolumeChanged(volume))
         .await
         .map_err(to_fdo)
   }

   async fn get_connection_state(&self, address: String) -> zbus::fdo::Result<String> {
      let addr = parse_address(&address)?;
      Ok(self.handsfree.connection_state(addr).to_string())
   }

   async fn get_connected_devices(&self) -> Vec<String> {
      self
         .handsfree
         .connected_devices()
         .into_iter()
         .map(|addr| addr.to_string())
         .collect()
   }

   async fn is_audio_connected(&self, address: String) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      Ok(self.handsfree.is_audio_connected(addr))
   }

   async fn get_status(&self) -> String {
      let snapshot = self.handsfree.snapshot();
      json!({
          "state": snapshot.state.to_string(),
          "connected": snapshot.connected.iter().map(|a| a.to_string()).collect::<Vec<_>>(),
          "audio_state": snapshot.audio_state.to_string(),
          "active_audio": snapshot.active_audio.map(|a| a.to_string()),
      })
      .to_string()
   }

   // Signals
   #[zbus(signal)]
   pub async fn connection_state_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      prev: &str,
      state: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn audio_state_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      prev: &str,
      state: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn vendor_event(
      emitter: &SignalEmitter<'_>,
      address: &str,
      command: &str,
      company_id: u16,
      args: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn indicator_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      indicator: u16,
      value: i32,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn voice_recognition_requested(
      emitter: &SignalEmitter<'_>,
      address: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn telephony_action(
      emitter: &SignalEmitter<'_>,
      action: &str,
      argument: &str,
   ) -> zbus::Result<()>;

   // Property for polling-free status reads
   #[zbus(property)]
   async fn connected_count(&self) -> u32 {
      self.handsfree.connected_devices().len() as u32
   }
}
