//! RFCOMM control-channel transport.
//!
//! Implements the wire side of the profile: accepts (and initiates)
//! RFCOMM connections, decodes AT command lines into stack events for
//! the state machine, and renders the machine's [`NativeControl`]
//! effects back into response lines and unsolicited indicators.
//!
//! The SCO voice link is not reachable from here; audio-link requests
//! report synchronous failure and the machine's timeout discipline
//! recovers.

use std::{
   collections::HashMap,
   sync::{Arc, OnceLock},
   time::Duration,
};

use bluer::{
   Address,
   rfcomm::{Listener, SocketAddr, Stream},
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{
   io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
   sync::{Notify, mpsc},
   time,
};

use crate::{
   error::Result,
   hfp::{
      envelope::{ConnectionEvent, Envelope, StackEvent, VrState},
      phone::CallState,
      ports::{AtResponseCode, ClccEntry, CodecId, DeviceStatus, NativeControl, VolumeKind},
   },
};

/// Delay before re-arming the listener after an accept error.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Read buffer size; AT lines are tiny.
const READ_BUFFER_SIZE: usize = 1024;

// Audio-gateway feature bits advertised through +BRSF.
const AG_FEATURE_THREE_WAY: u32 = 1 << 0;
const AG_FEATURE_ECNR: u32 = 1 << 1;
const AG_FEATURE_VOICE_RECOGNITION: u32 = 1 << 2;
const AG_FEATURE_INBAND_RING: u32 = 1 << 3;
const AG_FEATURE_REJECT_CALL: u32 = 1 << 5;
const AG_FEATURE_ENHANCED_CALL_STATUS: u32 = 1 << 6;
const AG_FEATURE_HF_INDICATORS: u32 = 1 << 10;

// Hands-free feature bit for call waiting / three-way calling.
const HF_FEATURE_THREE_WAY: u32 = 1 << 1;

// Indicator order announced in the +CIND test response.
const IND_SERVICE: u8 = 1;
const IND_CALL: u8 = 2;
const IND_CALLSETUP: u8 = 3;
const IND_CALLHELD: u8 = 4;
const IND_SIGNAL: u8 = 5;
const IND_ROAM: u8 = 6;
const IND_BATTCHG: u8 = 7;

const CIND_MAP: &str = "(\"service\",(0,1)),(\"call\",(0,1)),(\"callsetup\",(0-3)),\
(\"callheld\",(0-2)),(\"signal\",(0-5)),(\"roam\",(0,1)),(\"battchg\",(0-5))";

/// Indicator values last pushed to one headset, for +CIEV diffing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Indicators {
   service: u32,
   call: u32,
   callsetup: u32,
   callheld: u32,
   signal: u32,
   roam: u32,
   battchg: u32,
}

/// `callsetup` indicator value for a call state.
fn callsetup_for(state: CallState) -> u32 {
   match state {
      CallState::Incoming | CallState::Waiting => 1,
      CallState::Dialing => 2,
      CallState::Alerting => 3,
      _ => 0,
   }
}

/// `callheld` indicator value from the call counts.
fn callheld_for(num_active: u32, num_held: u32) -> u32 {
   if num_held == 0 {
      0
   } else if num_active > 0 {
      1
   } else {
      2
   }
}

fn frame(payload: &str) -> String {
   format!("\r\n{payload}\r\n")
}

struct Peer {
   tx: mpsc::UnboundedSender<String>,
   shutdown: Arc<Notify>,
   hf_features: u32,
   slc: bool,
   clip_enabled: bool,
   indicators: Indicators,
}

impl Peer {
   fn send(&self, payload: &str) -> bool {
      self.tx.send(frame(payload)).is_ok()
   }
}

struct TransportInner {
   channel: u8,
   inband_ringing: bool,
   sink: OnceLock<mpsc::Sender<Envelope>>,
   peers: Mutex<HashMap<Address, Peer>>,
}

/// RFCOMM transport; implements [`NativeControl`] for the machine.
#[derive(Clone)]
pub struct RfcommTransport {
   inner: Arc<TransportInner>,
}

impl RfcommTransport {
   pub fn new(channel: u8, inband_ringing: bool) -> Self {
      Self {
         inner: Arc::new(TransportInner {
            channel,
            inband_ringing,
            sink: OnceLock::new(),
            peers: Mutex::new(HashMap::new()),
         }),
      }
   }

   /// Attaches the machine mailbox; must happen before `run`.
   pub fn attach(&self, sink: mpsc::Sender<Envelope>) {
      let _ = self.inner.sink.set(sink);
   }

   /// Accept loop; runs until the listener fails permanently.
   pub async fn run(&self) -> Result<()> {
      let local = SocketAddr::new(Address::any(), self.inner.channel);
      let listener = Listener::bind(local).await?;
      info!(
         "Listening for Hands-Free connections on RFCOMM channel {}",
         self.inner.channel
      );
      loop {
         match listener.accept().await {
            Ok((stream, peer)) => {
               info!("Incoming control connection from {}", peer.addr);
               let inner = self.inner.clone();
               tokio::spawn(async move {
                  TransportInner::handle_connection(inner, stream, peer.addr).await;
               });
            },
            Err(err) => {
               warn!("accept failed: {err}");
               time::sleep(ACCEPT_RETRY_DELAY).await;
            },
         }
      }
   }
}

impl TransportInner {
   fn ag_features(&self) -> u32 {
      let mut features = AG_FEATURE_THREE_WAY
         | AG_FEATURE_ECNR
         | AG_FEATURE_VOICE_RECOGNITION
         | AG_FEATURE_REJECT_CALL
         | AG_FEATURE_ENHANCED_CALL_STATUS
         | AG_FEATURE_HF_INDICATORS;
      if self.inband_ringing {
         features |= AG_FEATURE_INBAND_RING;
      }
      features
   }

   async fn forward(&self, device: Address, event: StackEvent) {
      let Some(sink) = self.sink.get() else {
         warn!("no mailbox attached, dropping event from {device}");
         return;
      };
      if sink.send(Envelope::Stack { device, event }).await.is_err() {
         warn!("state machine gone, dropping event from {device}");
      }
   }

   fn send_line(&self, device: Address, payload: &str) -> bool {
      debug!("-> {device}: {payload}");
      self
         .peers
         .lock()
         .get(&device)
         .map(|peer| peer.send(payload))
         .unwrap_or(false)
   }

   async fn handle_connection(inner: Arc<Self>, stream: Stream, device: Address) {
      let (read_half, write_half) = tokio::io::split(stream);
      let (tx, rx) = mpsc::unbounded_channel::<String>();
      let shutdown = Arc::new(Notify::new());
      inner.peers.lock().insert(
         device,
         Peer {
            tx,
            shutdown: shutdown.clone(),
            hf_features: 0,
            slc: false,
            clip_enabled: false,
            indicators: Indicators::default(),
         },
      );
      inner
         .forward(device, StackEvent::ConnectionState(ConnectionEvent::Connected))
         .await;

      tokio::spawn(Self::writer(device, rx, write_half));
      inner.reader(device, read_half, shutdown).await;

      inner.peers.lock().remove(&device);
      inner
         .forward(
            device,
            StackEvent::ConnectionState(ConnectionEvent::Disconnected),
         )
         .await;
      info!("Control connection to {device} closed");
   }

   async fn writer(
      device: Address,
      mut rx: mpsc::UnboundedReceiver<String>,
      mut write_half: WriteHalf<Stream>,
   ) {
      while let Some(line) = rx.recv().await {
         if let Err(err) = write_half.write_all(line.as_bytes()).await {
            warn!("write to {device} failed: {err}");
            break;
         }
      }
   }

   async fn reader(
      &self,
      device: Address,
      mut read_half: ReadHalf<Stream>,
      shutdown: Arc<Notify>,
   ) {
      let mut buf = [0u8; READ_BUFFER_SIZE];
      let mut acc = String::new();
      loop {
         tokio::select! {
            _ = shutdown.notified() => {
               debug!("closing control connection to {device}");
               break;
            }
            read = read_half.read(&mut buf) => match read {
               Ok(0) => break,
               Ok(n) => {
                  acc.push_str(&String::from_utf8_lossy(&buf[..n]));
                  while let Some(pos) = acc.find(['\r', '\n']) {
                     let line: String = acc.drain(..=pos).collect();
                     let line = line.trim();
                     if !line.is_empty() {
                        self.handle_line(device, line).await;
                     }
                  }
               },
               Err(err) => {
                  warn!("read from {device} failed: {err}");
                  break;
               },
            }
         }
      }
   }

   /// Marks the service-level connection established once the SLC
   /// handshake reaches its final command.
   async fn mark_slc(&self, device: Address) {
      let newly = {
         let mut peers = self.peers.lock();
         match peers.get_mut(&device) {
            Some(peer) if !peer.slc => {
               peer.slc = true;
               true
            },
            _ => false,
         }
      };
      if newly {
         info!("Service-level connection to {device} established");
         self
            .forward(
               device,
               StackEvent::ConnectionState(ConnectionEvent::SlcConnected),
            )
            .await;
      }
   }

   fn hf_features(&self, device: Address) -> u32 {
      self
         .peers
         .lock()
         .get(&device)
         .map(|peer| peer.hf_features)
         .unwrap_or(0)
   }

   fn ok(&self, device: Address) {
      self.send_line(device, "OK");
   }

   fn error(&self, device: Address) {
      self.send_line(device, "ERROR");
   }

   async fn handle_line(&self, device: Address, line: &str) {
      debug!("<- {device}: {line}");
      let Some(cmd) = line.strip_prefix("AT") else {
         warn!("non-AT line from {device}: {line}");
         self.error(device);
         return;
      };

      if let Some(rest) = cmd.strip_prefix("+BRSF=") {
         let features = rest.trim().parse::<u32>().unwrap_or(0);
         if let Some(peer) = self.peers.lock().get_mut(&device) {
            peer.hf_features = features;
         }
         self.send_line(device, &format!("+BRSF: {}", self.ag_features()));
         self.ok(device);
      } else if cmd == "+CIND=?" {
         self.send_line(device, &format!("+CIND: {CIND_MAP}"));
         self.ok(device);
      } else if cmd == "+CIND?" {
         // answered by the machine from the synthesized phone state
         self.forward(device, StackEvent::AtCind).await;
      } else if cmd.starts_with("+CMER=") {
         self.ok(device);
         // without three-way support the SLC completes here
         if self.hf_features(device) & HF_FEATURE_THREE_WAY == 0 {
            self.mark_slc(device).await;
         }
      } else if cmd == "+CHLD=?" {
         self.send_line(device, "+CHLD: (0,1,2,3)");
         self.ok(device);
         self.mark_slc(device).await;
      } else if let Some(rest) = cmd.strip_prefix("+CHLD=") {
         match rest.trim().parse::<u32>() {
            Ok(action) => self.forward(device, StackEvent::AtChld(action)).await,
            Err(_) => self.error(device),
         }
      } else if let Some(rest) = cmd.strip_prefix("+BAC=") {
         self.ok(device);
         let codec = if rest.split(',').any(|c| c.trim() == "2") {
            CodecId::Msbc
         } else {
            CodecId::Cvsd
         };
         self.forward(device, StackEvent::WidebandSpeech(codec)).await;
      } else if let Some(rest) = cmd.strip_prefix("+BCS=") {
         self.ok(device);
         let codec = rest
            .trim()
            .parse::<u8>()
            .ok()
            .and_then(CodecId::from_repr)
            .unwrap_or(CodecId::Cvsd);
         self.forward(device, StackEvent::WidebandSpeech(codec)).await;
      } else if cmd == "A" {
         self.forward(device, StackEvent::AnswerCall).await;
      } else if cmd == "+CHUP" {
         self.ok(device);
         self.forward(device, StackEvent::HangupCall).await;
      } else if let Some(number) = cmd.strip_prefix('D') {
         self
            .forward(device, StackEvent::DialCall(number.trim().into()))
            .await;
      } else if let Some(rest) = cmd.strip_prefix("+VTS=") {
         match rest.trim().chars().next() {
            Some(digit) => {
               self.ok(device);
               self.forward(device, StackEvent::SendDtmf(digit)).await;
            },
            None => self.error(device),
         }
      } else if cmd == "+CNUM" {
         self.forward(device, StackEvent::SubscriberNumberRequest).await;
      } else if cmd == "+CLCC" {
         self.forward(device, StackEvent::AtClcc).await;
      } else if cmd == "+COPS?" {
         self.forward(device, StackEvent::AtCops).await;
      } else if cmd.starts_with("+COPS=") {
         // format selection only, nothing to store
         self.ok(device);
      } else if let Some(rest) = cmd.strip_prefix("+VGS=") {
         match rest.trim().parse::<u8>() {
            Ok(volume) => {
               self.ok(device);
               self
                  .forward(
                     device,
                     StackEvent::VolumeChanged {
                        kind: VolumeKind::Speaker,
                        volume,
                     },
                  )
                  .await;
            },
            Err(_) => self.error(device),
         }
      } else if let Some(rest) = cmd.strip_prefix("+VGM=") {
         match rest.trim().parse::<u8>() {
            Ok(volume) => {
               self.ok(device);
               self
                  .forward(
                     device,
                     StackEvent::VolumeChanged {
                        kind: VolumeKind::Microphone,
                        volume,
                     },
                  )
                  .await;
            },
            Err(_) => self.error(device),
         }
      } else if let Some(rest) = cmd.strip_prefix("+BVRA=") {
         match rest.trim() {
            "1" => {
               self
                  .forward(device, StackEvent::VoiceRecognition(VrState::Started))
                  .await;
            },
            "0" => {
               self
                  .forward(device, StackEvent::VoiceRecognition(VrState::Stopped))
                  .await;
            },
            _ => self.error(device),
         }
      } else if let Some(rest) = cmd.strip_prefix("+NREC=") {
         self.ok(device);
         self
            .forward(device, StackEvent::NoiseReduction(rest.trim() == "1"))
            .await;
      } else if cmd == "+BIND=?" {
         self.send_line(device, "+BIND: (1,2)");
         self.ok(device);
      } else if cmd == "+BIND?" {
         self.send_line(device, "+BIND: 1,1");
         self.send_line(device, "+BIND: 2,1");
         self.ok(device);
      } else if let Some(rest) = cmd.strip_prefix("+BIND=") {
         self.ok(device);
         self.forward(device, StackEvent::AtBind(rest.into())).await;
      } else if let Some(rest) = cmd.strip_prefix("+BIEV=") {
         let mut parts = rest.splitn(2, ',');
         let indicator = parts.next().and_then(|p| p.trim().parse::<u16>().ok());
         let value = parts.next().and_then(|p| p.trim().parse::<i32>().ok());
         match (indicator, value) {
            (Some(indicator), Some(value)) => {
               self.ok(device);
               self
                  .forward(device, StackEvent::AtBiev { indicator, value })
                  .await;
            },
            _ => self.error(device),
         }
      } else if cmd.starts_with("+CKPD") {
         self.ok(device);
         self.forward(device, StackEvent::KeyPressed).await;
      } else if let Some(rest) = cmd.strip_prefix("+CLIP=") {
         if let Some(peer) = self.peers.lock().get_mut(&device) {
            peer.clip_enabled = rest.trim() == "1";
         }
         self.ok(device);
      } else if cmd.starts_with("+CCWA=") || cmd.starts_with("+CMEE=") {
         self.ok(device);
      } else {
         // the machine decides: vendor command or protocol error
         self.forward(device, StackEvent::UnknownAt(cmd.into())).await;
      }
   }

   /// Pushes +CIEV updates for every changed indicator to one peer.
   fn push_indicators(&self, changes: impl Fn(&mut Indicators) -> Indicators + Copy) {
      let mut peers = self.peers.lock();
      for (device, peer) in peers.iter_mut() {
         if !peer.slc {
            continue;
         }
         let prev = changes(&mut peer.indicators);
         let now = peer.indicators;
         let mut lines = Vec::new();
         if now.service != prev.service {
            lines.push(format!("+CIEV: {IND_SERVICE},{}", now.service));
         }
         if now.call != prev.call {
            lines.push(format!("+CIEV: {IND_CALL},{}", now.call));
         }
         if now.callsetup != prev.callsetup {
            lines.push(format!("+CIEV: {IND_CALLSETUP},{}", now.callsetup));
         }
         if now.callheld != prev.callheld {
            lines.push(format!("+CIEV: {IND_CALLHELD},{}", now.callheld));
         }
         if now.signal != prev.signal {
            lines.push(format!("+CIEV: {IND_SIGNAL},{}", now.signal));
         }
         if now.roam != prev.roam {
            lines.push(format!("+CIEV: {IND_ROAM},{}", now.roam));
         }
         if now.battchg != prev.battchg {
            lines.push(format!("+CIEV: {IND_BATTCHG},{}", now.battchg));
         }
         for line in lines {
            debug!("-> {device}: {line}");
            let _ = peer.send(&line);
         }
      }
   }
}

impl NativeControl for RfcommTransport {
   fn connect(&self, device: Address) -> bool {
      let inner = self.inner.clone();
      tokio::spawn(async move {
         let peer = SocketAddr::new(device, inner.channel);
         match Stream::connect(peer).await {
            Ok(stream) => TransportInner::handle_connection(inner, stream, device).await,
            Err(err) => {
               warn!("outgoing connection to {device} failed: {err}");
               inner
                  .forward(
                     device,
                     StackEvent::ConnectionState(ConnectionEvent::Disconnected),
                  )
                  .await;
            },
         }
      });
      true
   }

   fn disconnect(&self, device: Address) -> bool {
      let peers = self.inner.peers.lock();
      match peers.get(&device) {
         Some(peer) => {
            peer.shutdown.notify_one();
            true
         },
         None => false,
      }
   }

   fn connect_audio(&self, device: Address) -> bool {
      // no SCO socket support in this transport
      warn!("SCO audio setup not available for {device}");
      false
   }

   fn disconnect_audio(&self, device: Address) -> bool {
      warn!("SCO audio teardown not available for {device}");
      false
   }

   fn start_voice_recognition(&self, device: Address) -> bool {
      self.inner.send_line(device, "+BVRA: 1")
   }

   fn stop_voice_recognition(&self, device: Address) -> bool {
      self.inner.send_line(device, "+BVRA: 0")
   }

   fn set_volume(&self, kind: VolumeKind, volume: u8, device: Address) -> bool {
      let gain = match kind {
         VolumeKind::Speaker => "VGS",
         VolumeKind::Microphone => "VGM",
      };
      self.inner.send_line(device, &format!("+{gain}: {volume}"))
   }

   fn at_response_code(&self, code: AtResponseCode, _error: i32, device: Address) -> bool {
      match code {
         AtResponseCode::Ok => self.inner.send_line(device, "OK"),
         AtResponseCode::Error => self.inner.send_line(device, "ERROR"),
      }
   }

   fn at_response_string(&self, response: &str, device: Address) -> bool {
      self.inner.send_line(device, response)
   }

   fn cind_response(
      &self,
      service: u32,
      num_active: u32,
      num_held: u32,
      call_state: CallState,
      signal: u32,
      roam: u32,
      battery: u32,
      device: Address,
   ) -> bool {
      let call = u32::from(num_active > 0);
      let callsetup = callsetup_for(call_state);
      let callheld = callheld_for(num_active, num_held);
      let sent = self.inner.send_line(
         device,
         &format!("+CIND: {service},{call},{callsetup},{callheld},{signal},{roam},{battery}"),
      );
      self.inner.send_line(device, "OK");
      sent
   }

   fn cops_response(&self, operator: &str, device: Address) -> bool {
      let sent = self.inner.send_line(device, &format!("+COPS: 0,0,\"{operator}\""));
      self.inner.send_line(device, "OK");
      sent
   }

   fn clcc_response(&self, entry: &ClccEntry, device: Address) -> bool {
      if entry.index == 0 {
         return self.inner.send_line(device, "OK");
      }
      let multiparty = u32::from(entry.multiparty);
      let line = if entry.number.is_empty() {
         format!(
            "+CLCC: {},{},{},{},{multiparty}",
            entry.index, entry.direction, entry.status, entry.mode
         )
      } else {
         format!(
            "+CLCC: {},{},{},{},{multiparty},\"{}\",{}",
            entry.index, entry.direction, entry.status, entry.mode, entry.number, entry.kind
         )
      };
      self.inner.send_line(device, &line)
   }

   fn bind_response(&self, indicator: u16, enabled: bool, device: Address) -> bool {
      self.inner.send_line(device, &format!("+BIND: {indicator},{}", u8::from(enabled)))
   }

   fn phone_state_change(
      &self,
      num_active: u32,
      num_held: u32,
      call_state: CallState,
      number: &str,
      kind: u16,
   ) -> bool {
      let call = u32::from(num_active > 0);
      let callsetup = callsetup_for(call_state);
      let callheld = callheld_for(num_active, num_held);
      self.inner.push_indicators(move |indicators| {
         let prev = *indicators;
         indicators.call = call;
         indicators.callsetup = callsetup;
         indicators.callheld = callheld;
         prev
      });
      // ring while an incoming call has no audio-side bearer yet
      // TODO: repeat RING/+CLIP periodically until the call is answered
      if callsetup == 1 && call == 0 {
         let peers = self.inner.peers.lock();
         for (device, peer) in peers.iter() {
            if !peer.slc {
               continue;
            }
            debug!("-> {device}: RING");
            peer.send("RING");
            if peer.clip_enabled && !number.is_empty() {
               peer.send(&format!("+CLIP: \"{number}\",{kind}"));
            }
         }
      }
      true
   }

   fn configure_codec(&self, device: Address, codec: CodecId) -> bool {
      self.inner.send_line(device, &format!("+BCS: {}", codec as u8))
   }

   fn notify_device_status(&self, status: DeviceStatus) -> bool {
      self.inner.push_indicators(move |indicators| {
         let prev = *indicators;
         indicators.service = status.service;
         indicators.signal = status.signal;
         indicators.roam = status.roam;
         indicators.battchg = status.battery;
         prev
      });
      true
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn callsetup_tracks_call_state() {
      assert_eq!(callsetup_for(CallState::Incoming), 1);
      assert_eq!(callsetup_for(CallState::Waiting), 1);
      assert_eq!(callsetup_for(CallState::Dialing), 2);
      assert_eq!(callsetup_for(CallState::Alerting), 3);
      assert_eq!(callsetup_for(CallState::Idle), 0);
      assert_eq!(callsetup_for(CallState::Active), 0);
   }

   #[test]
   fn callheld_tracks_call_counts() {
      assert_eq!(callheld_for(0, 0), 0);
      assert_eq!(callheld_for(1, 0), 0);
      assert_eq!(callheld_for(1, 1), 1);
      assert_eq!(callheld_for(0, 1), 2);
   }

   #[test]
   fn frames_carry_crlf_on_both_sides() {
      assert_eq!(frame("OK"), "\r\nOK\r\n");
      assert_eq!(frame("+CIEV: 2,1"), "\r\n+CIEV: 2,1\r\n");
   }

   #[test]
   fn inband_ringing_toggles_brsf_bit() {
      let with = RfcommTransport::new(3, true);
      let without = RfcommTransport::new(3, false);
      assert_ne!(
         with.inner.ag_features() & AG_FEATURE_INBAND_RING,
         without.inner.ag_features() & AG_FEATURE_INBAND_RING
      );
   }
}
