//! The connection and call-audio state machine.
//!
//! One actor owns the device registry, the synthesized phone state and
//! the audio-link state. Every inbound trigger arrives as an
//! [`Envelope`] on a single mailbox; effects leave through the
//! collaborator traits in [`ports`](crate::hfp::ports).
//!
//! States: Disconnected, Pending (one device mid-SLC), Connected,
//! AudioOn (one connected device owns the SCO link) and MultiPending
//! (a connect or forced eviction in flight while at least one device
//! stays connected).

use std::{
   collections::{HashMap, VecDeque},
   sync::Arc,
   time::Duration,
};

use bluer::Address;
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use smol_str::SmolStr;
use tokio::{sync::mpsc, task::JoinHandle, time};

use crate::{
   error::{HfpError, Result},
   event::{EventSender, ProfileEvent},
   hfp::{
      AudioState, ConnectionState, at,
      envelope::{AudioEvent, ConnectionEvent, Envelope, StackEvent, TimeoutKind, VrState},
      phone::{CallState, CallUpdate, PhoneState, VoiceRecognitionSession, toa_for_number},
      policy,
      ports::{
         AtResponseCode, AudioRouting, ClccEntry, CodecId, ConnectPolicy, NativeControl,
         Telephony, VolumeKind,
      },
      registry::DeviceRegistry,
   },
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const AUDIO_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DIALING_OUT_TIMEOUT: Duration = Duration::from_secs(10);
const START_VR_TIMEOUT: Duration = Duration::from_secs(5);
const CLCC_RSP_TIMEOUT: Duration = Duration::from_secs(5);
const QUERY_PHONE_STATE_TIMEOUT: Duration = Duration::from_secs(2);
/// Mailbox buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;

// Audio-routing parameter keys shared with the audio collaborator.
const HEADSET_NAME: &str = "bt_headset_name";
const HEADSET_NREC: &str = "bt_headset_nrec";
const HEADSET_WBS: &str = "bt_wbs";
const A2DP_SUSPENDED: &str = "A2dpSuspended";

/// Machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
pub enum State {
   #[default]
   Disconnected,
   Pending,
   Connected,
   AudioOn,
   MultiPending,
}

impl State {
   /// Stable states re-deliver deferred envelopes on entry.
   const fn is_stable(self) -> bool {
      matches!(self, Self::Disconnected | Self::Connected | Self::AudioOn)
   }
}

/// Tunables taken from the service configuration.
#[derive(Debug, Clone, Copy)]
pub struct MachineConfig {
   pub max_connections: usize,
   pub inband_ringing: bool,
}

impl From<&crate::config::Config> for MachineConfig {
   fn from(config: &crate::config::Config) -> Self {
      Self {
         max_connections: config.max_connections.clamp(1, 2),
         inband_ringing: config.inband_ringing,
      }
   }
}

/// Collaborator bundle handed to the machine at construction.
pub struct Ports {
   pub native: Arc<dyn NativeControl>,
   pub telephony: Arc<dyn Telephony>,
   pub audio: Arc<dyn AudioRouting>,
   pub policy: Arc<dyn ConnectPolicy>,
}

/// Read-only view republished by the actor after every envelope.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
   pub state: State,
   pub connected: Vec<Address>,
   pub target: Option<Address>,
   pub incoming: Option<Address>,
   pub multi_disconnect: Option<Address>,
   pub active_audio: Option<Address>,
   pub audio_state: AudioState,
}

impl Snapshot {
   pub fn connection_state(&self, device: Address) -> ConnectionState {
      let some = Some(device);
      match self.state {
         State::Disconnected => ConnectionState::Disconnected,
         State::Pending => {
            if self.target == some || self.incoming == some {
               ConnectionState::Connecting
            } else if self.connected.contains(&device) {
               ConnectionState::Disconnecting
            } else {
               ConnectionState::Disconnected
            }
         },
         State::MultiPending => {
            if self.target == some || self.incoming == some {
               ConnectionState::Connecting
            } else if self.connected.contains(&device) {
               if self.multi_disconnect == some {
                  ConnectionState::Disconnecting
               } else {
                  ConnectionState::Connected
               }
            } else {
               ConnectionState::Disconnected
            }
         },
         State::Connected | State::AudioOn => {
            if self.connected.contains(&device) {
               ConnectionState::Connected
            } else {
               ConnectionState::Disconnected
            }
         },
      }
   }
}

/// Shared snapshot holder for out-of-actor queries.
#[derive(Default)]
pub struct Shared {
   snapshot: RwLock<Snapshot>,
}

impl Shared {
   pub fn snapshot(&self) -> Snapshot {
      self.snapshot.read().clone()
   }

   pub fn connection_state(&self, device: Address) -> ConnectionState {
      self.snapshot.read().connection_state(device)
   }

   pub fn connected_devices(&self) -> Vec<Address> {
      self.snapshot.read().connected.clone()
   }

   pub fn is_audio_connected(&self, device: Address) -> bool {
      let snap = self.snapshot.read();
      snap.active_audio == Some(device) && snap.audio_state != AudioState::Disconnected
   }

   pub fn audio_state(&self) -> AudioState {
      self.snapshot.read().audio_state
   }
}

// === Timers ===

struct PendingTimeout {
   device: Address,
   handle: JoinHandle<()>,
}

/// Timer bookkeeping: at most one armed timer per kind, canceled by
/// aborting the sleeping task. Cancel is idempotent.
struct Timers {
   loopback: mpsc::Sender<Envelope>,
   armed: HashMap<TimeoutKind, PendingTimeout>,
}

impl Timers {
   fn new(loopback: mpsc::Sender<Envelope>) -> Self {
      Self {
         loopback,
         armed: HashMap::new(),
      }
   }

   fn schedule(&mut self, kind: TimeoutKind, device: Address, after: Duration) {
      self.cancel(kind);
      let loopback = self.loopback.clone();
      let handle = tokio::spawn(async move {
         time::sleep(after).await;
         let _ = loopback.send(Envelope::Timeout { kind, device }).await;
      });
      self.armed.insert(kind, PendingTimeout { device, handle });
   }

   fn cancel(&mut self, kind: TimeoutKind) {
      if let Some(pending) = self.armed.remove(&kind) {
         pending.handle.abort();
      }
   }

   fn device_for(&self, kind: TimeoutKind) -> Option<Address> {
      self.armed.get(&kind).map(|pending| pending.device)
   }

   fn cancel_all(&mut self) {
      for (_, pending) in self.armed.drain() {
         pending.handle.abort();
      }
   }
}

impl Drop for Timers {
   fn drop(&mut self) {
      self.cancel_all();
   }
}

// === Public handle ===

/// Handle to a running state machine.
///
/// Cheaply cloneable; commands go through the mailbox, queries read the
/// published snapshot under a short-lived lock.
#[derive(Clone)]
pub struct Handsfree {
   inbox: mpsc::Sender<Envelope>,
   shared: Arc<Shared>,
}

impl Handsfree {
   pub fn spawn(config: MachineConfig, ports: Ports, events: EventSender) -> Self {
      let (inbox_tx, inbox_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let shared = Arc::new(Shared::default());
      let machine = StateMachine::new(config, ports, events, loopback_tx, shared.clone());
      tokio::spawn(machine.run(inbox_rx, loopback_rx));
      Self {
         inbox: inbox_tx,
         shared,
      }
   }

   /// Sender usable by transports to feed stack events into the mailbox.
   pub fn sender(&self) -> mpsc::Sender<Envelope> {
      self.inbox.clone()
   }

   pub async fn send(&self, envelope: Envelope) -> Result<()> {
      self
         .inbox
         .send(envelope)
         .await
         .map_err(|_| HfpError::MachineShutdown)
   }

   pub async fn connect(&self, device: Address) -> Result<()> {
      self.send(Envelope::Connect(device)).await
   }

   pub async fn disconnect(&self, device: Address) -> Result<()> {
      self.send(Envelope::Disconnect(device)).await
   }

   pub async fn connect_audio(&self, device: Address) -> Result<()> {
      self.send(Envelope::ConnectAudio(device)).await
   }

   pub async fn disconnect_audio(&self) -> Result<()> {
      self.send(Envelope::DisconnectAudio).await
   }

   pub async fn start_voice_recognition(&self, device: Address) -> Result<()> {
      self.send(Envelope::VoiceRecognitionStart(device)).await
   }

   pub async fn stop_voice_recognition(&self, device: Address) -> Result<()> {
      self.send(Envelope::VoiceRecognitionStop(device)).await
   }

   pub async fn start_virtual_call(&self, device: Address) -> Result<()> {
      self.send(Envelope::VirtualCallStart(device)).await
   }

   pub async fn stop_virtual_call(&self, device: Address) -> Result<()> {
      self.send(Envelope::VirtualCallStop(device)).await
   }

   pub fn connection_state(&self, device: Address) -> ConnectionState {
      self.shared.connection_state(device)
   }

   pub fn connected_devices(&self) -> Vec<Address> {
      self.shared.connected_devices()
   }

   pub fn is_audio_connected(&self, device: Address) -> bool {
      self.shared.is_audio_connected(device)
   }

   pub fn audio_state(&self) -> AudioState {
      self.shared.audio_state()
   }

   pub fn snapshot(&self) -> Snapshot {
      self.shared.snapshot()
   }
}

// === The machine ===

pub(crate) struct StateMachine {
   cfg: MachineConfig,
   native: Arc<dyn NativeControl>,
   telephony: Arc<dyn Telephony>,
   audio: Arc<dyn AudioRouting>,
   policy: Arc<dyn ConnectPolicy>,
   events: EventSender,
   shared: Arc<Shared>,
   timers: Timers,

   state: State,
   prev_state: State,
   registry: DeviceRegistry,
   phone: PhoneState,
   audio_state: AudioState,
   vr: VoiceRecognitionSession,

   audio_route_allowed: bool,
   force_sco: bool,
   virtual_call: bool,
   dialing_out: bool,
   need_resume_a2dp: bool,
   phone_synced: bool,
   phone_query_retried: bool,

   /// Per-device noise-reduction setting, reset on SLC.
   device_params: HashMap<Address, bool>,
   /// Envelopes parked until the machine returns to a stable state.
   deferred: Vec<Envelope>,
   /// Local dispatch queue; deferred envelopes re-enter at the front.
   pending: VecDeque<Envelope>,
}

impl StateMachine {
   fn new(
      cfg: MachineConfig,
      ports: Ports,
      events: EventSender,
      loopback: mpsc::Sender<Envelope>,
      shared: Arc<Shared>,
   ) -> Self {
      Self {
         registry: DeviceRegistry::new(cfg.max_connections),
         cfg,
         native: ports.native,
         telephony: ports.telephony,
         audio: ports.audio,
         policy: ports.policy,
         events,
         shared,
         timers: Timers::new(loopback),
         state: State::Disconnected,
         prev_state: State::Disconnected,
         phone: PhoneState::default(),
         audio_state: AudioState::Disconnected,
         vr: VoiceRecognitionSession::default(),
         audio_route_allowed: true,
         force_sco: false,
         virtual_call: false,
         dialing_out: false,
         need_resume_a2dp: false,
         phone_synced: false,
         phone_query_retried: false,
         device_params: HashMap::new(),
         deferred: Vec::new(),
         pending: VecDeque::new(),
      }
   }

   async fn run(
      mut self,
      mut inbox: mpsc::Receiver<Envelope>,
      mut loopback: mpsc::Receiver<Envelope>,
   ) {
      info!("Hands-Free state machine starting up");
      loop {
         let envelope = if let Some(envelope) = self.pending.pop_front() {
            envelope
         } else {
            tokio::select! {
               envelope = inbox.recv() => {
                  let Some(envelope) = envelope else {
                     info!("Hands-Free state machine shutting down");
                     break;
                  };
                  envelope
               }
               Some(envelope) = loopback.recv() => envelope,
            }
         };
         self.handle(envelope);
      }
      self.timers.cancel_all();
   }

   fn handle(&mut self, envelope: Envelope) {
      self.dispatch(envelope);
      self.publish();
   }

   fn dispatch(&mut self, envelope: Envelope) {
      // Envelopes handled identically in every state.
      let envelope = match envelope {
         Envelope::SetAudioRouteAllowed(allowed) => {
            self.audio_route_allowed = allowed;
            return;
         },
         Envelope::SetForceScoAudio(forced) => {
            self.force_sco = forced;
            return;
         },
         Envelope::CallStateChanged {
            update,
            virtual_call,
         } => {
            self.process_call_state(&update, virtual_call);
            return;
         },
         Envelope::BatteryChanged { level, scale } => {
            self.process_battery_changed(level, scale);
            return;
         },
         Envelope::Timeout {
            kind: TimeoutKind::QueryPhoneState,
            ..
         } => {
            self.timers.cancel(TimeoutKind::QueryPhoneState);
            self.on_query_phone_state_timeout();
            return;
         },
         Envelope::Timeout { kind, device } => {
            self.timers.cancel(kind);
            Envelope::Timeout { kind, device }
         },
         envelope => envelope,
      };

      match self.state {
         State::Disconnected => self.on_disconnected(envelope),
         State::Pending => self.on_pending(envelope),
         State::Connected => self.on_connected(envelope),
         State::AudioOn => self.on_audio_on(envelope),
         State::MultiPending => self.on_multi_pending(envelope),
      }
   }

   fn publish(&self) {
      *self.shared.snapshot.write() = Snapshot {
         state: self.state,
         connected: self.registry.connected().to_vec(),
         target: self.registry.target,
         incoming: self.registry.incoming,
         multi_disconnect: self.registry.multi_disconnect,
         active_audio: self.registry.active_audio,
         audio_state: self.audio_state,
      };
   }

   // === Transition driver ===

   fn transition(&mut self, next: State) {
      debug!("state {} -> {}", self.state, next);
      self.exit_state();
      self.prev_state = self.state;
      self.state = next;
      self.enter_state();
   }

   fn exit_state(&mut self) {
      if self.state == State::Connected {
         self.timers.cancel(TimeoutKind::QueryPhoneState);
      }
   }

   fn enter_state(&mut self) {
      match self.state {
         State::Disconnected => {
            debug!(
               "enter Disconnected, connected count {}",
               self.registry.connected().len()
            );
            self.registry.current = None;
            self.vr.reset();
            self.dialing_out = false;
            self.timers.cancel_all();
         },
         State::Connected => {
            // Drop connect attempts parked while resolving, unless we
            // come back from AudioOn mid-handover; a deferred connect
            // must not evict a device that just finished connecting.
            if self.prev_state != State::AudioOn {
               self
                  .deferred
                  .retain(|envelope| !matches!(envelope, Envelope::Connect(_)));
            }
         },
         _ => {},
      }
      if self.state.is_stable() {
         for envelope in self.deferred.drain(..).rev() {
            self.pending.push_front(envelope);
         }
      }
   }

   fn defer(&mut self, envelope: Envelope) {
      debug!("{}: deferring {envelope:?}", self.state);
      self.deferred.push(envelope);
   }

   // === Disconnected ===

   fn on_disconnected(&mut self, envelope: Envelope) {
      if !self.registry.is_empty()
         || self.registry.target.is_some()
         || self.registry.incoming.is_some()
      {
         error!("Disconnected: registry roles not empty");
      }
      match envelope {
         Envelope::Connect(device) => {
            debug!("Disconnected: connecting to {device}");
            self.broadcast_connection_state(
               device,
               ConnectionState::Connecting,
               ConnectionState::Disconnected,
            );
            if !self.native.connect(device) {
               warn!("{}", HfpError::NativeCommandFailure("connect"));
               self.broadcast_connection_state(
                  device,
                  ConnectionState::Disconnected,
                  ConnectionState::Connecting,
               );
               return;
            }
            self.registry.target = Some(device);
            self
               .timers
               .schedule(TimeoutKind::Connect, device, CONNECT_TIMEOUT);
            self.transition(State::Pending);
         },
         Envelope::Disconnect(_) => {},
         Envelope::DeviceStatusChanged(_) => {
            debug!("Disconnected: ignoring device status update");
         },
         Envelope::Stack {
            device,
            event: StackEvent::ConnectionState(event),
         } => self.disconnected_connection_event(event, device),
         Envelope::Stack { device, event } => {
            warn!("Disconnected: unexpected stack event {event:?} from {device}");
         },
         Envelope::Timeout { kind, device } => {
            debug!("Disconnected: stale {kind} timer for {device}");
         },
         envelope => {
            warn!("Disconnected: unexpected {envelope:?}");
         },
      }
   }

   fn disconnected_connection_event(&mut self, event: ConnectionEvent, device: Address) {
      debug!("Disconnected: connection event {event} from {device}");
      match event {
         ConnectionEvent::Disconnected => {
            warn!("Disconnected: ignoring disconnect event from {device}");
         },
         ConnectionEvent::Connected | ConnectionEvent::Connecting => {
            if self.policy.ok_to_connect(device) {
               info!("Disconnected: accepting incoming connection from {device}");
               if !self.phone_synced {
                  // First contact after startup, pull the real call state
                  self.query_phone_state();
                  self.phone_synced = true;
               }
               self.broadcast_connection_state(
                  device,
                  ConnectionState::Connecting,
                  ConnectionState::Disconnected,
               );
               self.registry.incoming = Some(device);
               self
                  .timers
                  .schedule(TimeoutKind::Connect, device, CONNECT_TIMEOUT);
               self.transition(State::Pending);
            } else {
               info!("Disconnected: rejecting incoming connection from {device}");
               self.native.disconnect(device);
               self.broadcast_connection_state(
                  device,
                  ConnectionState::Disconnected,
                  ConnectionState::Disconnected,
               );
            }
         },
         ConnectionEvent::Disconnecting => {
            warn!("Disconnected: ignoring disconnecting event from {device}");
         },
         ConnectionEvent::SlcConnected => {
            error!("Disconnected: unexpected SLC completion from {device}");
         },
      }
   }

   // === Pending ===

   fn on_pending(&mut self, envelope: Envelope) {
      match envelope {
         Envelope::Connect(_) | Envelope::ConnectAudio(_) => self.defer(envelope),
         Envelope::Disconnect(device) => {
            debug!("Pending: disconnect request for {device}");
            if self.registry.current.is_some() && self.registry.target == Some(device) {
               // cancel the outbound connection attempt
               self.broadcast_connection_state(
                  device,
                  ConnectionState::Disconnected,
                  ConnectionState::Connecting,
               );
               self.registry.target = None;
               self.timers.cancel(TimeoutKind::Connect);
            } else {
               self.defer(Envelope::Disconnect(device));
            }
         },
         Envelope::BindResponse {
            device,
            indicator,
            enabled,
         } => {
            self.native.bind_response(indicator, enabled, device);
         },
         Envelope::DeviceStatusChanged(_) => {
            debug!("Pending: ignoring device status update");
         },
         Envelope::Timeout {
            kind: TimeoutKind::Connect,
            device,
         } => {
            warn!("{}", HfpError::ConnectTimeout(device));
            self.pending_connection_event(ConnectionEvent::Disconnected, device);
         },
         Envelope::Stack { device, event } => match event {
            StackEvent::ConnectionState(event) => self.pending_connection_event(event, device),
            StackEvent::AudioState(event) => {
               warn!("Pending: unexpected audio event {event} from {device}");
            },
            // AT traffic during SLC establishment is answered in place
            event => self.on_at_event(event, device),
         },
         envelope => {
            warn!("Pending: unexpected {envelope:?}");
         },
      }
   }

   fn pending_connection_event(&mut self, event: ConnectionEvent, device: Address) {
      debug!("Pending: connection event {event} from {device}");
      let timer_device = self.timers.device_for(TimeoutKind::Connect);
      match event {
         ConnectionEvent::Disconnected => {
            if self.registry.contains(device) {
               // the previously connected device dropped while another
               // attempt resolves
               self.registry.remove_connected(device);
               self.device_params.remove(&device);
               self.broadcast_connection_state(
                  device,
                  ConnectionState::Disconnected,
                  ConnectionState::Disconnecting,
               );
               self.registry.current = None;
               self.audio.set_parameter(HEADSET_WBS, "off");
               if let Some(target) = self.registry.target {
                  if !self.native.connect(target) {
                     warn!("{}", HfpError::NativeCommandFailure("connect"));
                     self.broadcast_connection_state(
                        target,
                        ConnectionState::Disconnected,
                        ConnectionState::Connecting,
                     );
                     self.registry.target = None;
                     self.transition(State::Disconnected);
                  }
               } else {
                  self.registry.incoming = None;
                  if self.registry.is_empty() {
                     self.transition(State::Disconnected);
                  } else {
                     self.process_multi_connected(device);
                  }
               }
            } else if self.registry.target == Some(device) {
               // outgoing connection failed
               warn!("{}", HfpError::SlcEstablishmentFailure(device));
               self.broadcast_connection_state(
                  device,
                  ConnectionState::Disconnected,
                  ConnectionState::Connecting,
               );
               self.registry.target = None;
               if self.registry.is_empty() {
                  self.transition(State::Disconnected);
               } else {
                  self.transition(State::Connected);
               }
            } else if self.registry.incoming == Some(device) {
               self.broadcast_connection_state(
                  device,
                  ConnectionState::Disconnected,
                  ConnectionState::Connecting,
               );
               self.registry.incoming = None;
               if self.registry.is_empty() {
                  self.transition(State::Disconnected);
               } else {
                  self.transition(State::Connected);
               }
            } else {
               warn!("{}", HfpError::UnknownDeviceEvent(device));
            }
         },
         ConnectionEvent::Connected => {
            if self.registry.contains(device) {
               // disconnection failed, no SLC round trip happens here
               warn!("Pending: disconnection failed for {device}");
               self.broadcast_connection_state(
                  device,
                  ConnectionState::Connected,
                  ConnectionState::Disconnecting,
               );
               if let Some(target) = self.registry.target {
                  self.broadcast_connection_state(
                     target,
                     ConnectionState::Disconnected,
                     ConnectionState::Connecting,
                  );
               }
               self.registry.target = None;
               self.transition(State::Connected);
            } else if self.registry.target != Some(device)
               && self.registry.incoming != Some(device)
            {
               warn!("Pending: unknown incoming connection from {device}");
               if !self.policy.ok_to_connect(device) {
                  self.native.disconnect(device);
               }
            }
            // otherwise wait for the SLC completion event
         },
         ConnectionEvent::SlcConnected => {
            let mut prev = ConnectionState::Connecting;
            self.registry.add_connected(device);
            if self.registry.target == Some(device) {
               debug!("Pending: SLC complete for {device}, requested by us");
               self.registry.target = None;
               self.transition(State::Connected);
            } else if self.registry.incoming == Some(device) {
               debug!("Pending: SLC complete for {device}, requested by remote");
               self.registry.incoming = None;
               self.transition(State::Connected);
            } else {
               debug!("Pending: SLC complete for {device}, unknown source");
               prev = ConnectionState::Disconnected;
            }
            self.config_audio_parameters(device);
            self.query_phone_state();
            self.broadcast_connection_state(device, ConnectionState::Connected, prev);
         },
         ConnectionEvent::Connecting => {
            debug!("Pending: connecting event from {device}");
         },
         ConnectionEvent::Disconnecting => {
            debug!("Pending: disconnecting event from {device}");
         },
      }
      self.sweep_connect_timer(timer_device);
   }

   /// Cancels the connect timer once its device no longer holds an
   /// in-flight role.
   fn sweep_connect_timer(&mut self, timer_device: Option<Address>) {
      if let Some(device) = timer_device
         && self.registry.target != Some(device)
         && self.registry.incoming != Some(device)
      {
         debug!("canceling connect timer for {device}");
         self.timers.cancel(TimeoutKind::Connect);
      }
   }

   // === Connected ===

   fn on_connected(&mut self, envelope: Envelope) {
      match envelope {
         Envelope::Connect(device) => {
            debug!("Connected: connect request for {device}");
            if self.registry.contains(device) {
               warn!("Connected: {device} is already connected");
               return;
            }
            if self.registry.is_full() {
               let Some(evicted) = self.registry.eviction_candidate() else {
                  warn!("Connected: no eviction candidate for {device}");
                  return;
               };
               debug!("Connected: at capacity, disconnecting {evicted}");
               self.broadcast_connection_state(
                  device,
                  ConnectionState::Connecting,
                  ConnectionState::Disconnected,
               );
               if self.native.disconnect(evicted) {
                  self.broadcast_connection_state(
                     evicted,
                     ConnectionState::Disconnecting,
                     ConnectionState::Connected,
                  );
               } else {
                  warn!("Connected: failed to disconnect {evicted}");
                  self.broadcast_connection_state(
                     device,
                     ConnectionState::Disconnected,
                     ConnectionState::Connecting,
                  );
                  return;
               }
               self.registry.target = Some(device);
               if self.registry.max_connections() == 1 {
                  self.transition(State::Pending);
               } else {
                  self.registry.multi_disconnect = Some(evicted);
                  self.transition(State::MultiPending);
               }
            } else {
               self.broadcast_connection_state(
                  device,
                  ConnectionState::Connecting,
                  ConnectionState::Disconnected,
               );
               if !self.native.connect(device) {
                  self.broadcast_connection_state(
                     device,
                     ConnectionState::Disconnected,
                     ConnectionState::Connecting,
                  );
                  return;
               }
               self.registry.target = Some(device);
               self.transition(State::MultiPending);
            }
            self
               .timers
               .schedule(TimeoutKind::Connect, device, CONNECT_TIMEOUT);
         },
         Envelope::Disconnect(device) => {
            debug!("Connected: disconnect request for {device}");
            if !self.registry.contains(device) {
               warn!("Connected: {device} is not connected");
               return;
            }
            self.broadcast_connection_state(
               device,
               ConnectionState::Disconnecting,
               ConnectionState::Connected,
            );
            if !self.native.disconnect(device) {
               self.broadcast_connection_state(
                  device,
                  ConnectionState::Connected,
                  ConnectionState::Disconnecting,
               );
               return;
            }
            if self.registry.connected().len() > 1 {
               self.registry.multi_disconnect = Some(device);
               self.transition(State::MultiPending);
            } else {
               self.transition(State::Pending);
            }
         },
         Envelope::ConnectAudio(device) => {
            if !self.registry.contains(device) {
               warn!("Connected: audio request for unconnected {device}");
               return;
            }
            if !self.is_sco_acceptable() {
               warn!("Connected: no call, no voice recognition, rejecting audio to {device}");
               return;
            }
            let device = self.registry.active_audio.unwrap_or(device);
            if self.native.connect_audio(device) {
               self
                  .timers
                  .schedule(TimeoutKind::ConnectAudio, device, AUDIO_CONNECT_TIMEOUT);
            } else {
               warn!("{}", HfpError::NativeCommandFailure("connect_audio"));
            }
         },
         Envelope::DisconnectAudio => {
            warn!("Connected: no audio link to disconnect");
         },
         Envelope::VoiceRecognitionStart(_) => self.process_local_vr(true),
         Envelope::VoiceRecognitionStop(_) => self.process_local_vr(false),
         Envelope::VirtualCallStart(_) => {
            self.initiate_virtual_call();
         },
         Envelope::VirtualCallStop(_) => {
            self.terminate_virtual_call();
         },
         Envelope::ScoVolumeChanged(_) => {
            debug!("Connected: ignoring SCO volume change without audio");
         },
         Envelope::Stack { device, event } => match event {
            StackEvent::ConnectionState(event) => self.connected_connection_event(event, device),
            StackEvent::AudioState(event) => self.connected_audio_event(event, device),
            event => self.on_at_event(event, device),
         },
         envelope => {
            self.shared_command(envelope);
         },
      }
   }

   fn connected_connection_event(&mut self, event: ConnectionEvent, device: Address) {
      debug!("Connected: connection event {event} from {device}");
      match event {
         ConnectionEvent::Disconnected => {
            if self.registry.contains(device) {
               self.audio.set_parameter(HEADSET_WBS, "off");
               self.registry.remove_connected(device);
               self.device_params.remove(&device);
               if self.registry.is_empty() {
                  self.registry.current = None;
                  self.transition(State::Disconnected);
               } else {
                  self.process_multi_connected(device);
               }
               self.broadcast_connection_state(
                  device,
                  ConnectionState::Disconnected,
                  ConnectionState::Connected,
               );
            } else {
               warn!("{}", HfpError::UnknownDeviceEvent(device));
            }
         },
         ConnectionEvent::SlcConnected => {
            // should have been rejected at the Connected event already
            if self.policy.ok_to_connect(device) && !self.registry.is_full() {
               self.broadcast_connection_state(
                  device,
                  ConnectionState::Connected,
                  ConnectionState::Disconnected,
               );
               self.registry.add_connected(device);
               self.transition(State::Connected);
               self.config_audio_parameters(device);
            }
            self.query_phone_state();
         },
         ConnectionEvent::Connected => {
            if self.registry.contains(device) {
               self.registry.incoming = None;
               self.registry.target = None;
               return;
            }
            warn!("Connected: incoming connection from {device}");
            if !self.policy.ok_to_connect(device) || self.registry.is_full() {
               info!("Connected: rejecting incoming connection from {device}");
               self.native.disconnect(device);
            }
         },
         event => {
            error!("Connected: unexpected connection event {event} from {device}");
         },
      }
   }

   fn connected_audio_event(&mut self, event: AudioEvent, device: Address) {
      if !self.registry.contains(device) {
         warn!("audio event from unconnected device {device}");
         return;
      }
      if self.timers.device_for(TimeoutKind::ConnectAudio) == Some(device) {
         self.timers.cancel(TimeoutKind::ConnectAudio);
      }
      match event {
         AudioEvent::Connected => {
            if !self.is_sco_acceptable() {
               error!("audio opened without an acceptable reason, tearing down");
               self.native.disconnect_audio(device);
               return;
            }
            let prev = self.audio_state;
            self.audio_state = AudioState::Connected;
            self.set_audio_parameters(device);
            self.audio.set_sco_routing(true);
            self.registry.active_audio = Some(device);
            self.broadcast_audio_state(device, AudioState::Connected, prev);
            self.transition(State::AudioOn);
         },
         AudioEvent::Connecting => {
            let prev = self.audio_state;
            self.audio_state = AudioState::Connecting;
            self.broadcast_audio_state(device, AudioState::Connecting, prev);
         },
         AudioEvent::Disconnected => {
            if self.audio_state != AudioState::Disconnected {
               let prev = self.audio_state;
               self.audio_state = AudioState::Disconnected;
               if self.registry.active_audio == Some(device) {
                  self.registry.active_audio = None;
               }
               self.audio.set_sco_routing(false);
               self.broadcast_audio_state(device, AudioState::Disconnected, prev);
            }
         },
         AudioEvent::Disconnecting => {
            debug!("Connected: audio disconnecting on {device}");
         },
      }
   }

   // === AudioOn ===

   fn on_audio_on(&mut self, envelope: Envelope) {
      match envelope {
         Envelope::Connect(device) => {
            debug!("AudioOn: connect request for {device}");
            if self.registry.contains(device) {
               warn!("AudioOn: {device} is already connected");
               return;
            }
            if self.registry.max_connections() == 1 {
               // swap: close audio first, then replace the connection
               let Some(current) = self.registry.current else {
                  warn!("AudioOn: no current device");
                  return;
               };
               self.defer(Envelope::Disconnect(current));
               self.defer(Envelope::Connect(device));
               if self.native.disconnect_audio(current) {
                  debug!("AudioOn: disconnecting SCO from {current}");
               } else {
                  error!("AudioOn: SCO disconnect failed for {current}");
               }
               return;
            }
            if self.registry.is_full() {
               let Some(evicted) = self.registry.eviction_candidate() else {
                  warn!("AudioOn: no eviction candidate for {device}");
                  return;
               };
               debug!("AudioOn: at capacity, disconnecting {evicted}");
               self.broadcast_connection_state(
                  device,
                  ConnectionState::Connecting,
                  ConnectionState::Disconnected,
               );
               if self.native.disconnect(evicted) {
                  self.broadcast_connection_state(
                     evicted,
                     ConnectionState::Disconnecting,
                     ConnectionState::Connected,
                  );
               } else {
                  error!("AudioOn: failed to disconnect {evicted}");
                  self.broadcast_connection_state(
                     device,
                     ConnectionState::Disconnected,
                     ConnectionState::Connecting,
                  );
                  return;
               }
               self.registry.target = Some(device);
               self.registry.multi_disconnect = Some(evicted);
               self.transition(State::MultiPending);
            } else {
               self.broadcast_connection_state(
                  device,
                  ConnectionState::Connecting,
                  ConnectionState::Disconnected,
               );
               if !self.native.connect(device) {
                  self.broadcast_connection_state(
                     device,
                     ConnectionState::Disconnected,
                     ConnectionState::Connecting,
                  );
                  return;
               }
               self.registry.target = Some(device);
               self.transition(State::MultiPending);
            }
            self
               .timers
               .schedule(TimeoutKind::Connect, device, CONNECT_TIMEOUT);
         },
         Envelope::Disconnect(device) => {
            debug!("AudioOn: disconnect request for {device}");
            if !self.registry.contains(device) {
               warn!("AudioOn: {device} is not connected");
               return;
            }
            if self.registry.active_audio == Some(device) {
               // close the audio link first, then run the disconnect
               self.defer(Envelope::Disconnect(device));
               if self.native.disconnect_audio(device) {
                  debug!("AudioOn: disconnecting SCO audio");
               } else {
                  warn!("AudioOn: SCO disconnect failed for {device}");
                  self.transition(State::Connected);
               }
            } else {
               self.broadcast_connection_state(
                  device,
                  ConnectionState::Disconnecting,
                  ConnectionState::Connected,
               );
               if !self.native.disconnect(device) {
                  warn!("AudioOn: disconnect failed for {device}");
                  self.broadcast_connection_state(
                     device,
                     ConnectionState::Connected,
                     ConnectionState::Disconnecting,
                  );
                  return;
               }
               if self.registry.connected().len() > 1 {
                  self.registry.multi_disconnect = Some(device);
                  self.transition(State::MultiPending);
               }
            }
         },
         Envelope::ConnectAudio(device) => {
            if self.registry.active_audio == Some(device) {
               debug!("AudioOn: {device} already owns the audio link");
               return;
            }
            if !self.registry.contains(device) {
               warn!("AudioOn: audio request for unconnected {device}");
               return;
            }
            // exclusive resource: release the current holder first and
            // re-issue the request once back in Connected
            if let Some(active) = self.registry.active_audio {
               info!("AudioOn: handing audio over from {active} to {device}");
               self.defer(Envelope::ConnectAudio(device));
               self.native.disconnect_audio(active);
            }
         },
         Envelope::DisconnectAudio => {
            if let Some(active) = self.registry.active_audio {
               if self.native.disconnect_audio(active) {
                  debug!("AudioOn: disconnecting audio from {active}");
               } else {
                  error!("AudioOn: audio disconnect failed for {active}");
               }
            } else {
               warn!("AudioOn: no active audio device");
            }
         },
         Envelope::VoiceRecognitionStart(_) => self.process_local_vr(true),
         Envelope::VoiceRecognitionStop(_) => self.process_local_vr(false),
         Envelope::VirtualCallStart(_) => {
            self.initiate_virtual_call();
         },
         Envelope::VirtualCallStop(_) => {
            self.terminate_virtual_call();
         },
         Envelope::ScoVolumeChanged(volume) => {
            if let Some(active) = self.registry.active_audio {
               self.process_sco_volume(volume, active);
            }
         },
         Envelope::Timeout {
            kind: TimeoutKind::Connect,
            device,
         } => {
            warn!("{}", HfpError::ConnectTimeout(device));
            self.audio_on_connection_event(ConnectionEvent::Disconnected, device);
         },
         Envelope::Stack { device, event } => match event {
            StackEvent::ConnectionState(event) => self.audio_on_connection_event(event, device),
            StackEvent::AudioState(event) => self.audio_on_audio_event(event, device),
            event => self.on_at_event(event, device),
         },
         envelope => {
            self.shared_command(envelope);
         },
      }
   }

   fn audio_on_connection_event(&mut self, event: ConnectionEvent, device: Address) {
      debug!("AudioOn: connection event {event} from {device}");
      let timer_device = self.timers.device_for(TimeoutKind::Connect);
      match event {
         ConnectionEvent::Disconnected => {
            if self.registry.contains(device) {
               if self.registry.active_audio == Some(device)
                  && self.audio_state != AudioState::Disconnected
               {
                  self.audio_on_audio_event(AudioEvent::Disconnected, device);
               }
               self.registry.remove_connected(device);
               self.device_params.remove(&device);
               self.broadcast_connection_state(
                  device,
                  ConnectionState::Disconnected,
                  ConnectionState::Connected,
               );
               self.audio.set_parameter(HEADSET_WBS, "off");
               if self.registry.is_empty() {
                  self.transition(State::Disconnected);
               } else {
                  self.process_multi_connected(device);
               }
            } else if self.registry.target == Some(device) {
               // outgoing connection attempt failed while audio is up
               self.broadcast_connection_state(
                  device,
                  ConnectionState::Disconnected,
                  ConnectionState::Connecting,
               );
               self.registry.target = None;
            } else {
               warn!("{}", HfpError::UnknownDeviceEvent(device));
            }
         },
         ConnectionEvent::SlcConnected => {
            if self.policy.ok_to_connect(device) && !self.registry.is_full() {
               info!("AudioOn: accepted incoming connection from {device}");
               self.broadcast_connection_state(
                  device,
                  ConnectionState::Connected,
                  ConnectionState::Disconnected,
               );
               self.registry.add_connected(device);
               self.config_audio_parameters(device);
            }
            self.query_phone_state();
         },
         ConnectionEvent::Connected => {
            if self.registry.contains(device) {
               self.registry.incoming = None;
               self.registry.target = None;
               return;
            }
            warn!("AudioOn: incoming connection from {device}");
            if !self.policy.ok_to_connect(device) || self.registry.is_full() {
               info!("AudioOn: rejecting incoming connection from {device}");
               self.native.disconnect(device);
            }
         },
         event => {
            error!("AudioOn: unexpected connection event {event} from {device}");
         },
      }
      self.sweep_connect_timer(timer_device);
   }

   fn audio_on_audio_event(&mut self, event: AudioEvent, device: Address) {
      if !self.registry.contains(device) {
         warn!("audio event from unconnected device {device}");
         return;
      }
      if self.timers.device_for(TimeoutKind::ConnectAudio) == Some(device) {
         self.timers.cancel(TimeoutKind::ConnectAudio);
      }
      match event {
         AudioEvent::Disconnected => {
            if self.audio_state != AudioState::Disconnected {
               let prev = self.audio_state;
               self.audio_state = AudioState::Disconnected;
               if self.registry.active_audio == Some(device) {
                  self.registry.active_audio = None;
               }
               self.audio.set_sco_routing(false);
               self.broadcast_audio_state(device, AudioState::Disconnected, prev);
            }
            self.transition(State::Connected);
         },
         AudioEvent::Disconnecting => {
            debug!("AudioOn: audio disconnecting on {device}");
         },
         event => {
            warn!("AudioOn: unexpected audio event {event} from {device}");
         },
      }
   }

   // === MultiPending ===

   fn on_multi_pending(&mut self, envelope: Envelope) {
      match envelope {
         Envelope::Connect(_) => self.defer(envelope),
         Envelope::ConnectAudio(_) => {
            if let Some(current) = self.registry.current {
               if self.native.connect_audio(current) {
                  self
                     .timers
                     .schedule(TimeoutKind::ConnectAudio, current, AUDIO_CONNECT_TIMEOUT);
               }
            }
         },
         Envelope::DisconnectAudio => {
            if let Some(active) = self.registry.active_audio {
               if self.native.disconnect_audio(active) {
                  debug!("MultiPending: disconnecting SCO audio from {active}");
               } else {
                  error!("MultiPending: audio disconnect failed for {active}");
               }
            }
         },
         Envelope::Disconnect(device) => {
            debug!("MultiPending: disconnect request for {device}");
            if self.registry.contains(device) && self.registry.target == Some(device) {
               // cancel connection to the target device
               self.broadcast_connection_state(
                  device,
                  ConnectionState::Disconnected,
                  ConnectionState::Connecting,
               );
               self.registry.target = None;
               self.timers.cancel(TimeoutKind::Connect);
            } else {
               self.defer(Envelope::Disconnect(device));
            }
         },
         Envelope::VoiceRecognitionStart(device) => {
            if self.registry.contains(device) {
               self.process_local_vr(true);
            }
         },
         Envelope::VoiceRecognitionStop(device) => {
            if self.registry.contains(device) {
               self.process_local_vr(false);
            }
         },
         Envelope::VirtualCallStart(device) => {
            if self.registry.contains(device) {
               self.initiate_virtual_call();
            }
         },
         Envelope::VirtualCallStop(device) => {
            if self.registry.contains(device) {
               self.terminate_virtual_call();
            }
         },
         Envelope::ScoVolumeChanged(volume) => {
            if let Some(active) = self.registry.active_audio {
               self.process_sco_volume(volume, active);
            }
         },
         Envelope::Timeout {
            kind: TimeoutKind::Connect,
            device,
         } => {
            warn!("{}", HfpError::ConnectTimeout(device));
            self.multi_pending_connection_event(ConnectionEvent::Disconnected, device);
         },
         Envelope::Stack { device, event } => match event {
            StackEvent::ConnectionState(event) => {
               self.multi_pending_connection_event(event, device);
            },
            StackEvent::AudioState(event) => self.multi_pending_audio_event(event, device),
            event => self.on_at_event(event, device),
         },
         envelope => {
            self.shared_command(envelope);
         },
      }
   }

   fn multi_pending_connection_event(&mut self, event: ConnectionEvent, device: Address) {
      debug!("MultiPending: connection event {event} from {device}");
      let timer_device = self.timers.device_for(TimeoutKind::Connect);
      match event {
         ConnectionEvent::Disconnected => {
            if self.registry.contains(device) {
               if self.registry.multi_disconnect == Some(device) {
                  // the eviction completed, proceed with the target
                  self.registry.remove_connected(device);
                  self.device_params.remove(&device);
                  self.broadcast_connection_state(
                     device,
                     ConnectionState::Disconnected,
                     ConnectionState::Disconnecting,
                  );
                  if let Some(target) = self.registry.target {
                     if !self.native.connect(target) {
                        warn!("{}", HfpError::NativeCommandFailure("connect"));
                        self.broadcast_connection_state(
                           target,
                           ConnectionState::Disconnected,
                           ConnectionState::Connecting,
                        );
                        self.registry.target = None;
                        if self.registry.is_empty() {
                           warn!("MultiPending: no connected devices left");
                           self.transition(State::Disconnected);
                        } else {
                           self.process_multi_connected(device);
                        }
                     }
                  } else {
                     self.registry.incoming = None;
                     if self.registry.is_empty() {
                        self.transition(State::Disconnected);
                     } else {
                        self.process_multi_connected(device);
                     }
                  }
               } else {
                  // another connected device dropped while resolving
                  self.registry.remove_connected(device);
                  self.device_params.remove(&device);
                  self.broadcast_connection_state(
                     device,
                     ConnectionState::Disconnected,
                     ConnectionState::Connected,
                  );
               }
            } else if self.registry.target == Some(device) {
               self.broadcast_connection_state(
                  device,
                  ConnectionState::Disconnected,
                  ConnectionState::Connecting,
               );
               self.registry.target = None;
               if self.registry.is_empty() {
                  self.transition(State::Disconnected);
               } else if self.audio_state == AudioState::Connected {
                  self.transition(State::AudioOn);
               } else {
                  self.transition(State::Connected);
               }
            } else {
               warn!("{}", HfpError::UnknownDeviceEvent(device));
            }
         },
         ConnectionEvent::Connected => {
            if self.registry.contains(device) {
               // disconnection failure does not go through SLC
               warn!("MultiPending: disconnection failed for {device}");
               self.broadcast_connection_state(
                  device,
                  ConnectionState::Connected,
                  ConnectionState::Disconnecting,
               );
               if let Some(target) = self.registry.target {
                  self.broadcast_connection_state(
                     target,
                     ConnectionState::Disconnected,
                     ConnectionState::Connecting,
                  );
               }
               self.registry.target = None;
               self.registry.multi_disconnect = None;
               if self.audio_state == AudioState::Connected {
                  self.transition(State::AudioOn);
               } else {
                  self.transition(State::Connected);
               }
            } else if self.registry.target != Some(device) {
               warn!("MultiPending: unknown incoming connection from {device}");
               if !self.policy.ok_to_connect(device) || self.registry.is_full() {
                  info!("MultiPending: rejecting incoming connection from {device}");
                  self.native.disconnect(device);
               }
            }
            // otherwise wait for the SLC completion event
         },
         ConnectionEvent::SlcConnected => {
            let mut prev = ConnectionState::Connecting;
            self.registry.add_connected(device);
            if self.registry.target == Some(device) {
               debug!("MultiPending: SLC complete for {device}, requested by us");
               self.registry.target = None;
               if self.audio_state == AudioState::Connected {
                  self.transition(State::AudioOn);
               } else {
                  self.transition(State::Connected);
               }
            } else {
               debug!("MultiPending: SLC complete for {device}, unknown source");
               prev = ConnectionState::Disconnected;
            }
            self.config_audio_parameters(device);
            self.query_phone_state();
            self.broadcast_connection_state(device, ConnectionState::Connected, prev);
         },
         ConnectionEvent::Connecting => {
            debug!("MultiPending: connecting event from {device}");
         },
         ConnectionEvent::Disconnecting => {
            debug!("MultiPending: disconnecting event from {device}");
         },
      }
      self.sweep_connect_timer(timer_device);
   }

   fn multi_pending_audio_event(&mut self, event: AudioEvent, device: Address) {
      if !self.registry.contains(device) {
         warn!("audio event from unconnected device {device}");
         return;
      }
      if self.timers.device_for(TimeoutKind::ConnectAudio) == Some(device) {
         self.timers.cancel(TimeoutKind::ConnectAudio);
      }
      // audio changes keep the machine in MultiPending; the other
      // device is still connecting or disconnecting
      match event {
         AudioEvent::Connected => {
            if !self.is_sco_acceptable() {
               error!("audio opened without an acceptable reason, tearing down");
               self.native.disconnect_audio(device);
               return;
            }
            let prev = self.audio_state;
            self.audio_state = AudioState::Connected;
            self.set_audio_parameters(device);
            self.audio.set_sco_routing(true);
            self.registry.active_audio = Some(device);
            self.broadcast_audio_state(device, AudioState::Connected, prev);
         },
         AudioEvent::Connecting => {
            let prev = self.audio_state;
            self.audio_state = AudioState::Connecting;
            self.broadcast_audio_state(device, AudioState::Connecting, prev);
         },
         AudioEvent::Disconnected => {
            if self.audio_state != AudioState::Disconnected {
               let prev = self.audio_state;
               self.audio_state = AudioState::Disconnected;
               if self.registry.active_audio == Some(device) {
                  self.registry.active_audio = None;
               }
               self.audio.set_sco_routing(false);
               self.broadcast_audio_state(device, AudioState::Disconnected, prev);
            }
         },
         AudioEvent::Disconnecting => {
            debug!("MultiPending: audio disconnecting on {device}");
         },
      }
   }

   /// Picks the follow-up state after one of several connected devices
   /// dropped out.
   fn process_multi_connected(&mut self, device: Address) {
      debug!("{}: resolving multi-device fallback for {device}", self.state);
      match self.state {
         State::Pending => {
            if self.registry.current == Some(device) {
               self.registry.promote_latest();
               self.transition(State::Connected);
            } else if self.audio_state == AudioState::Connected {
               self.transition(State::AudioOn);
            } else {
               self.transition(State::Connected);
            }
         },
         State::Connected => {
            if self.registry.active_audio == Some(device) {
               self.registry.active_audio = None;
            }
            if self.registry.current == Some(device) {
               self.registry.promote_latest();
            }
            self.transition(State::Connected);
         },
         State::AudioOn => {
            if self.registry.current == Some(device) {
               self.registry.promote_latest();
            }
            if self.audio_state != AudioState::Connected {
               self.transition(State::Connected);
            }
         },
         State::MultiPending => {
            if self.registry.active_audio == Some(device) {
               self.registry.active_audio = None;
            }
            if self.registry.current == Some(device) {
               self.registry.promote_latest();
            }
            if self.audio_state == AudioState::Connected {
               self.transition(State::AudioOn);
            } else {
               self.transition(State::Connected);
            }
         },
         State::Disconnected => {},
      }
      // re-announce the device that is now current
      if let Some(current) = self.registry.current {
         self.broadcast_connection_state(
            current,
            ConnectionState::Connected,
            ConnectionState::Disconnected,
         );
      }
   }

   /// Command envelopes handled identically in Connected, AudioOn and
   /// MultiPending. Returns `false` when the envelope stays unhandled.
   fn shared_command(&mut self, envelope: Envelope) -> bool {
      match envelope {
         Envelope::DeviceStatusChanged(status) => {
            self.native.notify_device_status(status);
         },
         Envelope::SendClccResponse(entry) => self.process_send_clcc(&entry),
         Envelope::SendVendorResultCode {
            device,
            command,
            arg,
         } => {
            self
               .native
               .at_response_string(&format!("{command}: {arg}"), device);
         },
         Envelope::BindResponse {
            device,
            indicator,
            enabled,
         } => {
            self.native.bind_response(indicator, enabled, device);
         },
         Envelope::EnableWbs(device) => {
            self.native.configure_codec(device, CodecId::Msbc);
         },
         Envelope::DisableWbs(device) => {
            self.native.configure_codec(device, CodecId::Cvsd);
         },
         Envelope::Timeout {
            kind: TimeoutKind::DialingOut,
            device,
         } => self.on_dialing_timeout(device),
         Envelope::Timeout {
            kind: TimeoutKind::VoiceRecognitionStart,
            device,
         } => self.on_vr_timeout(device),
         Envelope::Timeout {
            kind: TimeoutKind::ClccResponse,
            device,
         } => {
            warn!("{}", HfpError::CallListResponseTimeout);
            self.native.clcc_response(&ClccEntry::terminator(), device);
         },
         Envelope::Timeout {
            kind: TimeoutKind::ConnectAudio,
            device,
         } => {
            warn!("{}", HfpError::AudioConnectTimeout(device));
            self.process_audio_event(AudioEvent::Disconnected, device);
         },
         envelope => {
            warn!("{}: unexpected {envelope:?}", self.state);
            return false;
         },
      }
      true
   }

   /// Routes a synthesized audio event to the current state's handler.
   fn process_audio_event(&mut self, event: AudioEvent, device: Address) {
      match self.state {
         State::Connected => self.connected_audio_event(event, device),
         State::AudioOn => self.audio_on_audio_event(event, device),
         State::MultiPending => self.multi_pending_audio_event(event, device),
         _ => warn!("{}: dropping audio event {event} for {device}", self.state),
      }
   }

   // === AT / telephony processors ===

   fn on_at_event(&mut self, event: StackEvent, device: Address) {
      match event {
         StackEvent::VoiceRecognition(state) => self.process_vr_event(state, device),
         StackEvent::AnswerCall => self.process_answer_call(device),
         StackEvent::HangupCall => self.process_hangup_call(device),
         StackEvent::VolumeChanged { kind, volume } => {
            self.process_volume_event(kind, volume, device);
         },
         StackEvent::DialCall(number) => self.process_dial_call(&number, device),
         StackEvent::SendDtmf(digit) => self.process_send_dtmf(digit, device),
         StackEvent::NoiseReduction(enable) => self.process_noise_reduction(enable, device),
         StackEvent::WidebandSpeech(codec) => self.process_wbs_event(codec, device),
         StackEvent::AtChld(action) => self.process_at_chld(action, device),
         StackEvent::SubscriberNumberRequest => self.process_subscriber_number(device),
         StackEvent::AtCind => self.process_at_cind(device),
         StackEvent::AtCops => self.process_at_cops(device),
         StackEvent::AtClcc => self.process_at_clcc(device),
         StackEvent::UnknownAt(command) => self.process_unknown_at(&command, device),
         StackEvent::KeyPressed => self.process_key_pressed(device),
         StackEvent::AtBind(list) => self.process_at_bind(&list, device),
         StackEvent::AtBiev { indicator, value } => {
            self.process_at_biev(indicator, value, device);
         },
         event => warn!("{}: unexpected stack event {event:?}", self.state),
      }
   }

   fn process_vr_event(&mut self, state: VrState, device: Address) {
      debug!(
         "voice recognition event {state} from {device}, started={} awaiting={}",
         self.vr.started, self.vr.awaiting_start
      );
      match state {
         VrState::Started => {
            if !self.virtual_call && !self.phone.is_in_call() {
               self.events.emit(ProfileEvent::VoiceRecognitionRequested { device });
               self.expect_voice_recognition(device);
            } else {
               // no recognition while a call is up
               self
                  .native
                  .at_response_code(AtResponseCode::Error, 0, device);
            }
         },
         VrState::Stopped => {
            if self.vr.started || self.vr.awaiting_start {
               self.native.at_response_code(AtResponseCode::Ok, 0, device);
               self.vr.reset();
               self.timers.cancel(TimeoutKind::VoiceRecognitionStart);
               if !self.phone.is_in_call()
                  && let Some(active) = self.registry.active_audio
               {
                  self.native.disconnect_audio(active);
                  self.audio.set_parameter(A2DP_SUSPENDED, "false");
               }
            } else {
               self
                  .native
                  .at_response_code(AtResponseCode::Error, 0, device);
            }
         },
      }
   }

   fn process_local_vr(&mut self, started: bool) {
      if started {
         if self.vr.started || self.phone.is_in_call() {
            warn!("voice recognition start rejected, call active or already started");
            return;
         }
         self.vr.started = true;

         let mut need_audio = true;
         let device = if self.vr.awaiting_start {
            let Some(device) = self.timers.device_for(TimeoutKind::VoiceRecognitionStart)
            else {
               return;
            };
            debug!("voice recognition started after headset request");
            self.vr.awaiting_start = false;
            self.native.at_response_code(AtResponseCode::Ok, 0, device);
            self.timers.cancel(TimeoutKind::VoiceRecognitionStart);
            Some(device)
         } else {
            debug!("voice recognition started locally");
            let Some(current) = self.registry.current else {
               warn!("no device for voice recognition");
               return;
            };
            need_audio = self.native.start_voice_recognition(current);
            Some(current)
         };

         if need_audio && self.state != State::AudioOn {
            debug!("initiating audio connection for voice recognition");
            // media streaming must pause before SCO opens
            self.audio.set_parameter(A2DP_SUSPENDED, "true");
            if let Some(device) = device {
               if self.native.connect_audio(device) {
                  self
                     .timers
                     .schedule(TimeoutKind::ConnectAudio, device, AUDIO_CONNECT_TIMEOUT);
               }
            } else {
               error!("no device found for voice recognition audio");
            }
         }
      } else {
         debug!(
            "voice recognition stopped, started={} awaiting={}",
            self.vr.started, self.vr.awaiting_start
         );
         if self.vr.started || self.vr.awaiting_start {
            self.vr.reset();
            self.timers.cancel(TimeoutKind::VoiceRecognitionStart);
            let stopped = self
               .registry
               .current
               .map(|current| self.native.stop_voice_recognition(current))
               .unwrap_or(false);
            if stopped
               && !self.phone.is_in_call()
               && let Some(active) = self.registry.active_audio
            {
               self.native.disconnect_audio(active);
               self.audio.set_parameter(A2DP_SUSPENDED, "false");
            }
         }
      }
   }

   fn expect_voice_recognition(&mut self, device: Address) {
      self.vr.awaiting_start = true;
      self
         .timers
         .schedule(TimeoutKind::VoiceRecognitionStart, device, START_VR_TIMEOUT);
   }

   fn on_vr_timeout(&mut self, device: Address) {
      if self.vr.awaiting_start {
         self.vr.awaiting_start = false;
         warn!("{}", HfpError::VoiceRecognitionTimeout);
         self
            .native
            .at_response_code(AtResponseCode::Error, 0, device);
      }
   }

   fn process_answer_call(&mut self, device: Address) {
      if let Err(err) = self.telephony.answer_call() {
         error!("answer call failed for {device}: {err}");
      }
   }

   fn process_hangup_call(&mut self, device: Address) {
      // a CHUP from the headset ends a virtual call locally
      if self.virtual_call {
         self.terminate_virtual_call();
      } else if let Err(err) = self.telephony.hangup_call() {
         error!("hangup failed for {device}: {err}");
      }
   }

   fn process_dial_call(&mut self, number: &str, device: Address) {
      if self.dialing_out {
         debug!("already dialing, rejecting request from {device}");
         self
            .native
            .at_response_code(AtResponseCode::Error, 0, device);
         return;
      }
      let dial_number: SmolStr = if number.is_empty() {
         match self.telephony.last_dialed_number() {
            Some(number) => number,
            None => {
               debug!("redial requested but no last dialed number");
               self
                  .native
                  .at_response_code(AtResponseCode::Error, 0, device);
               return;
            },
         }
      } else if let Some(rest) = number.strip_prefix('>') {
         // memory dialing resolves to the last dialed number
         if rest.starts_with("9999") {
            self
               .native
               .at_response_code(AtResponseCode::Error, 0, device);
            return;
         }
         match self.telephony.last_dialed_number() {
            Some(number) => number,
            None => {
               debug!("memory dial requested but no last dialed number");
               self
                  .native
                  .at_response_code(AtResponseCode::Error, 0, device);
               return;
            },
         }
      } else {
         number.strip_suffix(';').unwrap_or(number).into()
      };

      // an in-progress virtual call must end before a real one starts
      self.terminate_virtual_call();

      if let Err(err) = self.telephony.dial(&dial_number) {
         error!("dial failed for {device}: {err}");
         self
            .native
            .at_response_code(AtResponseCode::Error, 0, device);
         return;
      }
      self.dialing_out = true;
      self
         .timers
         .schedule(TimeoutKind::DialingOut, device, DIALING_OUT_TIMEOUT);
   }

   fn on_dialing_timeout(&mut self, device: Address) {
      if self.dialing_out {
         self.dialing_out = false;
         warn!("{}", HfpError::DialingTimeout);
         self
            .native
            .at_response_code(AtResponseCode::Error, 0, device);
      }
   }

   fn process_volume_event(&mut self, kind: VolumeKind, volume: u8, device: Address) {
      if self.registry.active_audio != Some(device) && self.phone.is_in_call() {
         warn!("ignoring volume event from non-audio device {device} during call");
         return;
      }
      match kind {
         VolumeKind::Speaker => {
            self.phone.speaker_volume = volume;
            self
               .audio
               .set_stream_volume(volume, self.state == State::AudioOn);
         },
         VolumeKind::Microphone => {
            self.phone.mic_volume = volume;
         },
      }
   }

   fn process_sco_volume(&mut self, volume: u8, device: Address) {
      if self.phone.speaker_volume != volume {
         self.phone.speaker_volume = volume;
         self.native.set_volume(VolumeKind::Speaker, volume, device);
      }
   }

   fn process_send_dtmf(&mut self, digit: char, device: Address) {
      if let Err(err) = self.telephony.send_dtmf(digit) {
         error!("DTMF failed for {device}: {err}");
      }
   }

   fn process_noise_reduction(&mut self, enable: bool, device: Address) {
      if let Some(nrec) = self.device_params.get_mut(&device) {
         *nrec = enable;
         debug!("NREC for {device} set to {enable}");
      } else {
         error!("noise-reduction event for untracked device {device}");
      }
      if self.registry.active_audio == Some(device) && self.audio_state == AudioState::Connected
      {
         self.set_audio_parameters(device);
      }
   }

   fn process_wbs_event(&mut self, codec: CodecId, device: Address) {
      debug!("wideband speech {codec} for {device}");
      let value = if codec == CodecId::Msbc { "on" } else { "off" };
      self.audio.set_parameter(HEADSET_WBS, value);
   }

   fn process_at_chld(&mut self, action: u32, device: Address) {
      let code = match self.telephony.process_chld(action) {
         Ok(true) => AtResponseCode::Ok,
         Ok(false) => AtResponseCode::Error,
         Err(err) => {
            error!("CHLD {action} failed: {err}");
            AtResponseCode::Error
         },
      };
      self.native.at_response_code(code, 0, device);
   }

   fn process_subscriber_number(&mut self, device: Address) {
      match self.telephony.subscriber_number() {
         Ok(Some(number)) => {
            let toa = toa_for_number(&number);
            self
               .native
               .at_response_string(&format!("+CNUM: ,\"{number}\",{toa},,4"), device);
            self.native.at_response_code(AtResponseCode::Ok, 0, device);
         },
         Ok(None) => {
            error!("no subscriber number available");
            self
               .native
               .at_response_code(AtResponseCode::Error, 0, device);
         },
         Err(err) => {
            error!("subscriber number query failed: {err}");
            self
               .native
               .at_response_code(AtResponseCode::Error, 0, device);
         },
      }
   }

   fn process_at_cind(&mut self, device: Address) {
      // carkits insist on a proper CIND response for the virtual call too
      let (call, call_setup) = if self.virtual_call {
         (1, 0)
      } else {
         (self.phone.num_active, self.phone.num_held)
      };
      self.native.cind_response(
         self.phone.service,
         call,
         call_setup,
         self.phone.call_state,
         self.phone.signal,
         self.phone.roam,
         self.phone.battery_charge,
         device,
      );
   }

   fn process_at_cops(&mut self, device: Address) {
      let operator = match self.telephony.network_operator() {
         Ok(Some(operator)) => operator,
         Ok(None) => SmolStr::default(),
         Err(err) => {
            error!("operator query failed: {err}");
            SmolStr::default()
         },
      };
      self.native.cops_response(&operator, device);
   }

   fn process_at_clcc(&mut self, device: Address) {
      if self.virtual_call {
         let number = match self.telephony.subscriber_number() {
            Ok(Some(number)) => number,
            _ => SmolStr::default(),
         };
         let kind = toa_for_number(&number);
         self.native.clcc_response(
            &ClccEntry {
               index: 1,
               direction: 0,
               status: 0,
               mode: 0,
               multiparty: false,
               number,
               kind,
            },
            device,
         );
         self.native.clcc_response(&ClccEntry::terminator(), device);
         return;
      }
      match self.telephony.list_current_calls() {
         Ok(true) => {
            debug!("starting call-list response timer for {device}");
            self
               .timers
               .schedule(TimeoutKind::ClccResponse, device, CLCC_RSP_TIMEOUT);
         },
         Ok(false) => {
            self.native.clcc_response(&ClccEntry::terminator(), device);
         },
         Err(err) => {
            error!("call listing failed: {err}");
            self.native.clcc_response(&ClccEntry::terminator(), device);
         },
      }
   }

   fn process_send_clcc(&mut self, entry: &ClccEntry) {
      let Some(device) = self.timers.device_for(TimeoutKind::ClccResponse) else {
         return;
      };
      if entry.index == 0 {
         self.timers.cancel(TimeoutKind::ClccResponse);
      }
      self.native.clcc_response(entry, device);
   }

   fn process_unknown_at(&mut self, command: &str, device: Address) {
      debug!("unknown AT command from {device}: {command}");
      let command = at::normalize(command);
      // phonebook transfer is not supported
      if command.starts_with("+CSCS") || command.starts_with("+CPBS") || command.starts_with("+CPBR")
      {
         self
            .native
            .at_response_code(AtResponseCode::Error, 0, device);
         return;
      }
      self.process_vendor_at(&command, device);
   }

   fn process_vendor_at(&mut self, command: &str, device: Address) {
      match at::parse_vendor_command(command) {
         Ok(vendor) => {
            if vendor.command == "+XAPL" {
               self.process_at_xapl(&vendor.args, device);
            }
            self.events.emit(ProfileEvent::VendorCommand {
               device,
               command: vendor.command,
               company_id: vendor.company_id,
               args: vendor.args,
            });
            self.native.at_response_code(AtResponseCode::Ok, 0, device);
         },
         Err(err) => {
            warn!("{err}");
            self
               .native
               .at_response_code(AtResponseCode::Error, 0, device);
         },
      }
   }

   fn process_at_xapl(&mut self, args: &at::AtArgs, device: Address) {
      if args.len() != 2 {
         warn!("XAPL expects 2 arguments, got {}", args.len());
         return;
      }
      if !matches!(args[0], at::AtArg::Text(_)) || !matches!(args[1], at::AtArg::Int(_)) {
         warn!("XAPL argument types do not match");
         return;
      }
      // feature bit 2: battery level reporting only
      self.native.at_response_string("+XAPL=iPhone,2", device);
   }

   fn process_key_pressed(&mut self, device: Address) {
      if self.phone.is_ringing() {
         if let Err(err) = self.telephony.answer_call() {
            error!("answer via key press failed: {err}");
         }
      } else if self.phone.num_active > 0 {
         if self.state != State::AudioOn {
            if let Some(current) = self.registry.current
               && self.native.connect_audio(current)
            {
               self
                  .timers
                  .schedule(TimeoutKind::ConnectAudio, current, AUDIO_CONNECT_TIMEOUT);
            }
         } else if let Err(err) = self.telephony.hangup_call() {
            error!("hangup via key press failed: {err}");
         }
      } else {
         let Some(number) = self.telephony.last_dialed_number() else {
            debug!("key press redial but no last dialed number");
            return;
         };
         if let Err(err) = self.telephony.dial(&number) {
            error!("redial via key press failed for {device}: {err}");
         }
      }
   }

   fn process_at_bind(&mut self, list: &str, device: Address) {
      debug!("BIND indicator list from {device}: {list}");
      for indicator in at::parse_indicator_ids(list) {
         match indicator {
            at::HF_INDICATOR_ENHANCED_DRIVER_SAFETY | at::HF_INDICATOR_BATTERY_LEVEL => {
               self.events.emit(ProfileEvent::IndicatorChanged {
                  device,
                  indicator,
                  value: -1,
               });
            },
            other => debug!("unsupported HF indicator {other}"),
         }
      }
   }

   fn process_at_biev(&mut self, indicator: u16, value: i32, device: Address) {
      debug!("BIEV from {device}: indicator={indicator} value={value}");
      self.events.emit(ProfileEvent::IndicatorChanged {
         device,
         indicator,
         value,
      });
   }

   // === Call state ===

   fn process_call_state(&mut self, update: &CallUpdate, is_virtual: bool) {
      self.timers.cancel(TimeoutKind::QueryPhoneState);
      self.phone_query_retried = false;
      self.phone.apply(update);

      if self.dialing_out && update.state == CallState::Dialing {
         let Some(device) = self.timers.device_for(TimeoutKind::DialingOut) else {
            return;
         };
         self.native.at_response_code(AtResponseCode::Ok, 0, device);
         self.timers.cancel(TimeoutKind::DialingOut);
         self.dialing_out = false;
      }

      // release the audio owner role when the last call ends
      if self.registry.active_audio.is_some()
         && !self.phone.is_in_call()
         && update.state == CallState::Idle
      {
         self.registry.active_audio = None;
      }

      debug!(
         "call state: active={} held={} state={} virtual={is_virtual}",
         update.num_active, update.num_held, update.state
      );

      if is_virtual {
         if self.state != State::Disconnected {
            self.native.phone_state_change(
               update.num_active,
               update.num_held,
               update.state,
               &update.number,
               update.kind,
            );
         }
         return;
      }

      // a real call always preempts the virtual overlay
      if update.num_active > 0 || update.num_held > 0 || update.state != CallState::Idle {
         if self.terminate_virtual_call() {
            // termination reset the snapshot, restore the real values
            self.phone.apply(update);
         }
      }

      self.process_a2dp_state(update);

      if !self.virtual_call && self.state != State::Disconnected {
         self.native.phone_state_change(
            update.num_active,
            update.num_held,
            update.state,
            &update.number,
            update.kind,
         );
      }
   }

   /// Some headsets cannot open SCO while media streams; suspend before
   /// call setup and resume once everything is idle.
   fn process_a2dp_state(&mut self, update: &CallUpdate) {
      if update.num_active == 0
         && update.num_held == 0
         && matches!(update.state, CallState::Incoming | CallState::Dialing)
         && self.state != State::AudioOn
      {
         debug!("suspending media stream for call setup");
         self.need_resume_a2dp = true;
         self.audio.set_parameter(A2DP_SUSPENDED, "true");
      } else if update.state == CallState::Idle
         && self.need_resume_a2dp
         && update.num_active == 0
         && update.num_held == 0
      {
         debug!("resuming media stream after call");
         self.need_resume_a2dp = false;
         self.audio.set_parameter(A2DP_SUSPENDED, "false");
      }
   }

   fn process_battery_changed(&mut self, level: i32, scale: i32) {
      if level < 0 || scale <= 0 {
         error!("bad battery update: level={level} scale={scale}");
         return;
      }
      self.phone.battery_charge = (level * 5 / scale) as u32;
   }

   // === Virtual call overlay ===

   fn initiate_virtual_call(&mut self) -> bool {
      debug!("virtual call start requested");
      if self.phone.is_in_call() || self.vr.started {
         error!("virtual call rejected, call or voice recognition in progress");
         return false;
      }
      self.audio.set_parameter(A2DP_SUSPENDED, "true");
      self.process_call_state(&CallUpdate::new(0, 0, CallState::Dialing), true);
      self.process_call_state(&CallUpdate::new(0, 0, CallState::Alerting), true);
      self.process_call_state(&CallUpdate::new(1, 0, CallState::Idle), true);
      self.virtual_call = true;
      debug!("virtual call started");
      true
   }

   fn terminate_virtual_call(&mut self) -> bool {
      if !self.virtual_call {
         return false;
      }
      debug!("terminating virtual call");
      self.process_call_state(&CallUpdate::new(0, 0, CallState::Idle), true);
      self.virtual_call = false;
      self.audio.set_parameter(A2DP_SUSPENDED, "false");
      true
   }

   // === Helpers ===

   fn is_sco_acceptable(&self) -> bool {
      policy::evaluate_sco_acceptable(
         &self.phone,
         &self.vr,
         self.force_sco,
         self.audio_route_allowed,
         self.cfg.inband_ringing,
      )
   }

   fn query_phone_state(&mut self) {
      match self.telephony.query_phone_state() {
         Ok(()) => {
            let device = self.registry.current.unwrap_or_else(Address::any);
            self.timers.schedule(
               TimeoutKind::QueryPhoneState,
               device,
               QUERY_PHONE_STATE_TIMEOUT,
            );
         },
         Err(err) => error!("phone state query failed: {err}"),
      }
   }

   fn on_query_phone_state_timeout(&mut self) {
      if self.phone_query_retried {
         warn!("{}, giving up", HfpError::QueryPhoneStateTimeout);
      } else {
         warn!("{}, retrying once", HfpError::QueryPhoneStateTimeout);
         self.phone_query_retried = true;
         self.query_phone_state();
      }
   }

   fn config_audio_parameters(&mut self, device: Address) {
      // NREC defaults on; the headset overrides it later
      self.device_params.insert(device, true);
      self.audio.set_parameter(HEADSET_NREC, "on");
      self
         .audio
         .set_parameter(HEADSET_NAME, &device.to_string());
   }

   fn set_audio_parameters(&mut self, device: Address) {
      let nrec = self.device_params.get(&device).copied().unwrap_or_else(|| {
         error!("no audio parameters for {device}");
         false
      });
      self
         .audio
         .set_parameter(HEADSET_NREC, if nrec { "on" } else { "off" });
      self
         .audio
         .set_parameter(HEADSET_NAME, &device.to_string());
   }

   fn broadcast_connection_state(
      &mut self,
      device: Address,
      state: ConnectionState,
      prev: ConnectionState,
   ) {
      debug!("connection state {device}: {prev} -> {state}");
      if prev == ConnectionState::Connected {
         // the headset carrying the virtual call is going away
         self.terminate_virtual_call();
      }
      self.events.emit(ProfileEvent::ConnectionStateChanged {
         device,
         prev,
         state,
      });
   }

   fn broadcast_audio_state(&mut self, device: Address, state: AudioState, prev: AudioState) {
      debug!("audio state {device}: {prev} -> {state}");
      if prev == AudioState::Connected {
         self.terminate_virtual_call();
      }
      self.events.emit(ProfileEvent::AudioStateChanged {
         device,
         prev,
         state,
      });
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use parking_lot::Mutex;
   use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

   fn addr(last: u8) -> Address {
      Address::new([0x00, 0x1b, 0xdc, 0x07, 0x31, last])
   }

   fn stack(device: Address, event: StackEvent) -> Envelope {
      Envelope::Stack { device, event }
   }

   fn conn(event: ConnectionEvent) -> StackEvent {
      StackEvent::ConnectionState(event)
   }

   fn audio(event: AudioEvent) -> StackEvent {
      StackEvent::AudioState(event)
   }

   #[derive(Debug, Clone, PartialEq)]
   enum NativeCall {
      Connect(Address),
      Disconnect(Address),
      ConnectAudio(Address),
      DisconnectAudio(Address),
      StartVr(Address),
      StopVr(Address),
      SetVolume(VolumeKind, u8, Address),
      ResponseCode(AtResponseCode, Address),
      ResponseString(String, Address),
      Cind(u32, u32, Address),
      Cops(String, Address),
      Clcc(u32, Address),
      BindResponse(u16, bool, Address),
      PhoneState(u32, u32, CallState),
      Codec(CodecId, Address),
      DeviceStatus,
   }

   #[derive(Default)]
   struct MockNative {
      calls: Mutex<Vec<NativeCall>>,
      fail_connect: AtomicBool,
   }

   impl MockNative {
      fn calls(&self) -> Vec<NativeCall> {
         self.calls.lock().clone()
      }

      fn count(&self, wanted: &NativeCall) -> usize {
         self.calls.lock().iter().filter(|c| *c == wanted).count()
      }

      fn push(&self, call: NativeCall) -> bool {
         self.calls.lock().push(call);
         true
      }
   }

   impl NativeControl for MockNative {
      fn connect(&self, device: Address) -> bool {
         self.calls.lock().push(NativeCall::Connect(device));
         !self.fail_connect.load(Ordering::Relaxed)
      }

      fn disconnect(&self, device: Address) -> bool {
         self.push(NativeCall::Disconnect(device))
      }

      fn connect_audio(&self, device: Address) -> bool {
         self.push(NativeCall::ConnectAudio(device))
      }

      fn disconnect_audio(&self, device: Address) -> bool {
         self.push(NativeCall::DisconnectAudio(device))
      }

      fn start_voice_recognition(&self, device: Address) -> bool {
         self.push(NativeCall::StartVr(device))
      }

      fn stop_voice_recognition(&self, device: Address) -> bool {
         self.push(NativeCall::StopVr(device))
      }

      fn set_volume(&self, kind: VolumeKind, volume: u8, device: Address) -> bool {
         self.push(NativeCall::SetVolume(kind, volume, device))
      }

      fn at_response_code(&self, code: AtResponseCode, _error: i32, device: Address) -> bool {
         self.push(NativeCall::ResponseCode(code, device))
      }

      fn at_response_string(&self, response: &str, device: Address) -> bool {
         self.push(NativeCall::ResponseString(response.to_string(), device))
      }

      fn cind_response(
         &self,
         _service: u32,
         num_active: u32,
         num_held: u32,
         _call_state: CallState,
         _signal: u32,
         _roam: u32,
         _battery: u32,
         device: Address,
      ) -> bool {
         self.push(NativeCall::Cind(num_active, num_held, device))
      }

      fn cops_response(&self, operator: &str, device: Address) -> bool {
         self.push(NativeCall::Cops(operator.to_string(), device))
      }

      fn clcc_response(&self, entry: &ClccEntry, device: Address) -> bool {
         self.push(NativeCall::Clcc(entry.index, device))
      }

      fn bind_response(&self, indicator: u16, enabled: bool, device: Address) -> bool {
         self.push(NativeCall::BindResponse(indicator, enabled, device))
      }

      fn phone_state_change(
         &self,
         num_active: u32,
         num_held: u32,
         call_state: CallState,
         _number: &str,
         _kind: u16,
      ) -> bool {
         self.push(NativeCall::PhoneState(num_active, num_held, call_state))
      }

      fn configure_codec(&self, device: Address, codec: CodecId) -> bool {
         self.push(NativeCall::Codec(codec, device))
      }

      fn notify_device_status(&self, _status: crate::hfp::ports::DeviceStatus) -> bool {
         self.push(NativeCall::DeviceStatus)
      }
   }

   #[derive(Default)]
   struct MockTelephony {
      last_dialed: Mutex<Option<SmolStr>>,
      dialed: Mutex<Vec<SmolStr>>,
      subscriber: Mutex<Option<SmolStr>>,
      operator: Mutex<Option<SmolStr>>,
      chld_ok: AtomicBool,
      list_calls: AtomicBool,
      queries: AtomicUsize,
      answers: AtomicUsize,
      hangups: AtomicUsize,
      dtmf: Mutex<Vec<char>>,
   }

   impl Telephony for MockTelephony {
      fn answer_call(&self) -> Result<()> {
         self.answers.fetch_add(1, Ordering::Relaxed);
         Ok(())
      }

      fn hangup_call(&self) -> Result<()> {
         self.hangups.fetch_add(1, Ordering::Relaxed);
         Ok(())
      }

      fn dial(&self, number: &str) -> Result<()> {
         self.dialed.lock().push(number.into());
         *self.last_dialed.lock() = Some(number.into());
         Ok(())
      }

      fn send_dtmf(&self, digit: char) -> Result<()> {
         self.dtmf.lock().push(digit);
         Ok(())
      }

      fn process_chld(&self, _action: u32) -> Result<bool> {
         Ok(self.chld_ok.load(Ordering::Relaxed))
      }

      fn subscriber_number(&self) -> Result<Option<SmolStr>> {
         Ok(self.subscriber.lock().clone())
      }

      fn network_operator(&self) -> Result<Option<SmolStr>> {
         Ok(self.operator.lock().clone())
      }

      fn list_current_calls(&self) -> Result<bool> {
         Ok(self.list_calls.load(Ordering::Relaxed))
      }

      fn query_phone_state(&self) -> Result<()> {
         self.queries.fetch_add(1, Ordering::Relaxed);
         Ok(())
      }

      fn last_dialed_number(&self) -> Option<SmolStr> {
         self.last_dialed.lock().clone()
      }
   }

   #[derive(Default)]
   struct MockAudio {
      params: Mutex<Vec<(String, String)>>,
      sco: AtomicBool,
      volume: AtomicU8,
   }

   impl MockAudio {
      fn last_param(&self, key: &str) -> Option<String> {
         self
            .params
            .lock()
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
      }
   }

   impl AudioRouting for MockAudio {
      fn set_sco_routing(&self, enabled: bool) {
         self.sco.store(enabled, Ordering::Relaxed);
      }

      fn stream_volume(&self) -> u8 {
         self.volume.load(Ordering::Relaxed)
      }

      fn set_stream_volume(&self, volume: u8, _show_ui: bool) {
         self.volume.store(volume, Ordering::Relaxed);
      }

      fn set_parameter(&self, key: &str, value: &str) {
         self.params.lock().push((key.to_string(), value.to_string()));
      }
   }

   struct AllowPolicy {
      allow: AtomicBool,
   }

   impl Default for AllowPolicy {
      fn default() -> Self {
         Self {
            allow: AtomicBool::new(true),
         }
      }
   }

   impl ConnectPolicy for AllowPolicy {
      fn ok_to_connect(&self, _device: Address) -> bool {
         self.allow.load(Ordering::Relaxed)
      }
   }

   #[derive(Default)]
   struct MockBus {
      events: Mutex<Vec<ProfileEvent>>,
   }

   impl MockBus {
      fn connection_broadcasts(&self) -> Vec<(Address, ConnectionState, ConnectionState)> {
         self
            .events
            .lock()
            .iter()
            .filter_map(|event| match event {
               ProfileEvent::ConnectionStateChanged {
                  device,
                  prev,
                  state,
               } => Some((*device, *prev, *state)),
               _ => None,
            })
            .collect()
      }
   }

   impl crate::event::EventBus for MockBus {
      fn emit(&self, event: ProfileEvent) {
         self.events.lock().push(event);
      }
   }

   struct Fixture {
      sm: StateMachine,
      native: Arc<MockNative>,
      telephony: Arc<MockTelephony>,
      audio: Arc<MockAudio>,
      policy: Arc<AllowPolicy>,
      bus: Arc<MockBus>,
      _loopback: mpsc::Receiver<Envelope>,
   }

   impl Fixture {
      /// Re-dispatches envelopes parked on the local queue, the way the
      /// actor loop drains them.
      fn drain(&mut self) {
         while let Some(envelope) = self.sm.pending.pop_front() {
            self.sm.handle(envelope);
         }
      }

      /// Drives a device through connect and SLC completion.
      fn establish(&mut self, device: Address) {
         self.sm.handle(Envelope::Connect(device));
         self.sm.handle(stack(device, conn(ConnectionEvent::Connected)));
         self
            .sm
            .handle(stack(device, conn(ConnectionEvent::SlcConnected)));
         self.drain();
         assert!(self.sm.registry.contains(device));
      }

      fn set_active_call(&mut self) {
         self.sm.handle(Envelope::CallStateChanged {
            update: CallUpdate::new(1, 0, CallState::Idle),
            virtual_call: false,
         });
      }
   }

   fn fixture(max_connections: usize) -> Fixture {
      let native = Arc::new(MockNative::default());
      let telephony = Arc::new(MockTelephony::default());
      let audio = Arc::new(MockAudio::default());
      let policy = Arc::new(AllowPolicy::default());
      let bus = Arc::new(MockBus::default());
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let sm = StateMachine::new(
         MachineConfig {
            max_connections,
            inband_ringing: false,
         },
         Ports {
            native: native.clone(),
            telephony: telephony.clone(),
            audio: audio.clone(),
            policy: policy.clone(),
         },
         bus.clone(),
         loopback_tx,
         Arc::new(Shared::default()),
      );
      Fixture {
         sm,
         native,
         telephony,
         audio,
         policy,
         bus,
         _loopback: loopback_rx,
      }
   }

   #[tokio::test]
   async fn connect_reaches_connected_after_slc() {
      let mut f = fixture(1);
      f.sm.handle(Envelope::Connect(addr(1)));
      assert_eq!(f.sm.state, State::Pending);
      assert_eq!(f.native.count(&NativeCall::Connect(addr(1))), 1);

      f.sm.handle(stack(addr(1), conn(ConnectionEvent::Connected)));
      assert_eq!(f.sm.state, State::Pending);

      f.sm.handle(stack(addr(1), conn(ConnectionEvent::SlcConnected)));
      f.drain();
      assert_eq!(f.sm.state, State::Connected);
      assert_eq!(f.sm.registry.connected(), &[addr(1)]);
      assert!(f.telephony.queries.load(Ordering::Relaxed) >= 1);

      let broadcasts = f.bus.connection_broadcasts();
      assert_eq!(
         broadcasts,
         vec![
            (addr(1), ConnectionState::Disconnected, ConnectionState::Connecting),
            (addr(1), ConnectionState::Connecting, ConnectionState::Connected),
         ]
      );
   }

   #[tokio::test]
   async fn connect_native_failure_reverts_broadcast() {
      let mut f = fixture(1);
      f.native.fail_connect.store(true, Ordering::Relaxed);
      f.sm.handle(Envelope::Connect(addr(1)));
      assert_eq!(f.sm.state, State::Disconnected);
      assert_eq!(
         f.bus.connection_broadcasts(),
         vec![
            (addr(1), ConnectionState::Disconnected, ConnectionState::Connecting),
            (addr(1), ConnectionState::Connecting, ConnectionState::Disconnected),
         ]
      );
   }

   #[tokio::test]
   async fn connect_timeout_synthesizes_single_disconnect() {
      let mut f = fixture(1);
      f.sm.handle(Envelope::Connect(addr(1)));
      assert_eq!(f.sm.state, State::Pending);

      f.sm.handle(Envelope::Timeout {
         kind: TimeoutKind::Connect,
         device: addr(1),
      });
      assert_eq!(f.sm.state, State::Disconnected);
      assert_eq!(f.sm.registry.target, None);
      assert_eq!(
         f.bus.connection_broadcasts(),
         vec![
            (addr(1), ConnectionState::Disconnected, ConnectionState::Connecting),
            (addr(1), ConnectionState::Connecting, ConnectionState::Disconnected),
         ]
      );
   }

   #[tokio::test]
   async fn connect_is_idempotent_once_connected() {
      let mut f = fixture(1);
      f.establish(addr(1));
      let connects = f.native.count(&NativeCall::Connect(addr(1)));
      let broadcasts = f.bus.connection_broadcasts().len();

      f.sm.handle(Envelope::Connect(addr(1)));
      assert_eq!(f.sm.state, State::Connected);
      assert_eq!(f.native.count(&NativeCall::Connect(addr(1))), connects);
      assert_eq!(f.bus.connection_broadcasts().len(), broadcasts);
      assert!(f.sm.timers.device_for(TimeoutKind::Connect).is_none());
   }

   #[tokio::test]
   async fn incoming_connection_rejected_by_policy() {
      let mut f = fixture(1);
      f.policy.allow.store(false, Ordering::Relaxed);
      f.sm.handle(stack(addr(1), conn(ConnectionEvent::Connecting)));
      assert_eq!(f.sm.state, State::Disconnected);
      assert_eq!(f.native.count(&NativeCall::Disconnect(addr(1))), 1);
   }

   #[tokio::test]
   async fn eviction_replaces_device_when_at_capacity() {
      let mut f = fixture(1);
      f.establish(addr(1));

      f.sm.handle(Envelope::Connect(addr(2)));
      assert_eq!(f.sm.state, State::Pending);
      assert_eq!(f.native.count(&NativeCall::Disconnect(addr(1))), 1);
      assert_eq!(f.sm.registry.target, Some(addr(2)));

      f.sm.handle(stack(addr(1), conn(ConnectionEvent::Disconnected)));
      assert_eq!(f.native.count(&NativeCall::Connect(addr(2))), 1);
      assert_eq!(f.sm.state, State::Pending);

      f.sm.handle(stack(addr(2), conn(ConnectionEvent::SlcConnected)));
      f.drain();
      assert_eq!(f.sm.state, State::Connected);
      assert_eq!(f.sm.registry.connected(), &[addr(2)]);
   }

   #[tokio::test]
   async fn audio_rejected_without_call_or_recognition() {
      let mut f = fixture(1);
      f.establish(addr(1));
      f.sm.handle(Envelope::ConnectAudio(addr(1)));
      assert_eq!(f.native.count(&NativeCall::ConnectAudio(addr(1))), 0);
      assert_eq!(f.sm.state, State::Connected);
   }

   #[tokio::test]
   async fn audio_handover_between_two_devices() {
      let mut f = fixture(2);
      f.establish(addr(1));

      f.sm.handle(Envelope::Connect(addr(2)));
      assert_eq!(f.sm.state, State::MultiPending);
      f.sm.handle(stack(addr(2), conn(ConnectionEvent::SlcConnected)));
      f.drain();
      assert_eq!(f.sm.state, State::Connected);
      assert_eq!(f.sm.registry.connected(), &[addr(1), addr(2)]);

      f.set_active_call();
      f.sm.handle(Envelope::ConnectAudio(addr(1)));
      assert_eq!(f.native.count(&NativeCall::ConnectAudio(addr(1))), 1);

      f.sm.handle(stack(addr(1), audio(AudioEvent::Connected)));
      assert_eq!(f.sm.state, State::AudioOn);
      assert_eq!(f.sm.registry.active_audio, Some(addr(1)));
      assert_eq!(f.sm.audio_state, AudioState::Connected);
      assert!(f.audio.sco.load(Ordering::Relaxed));

      // second device wants the link: tear down first, then re-issue
      f.sm.handle(Envelope::ConnectAudio(addr(2)));
      assert_eq!(f.native.count(&NativeCall::DisconnectAudio(addr(1))), 1);
      assert_eq!(f.sm.registry.active_audio, Some(addr(1)));

      f.sm.handle(stack(addr(1), audio(AudioEvent::Disconnected)));
      assert_eq!(f.sm.state, State::Connected);
      f.drain();
      assert_eq!(f.native.count(&NativeCall::ConnectAudio(addr(2))), 1);

      f.sm.handle(stack(addr(2), audio(AudioEvent::Connected)));
      assert_eq!(f.sm.state, State::AudioOn);
      assert_eq!(f.sm.registry.active_audio, Some(addr(2)));
      assert!(f.sm.registry.connected().contains(&addr(1)));
   }

   #[tokio::test]
   async fn eviction_skips_audio_owner() {
      let mut f = fixture(2);
      f.establish(addr(1));
      f.sm.handle(Envelope::Connect(addr(2)));
      f.sm.handle(stack(addr(2), conn(ConnectionEvent::SlcConnected)));
      f.drain();

      f.set_active_call();
      f.sm.handle(Envelope::ConnectAudio(addr(1)));
      f.sm.handle(stack(addr(1), audio(AudioEvent::Connected)));
      assert_eq!(f.sm.state, State::AudioOn);

      f.sm.handle(Envelope::Connect(addr(3)));
      assert_eq!(f.sm.state, State::MultiPending);
      assert_eq!(f.sm.registry.multi_disconnect, Some(addr(2)));
      assert_eq!(f.native.count(&NativeCall::Disconnect(addr(2))), 1);

      f.sm.handle(stack(addr(2), conn(ConnectionEvent::Disconnected)));
      assert_eq!(f.native.count(&NativeCall::Connect(addr(3))), 1);
      f.sm.handle(stack(addr(3), conn(ConnectionEvent::SlcConnected)));
      f.drain();
      assert_eq!(f.sm.state, State::AudioOn);
      assert_eq!(f.sm.registry.connected(), &[addr(1), addr(3)]);
      assert_eq!(f.sm.registry.active_audio, Some(addr(1)));
   }

   #[tokio::test]
   async fn dial_with_empty_number_and_no_history_errors() {
      let mut f = fixture(1);
      f.establish(addr(1));
      f.sm
         .handle(stack(addr(1), StackEvent::DialCall("".into())));
      assert!(f.telephony.dialed.lock().is_empty());
      assert_eq!(
         f.native
            .count(&NativeCall::ResponseCode(AtResponseCode::Error, addr(1))),
         1
      );
   }

   #[tokio::test]
   async fn dial_strips_semicolon_and_confirms_on_dialing_state() {
      let mut f = fixture(1);
      f.establish(addr(1));
      f.sm
         .handle(stack(addr(1), StackEvent::DialCall("5551234;".into())));
      assert_eq!(f.telephony.dialed.lock().as_slice(), &["5551234"]);
      assert!(f.sm.dialing_out);

      f.sm.handle(Envelope::CallStateChanged {
         update: CallUpdate::new(0, 0, CallState::Dialing),
         virtual_call: false,
      });
      assert!(!f.sm.dialing_out);
      assert_eq!(
         f.native
            .count(&NativeCall::ResponseCode(AtResponseCode::Ok, addr(1))),
         1
      );
   }

   #[tokio::test]
   async fn memory_dial_conformance_slot_errors() {
      let mut f = fixture(1);
      f.establish(addr(1));
      f.telephony.dial("5550000").unwrap();
      f.sm
         .handle(stack(addr(1), StackEvent::DialCall(">9999001".into())));
      assert_eq!(f.telephony.dialed.lock().len(), 1);
      assert_eq!(
         f.native
            .count(&NativeCall::ResponseCode(AtResponseCode::Error, addr(1))),
         1
      );

      // a normal memory-dial slot resolves to the last dialed number
      f.sm
         .handle(stack(addr(1), StackEvent::DialCall(">2".into())));
      assert_eq!(f.telephony.dialed.lock().last().unwrap(), "5550000");
   }

   #[tokio::test]
   async fn virtual_call_synthesizes_and_yields_to_real_call() {
      let mut f = fixture(1);
      f.establish(addr(1));
      f.sm.handle(Envelope::VirtualCallStart(addr(1)));

      assert!(f.sm.virtual_call);
      assert_eq!(f.audio.last_param(A2DP_SUSPENDED).as_deref(), Some("true"));
      let phases: Vec<_> = f
         .native
         .calls()
         .into_iter()
         .filter_map(|c| match c {
            NativeCall::PhoneState(active, held, state) => Some((active, held, state)),
            _ => None,
         })
         .collect();
      assert_eq!(
         phases,
         vec![
            (0, 0, CallState::Dialing),
            (0, 0, CallState::Alerting),
            (1, 0, CallState::Idle),
         ]
      );

      // CIND must answer with one active call for the virtual overlay
      f.sm.handle(stack(addr(1), StackEvent::AtCind));
      assert_eq!(f.native.count(&NativeCall::Cind(1, 0, addr(1))), 1);

      // a real call update preempts the overlay
      f.sm.handle(Envelope::CallStateChanged {
         update: CallUpdate::new(1, 0, CallState::Idle),
         virtual_call: false,
      });
      assert!(!f.sm.virtual_call);
      assert_eq!(f.sm.phone.num_active, 1);
   }

   #[tokio::test]
   async fn clcc_timeout_sends_empty_terminator() {
      let mut f = fixture(1);
      f.establish(addr(1));
      f.telephony.list_calls.store(true, Ordering::Relaxed);
      f.sm.handle(stack(addr(1), StackEvent::AtClcc));
      assert!(f.sm.timers.device_for(TimeoutKind::ClccResponse).is_some());

      f.sm.handle(Envelope::Timeout {
         kind: TimeoutKind::ClccResponse,
         device: addr(1),
      });
      assert_eq!(f.native.count(&NativeCall::Clcc(0, addr(1))), 1);
   }

   #[tokio::test]
   async fn clcc_responses_are_relayed_until_terminator() {
      let mut f = fixture(1);
      f.establish(addr(1));
      f.telephony.list_calls.store(true, Ordering::Relaxed);
      f.sm.handle(stack(addr(1), StackEvent::AtClcc));

      f.sm.handle(Envelope::SendClccResponse(ClccEntry {
         index: 1,
         direction: 0,
         status: 0,
         mode: 0,
         multiparty: false,
         number: "5551234".into(),
         kind: 129,
      }));
      f.sm.handle(Envelope::SendClccResponse(ClccEntry::terminator()));
      assert_eq!(f.native.count(&NativeCall::Clcc(1, addr(1))), 1);
      assert_eq!(f.native.count(&NativeCall::Clcc(0, addr(1))), 1);
      assert!(f.sm.timers.device_for(TimeoutKind::ClccResponse).is_none());
   }

   #[tokio::test]
   async fn remote_voice_recognition_request_times_out() {
      let mut f = fixture(1);
      f.establish(addr(1));
      f.sm
         .handle(stack(addr(1), StackEvent::VoiceRecognition(VrState::Started)));
      assert!(f.sm.vr.awaiting_start);
      assert!(f
         .bus
         .events
         .lock()
         .iter()
         .any(|e| matches!(e, ProfileEvent::VoiceRecognitionRequested { .. })));

      f.sm.handle(Envelope::Timeout {
         kind: TimeoutKind::VoiceRecognitionStart,
         device: addr(1),
      });
      assert!(!f.sm.vr.awaiting_start);
      assert_eq!(
         f.native
            .count(&NativeCall::ResponseCode(AtResponseCode::Error, addr(1))),
         1
      );
   }

   #[tokio::test]
   async fn deferred_connects_are_dropped_on_connected_entry() {
      let mut f = fixture(2);
      f.sm.handle(Envelope::Connect(addr(1)));
      f.sm.handle(Envelope::Connect(addr(2)));
      assert_eq!(f.sm.deferred.len(), 1);

      f.sm.handle(stack(addr(1), conn(ConnectionEvent::SlcConnected)));
      f.drain();
      assert_eq!(f.sm.state, State::Connected);
      assert_eq!(f.native.count(&NativeCall::Connect(addr(2))), 0);
      assert!(f.sm.deferred.is_empty());
   }

   #[tokio::test]
   async fn audio_on_connect_swaps_single_slot_device() {
      let mut f = fixture(1);
      f.establish(addr(1));
      f.set_active_call();
      f.sm.handle(Envelope::ConnectAudio(addr(1)));
      f.sm.handle(stack(addr(1), audio(AudioEvent::Connected)));
      assert_eq!(f.sm.state, State::AudioOn);

      f.sm.handle(Envelope::Connect(addr(2)));
      assert_eq!(f.native.count(&NativeCall::DisconnectAudio(addr(1))), 1);
      assert_eq!(f.sm.deferred.len(), 2);

      f.sm.handle(stack(addr(1), audio(AudioEvent::Disconnected)));
      f.drain();
      // old device disconnect was issued and the new connect deferred
      assert_eq!(f.native.count(&NativeCall::Disconnect(addr(1))), 1);
      assert_eq!(f.sm.state, State::Pending);

      f.sm.handle(stack(addr(1), conn(ConnectionEvent::Disconnected)));
      f.drain();
      assert_eq!(f.native.count(&NativeCall::Connect(addr(2))), 1);
      assert_eq!(f.sm.state, State::Pending);

      f.sm.handle(stack(addr(2), conn(ConnectionEvent::SlcConnected)));
      f.drain();
      assert_eq!(f.sm.state, State::Connected);
      assert_eq!(f.sm.registry.connected(), &[addr(2)]);
   }

   #[tokio::test]
   async fn volume_event_updates_stream_volume() {
      let mut f = fixture(1);
      f.establish(addr(1));
      f.sm.handle(stack(
         addr(1),
         StackEvent::VolumeChanged {
            kind: VolumeKind::Speaker,
            volume: 9,
         },
      ));
      assert_eq!(f.audio.volume.load(Ordering::Relaxed), 9);
      assert_eq!(f.sm.phone.speaker_volume, 9);
   }

   #[tokio::test]
   async fn xapl_vendor_command_is_answered_and_broadcast() {
      let mut f = fixture(1);
      f.establish(addr(1));
      f.sm.handle(stack(
         addr(1),
         StackEvent::UnknownAt("+xapl=ABCD-1111-0100,2".into()),
      ));
      assert_eq!(
         f.native.count(&NativeCall::ResponseString(
            "+XAPL=iPhone,2".to_string(),
            addr(1)
         )),
         1
      );
      assert_eq!(
         f.native
            .count(&NativeCall::ResponseCode(AtResponseCode::Ok, addr(1))),
         1
      );
      assert!(f.bus.events.lock().iter().any(|e| matches!(
         e,
         ProfileEvent::VendorCommand {
            company_id: at::COMPANY_ID_APPLE,
            ..
         }
      )));
   }

   #[tokio::test]
   async fn phonebook_commands_are_rejected() {
      let mut f = fixture(1);
      f.establish(addr(1));
      f.sm
         .handle(stack(addr(1), StackEvent::UnknownAt("+CPBR=1,10".into())));
      assert_eq!(
         f.native
            .count(&NativeCall::ResponseCode(AtResponseCode::Error, addr(1))),
         1
      );
   }

   #[tokio::test]
   async fn bind_list_emits_indicator_events() {
      let mut f = fixture(1);
      f.establish(addr(1));
      f.sm
         .handle(stack(addr(1), StackEvent::AtBind("1,5,2".into())));
      let indicators: Vec<_> = f
         .bus
         .events
         .lock()
         .iter()
         .filter_map(|e| match e {
            ProfileEvent::IndicatorChanged {
               indicator, value, ..
            } => Some((*indicator, *value)),
            _ => None,
         })
         .collect();
      assert_eq!(indicators, vec![(1, -1), (2, -1)]);
   }

   #[tokio::test]
   async fn chld_routes_to_telephony_and_answers() {
      let mut f = fixture(1);
      f.establish(addr(1));
      f.telephony.chld_ok.store(true, Ordering::Relaxed);
      f.sm.handle(stack(addr(1), StackEvent::AtChld(2)));
      assert_eq!(
         f.native
            .count(&NativeCall::ResponseCode(AtResponseCode::Ok, addr(1))),
         1
      );
   }

   #[tokio::test]
   async fn snapshot_reports_connecting_roles() {
      let mut f = fixture(2);
      f.sm.handle(Envelope::Connect(addr(1)));
      let snapshot = f.sm.shared.snapshot();
      assert_eq!(
         snapshot.connection_state(addr(1)),
         ConnectionState::Connecting
      );
      assert_eq!(
         snapshot.connection_state(addr(2)),
         ConnectionState::Disconnected
      );

      f.sm.handle(stack(addr(1), conn(ConnectionEvent::SlcConnected)));
      f.drain();
      let snapshot = f.sm.shared.snapshot();
      assert_eq!(
         snapshot.connection_state(addr(1)),
         ConnectionState::Connected
      );
      assert!(!f.sm.shared.is_audio_connected(addr(1)));
   }

   #[tokio::test]
   async fn key_press_follows_call_state() {
      let mut f = fixture(1);
      f.establish(addr(1));
      f.sm.handle(Envelope::CallStateChanged {
         update: CallUpdate::new(0, 0, CallState::Incoming),
         virtual_call: false,
      });
      f.sm.handle(stack(addr(1), StackEvent::KeyPressed));
      assert_eq!(f.telephony.answers.load(Ordering::Relaxed), 1);

      f.sm.handle(Envelope::CallStateChanged {
         update: CallUpdate::new(1, 0, CallState::Idle),
         virtual_call: false,
      });
      f.sm.handle(stack(addr(1), StackEvent::KeyPressed));
      // no audio link yet: the press raises audio instead of hanging up
      assert_eq!(f.native.count(&NativeCall::ConnectAudio(addr(1))), 1);

      f.sm.handle(stack(addr(1), audio(AudioEvent::Connected)));
      assert_eq!(f.sm.state, State::AudioOn);
      f.sm.handle(stack(addr(1), StackEvent::KeyPressed));
      assert_eq!(f.telephony.hangups.load(Ordering::Relaxed), 1);
   }

   #[tokio::test]
   async fn dtmf_is_forwarded_to_telephony() {
      let mut f = fixture(1);
      f.establish(addr(1));
      f.sm.handle(stack(addr(1), StackEvent::SendDtmf('5')));
      assert_eq!(f.telephony.dtmf.lock().as_slice(), &['5']);
   }

   #[tokio::test]
   async fn subscriber_number_is_formatted_with_toa() {
      let mut f = fixture(1);
      f.establish(addr(1));
      *f.telephony.subscriber.lock() = Some("+15550001".into());
      f.sm
         .handle(stack(addr(1), StackEvent::SubscriberNumberRequest));
      assert_eq!(
         f.native.count(&NativeCall::ResponseString(
            "+CNUM: ,\"+15550001\",145,,4".to_string(),
            addr(1)
         )),
         1
      );
      assert_eq!(
         f.native
            .count(&NativeCall::ResponseCode(AtResponseCode::Ok, addr(1))),
         1
      );
   }
}
