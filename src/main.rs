//! Hands-Free Profile audio-gateway daemon.
//!
//! Wires the connection state machine to its collaborators: the RFCOMM
//! control-channel transport, the system audio router, a D-Bus command
//! and signal surface, and a telephony bridge that forwards call
//! control to whatever dialer service is listening on the bus.

use std::{
   sync::{
      Arc,
      atomic::{AtomicBool, AtomicU8, Ordering},
   },
   time::Duration,
};

use bluer::Address;
use crossbeam::queue::SegQueue;
use log::{debug, error, info, warn};
use smol_str::SmolStr;
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use handsfreed::{
   config::Config,
   dbus::{HandsfreeService, HandsfreeServiceSignals},
   error::Result,
   event::{EventBus, ProfileEvent, TelephonyAction},
   hfp::{
      machine::{Handsfree, MachineConfig, Ports},
      ports::{AudioRouting, ConnectPolicy, Telephony},
   },
   rfcomm::RfcommTransport,
};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting handsfreed...");

   // Load configuration
   let config = Config::load()?;
   info!(
      "Loaded configuration: max_connections={}, inband_ringing={}, channel={}",
      config.max_connections, config.inband_ringing, config.rfcomm_channel
   );

   // Event fan-out towards D-Bus signals
   let event_bus = EventProcessor::new();

   // Collaborator adapters
   let transport = RfcommTransport::new(config.rfcomm_channel, config.inband_ringing);
   let telephony = Arc::new(BusTelephony::new(event_bus.clone()));
   let audio = Arc::new(SystemAudio::default());
   let policy = Arc::new(ConfigPolicy {
      config: config.clone(),
   });

   // The state machine actor
   let handsfree = Handsfree::spawn(
      MachineConfig::from(&config),
      Ports {
         native: Arc::new(transport.clone()),
         telephony,
         audio,
         policy,
      },
      event_bus.clone(),
   );
   transport.attach(handsfree.sender());

   // D-Bus surface
   let service = HandsfreeService::new(handsfree);
   let dbus = connection::Builder::session()?
      .name("org.handsfreed")?
      .serve_at("/org/handsfreed/manager", service)?
      .build()
      .await?;

   info!("handsfreed D-Bus service started at org.handsfreed");

   event_bus.spawn_dispatcher(dbus).await?;

   // RFCOMM accept loop
   let acceptor = transport.clone();
   tokio::spawn(async move {
      if let Err(err) = acceptor.run().await {
         error!("RFCOMM transport failed: {err}");
      }
   });

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down handsfreed...");

   Ok(())
}

// === Event fan-out ===

struct EventProcessor {
   queue: SegQueue<ProfileEvent>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }

   async fn recv(self: &Arc<Self>) -> Option<ProfileEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(
      &self,
      iface: &InterfaceRef<HandsfreeService>,
      event: ProfileEvent,
   ) -> Result<()> {
      match event {
         ProfileEvent::ConnectionStateChanged {
            device,
            prev,
            state,
         } => {
            iface
               .connection_state_changed(
                  &device.to_string(),
                  &prev.to_string(),
                  &state.to_string(),
               )
               .await?;
         },
         ProfileEvent::AudioStateChanged {
            device,
            prev,
            state,
         } => {
            iface
               .audio_state_changed(&device.to_string(), &prev.to_string(), &state.to_string())
               .await?;
         },
         ProfileEvent::VendorCommand {
            device,
            command,
            company_id,
            args,
         } => {
            let args = args
               .iter()
               .map(ToString::to_string)
               .collect::<Vec<_>>()
               .join(",");
            iface
               .vendor_event(&device.to_string(), &command, company_id, &args)
               .await?;
         },
         ProfileEvent::IndicatorChanged {
            device,
            indicator,
            value,
         } => {
            iface
               .indicator_changed(&device.to_string(), indicator, value)
               .await?;
         },
         ProfileEvent::VoiceRecognitionRequested { device } => {
            iface
               .voice_recognition_requested(&device.to_string())
               .await?;
         },
         ProfileEvent::TelephonyRequest(action) => {
            let (name, argument) = match action {
               TelephonyAction::Answer => ("answer", String::new()),
               TelephonyAction::Hangup => ("hangup", String::new()),
               TelephonyAction::Dial(number) => ("dial", number.to_string()),
               TelephonyAction::Dtmf(digit) => ("dtmf", digit.to_string()),
               TelephonyAction::CallHold(action) => ("call_hold", action.to_string()),
               TelephonyAction::QueryPhoneState => ("query_phone_state", String::new()),
               TelephonyAction::ListCurrentCalls => ("list_current_calls", String::new()),
            };
            iface.telephony_action(name, &argument).await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, HandsfreeService>("/org/handsfreed/manager")
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: ProfileEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}

// === Telephony bridge ===

/// Forwards call control to the dialer listening on the bus; the
/// resulting call state comes back through `PhoneStateChanged` and
/// `ClccResponse`. Getters answer empty, which the machine maps to
/// protocol errors, and slow listings are bounded by its timers.
struct BusTelephony {
   events: Arc<EventProcessor>,
   last_dialed: parking_lot::Mutex<Option<SmolStr>>,
}

impl BusTelephony {
   fn new(events: Arc<EventProcessor>) -> Self {
      Self {
         events,
         last_dialed: parking_lot::Mutex::new(None),
      }
   }

   fn request(&self, action: TelephonyAction) {
      self.events.emit(ProfileEvent::TelephonyRequest(action));
   }
}

impl Telephony for BusTelephony {
   fn answer_call(&self) -> Result<()> {
      self.request(TelephonyAction::Answer);
      Ok(())
   }

   fn hangup_call(&self) -> Result<()> {
      self.request(TelephonyAction::Hangup);
      Ok(())
   }

   fn dial(&self, number: &str) -> Result<()> {
      *self.last_dialed.lock() = Some(number.into());
      self.request(TelephonyAction::Dial(number.into()));
      Ok(())
   }

   fn send_dtmf(&self, digit: char) -> Result<()> {
      self.request(TelephonyAction::Dtmf(digit));
      Ok(())
   }

   fn process_chld(&self, action: u32) -> Result<bool> {
      self.request(TelephonyAction::CallHold(action));
      Ok(true)
   }

   fn subscriber_number(&self) -> Result<Option<SmolStr>> {
      Ok(None)
   }

   fn network_operator(&self) -> Result<Option<SmolStr>> {
      Ok(None)
   }

   fn list_current_calls(&self) -> Result<bool> {
      self.request(TelephonyAction::ListCurrentCalls);
      Ok(true)
   }

   fn query_phone_state(&self) -> Result<()> {
      self.request(TelephonyAction::QueryPhoneState);
      Ok(())
   }

   fn last_dialed_number(&self) -> Option<SmolStr> {
      self.last_dialed.lock().clone()
   }
}

// === Audio routing ===

/// Tracks SCO routing and stream volume; parameter strings go to the
/// log until a platform mixer is wired in.
#[derive(Default)]
struct SystemAudio {
   volume: AtomicU8,
   sco: AtomicBool,
}

impl AudioRouting for SystemAudio {
   fn set_sco_routing(&self, enabled: bool) {
      self.sco.store(enabled, Ordering::Relaxed);
      info!("SCO routing {}", if enabled { "enabled" } else { "disabled" });
   }

   fn stream_volume(&self) -> u8 {
      self.volume.load(Ordering::Relaxed)
   }

   fn set_stream_volume(&self, volume: u8, show_ui: bool) {
      self.volume.store(volume, Ordering::Relaxed);
      debug!("stream volume set to {volume} (show_ui={show_ui})");
   }

   fn set_parameter(&self, key: &str, value: &str) {
      debug!("audio parameter {key}={value}");
   }
}

// === Connection policy ===

/// Admission policy backed by the configuration file.
struct ConfigPolicy {
   config: Config,
}

impl ConnectPolicy for ConfigPolicy {
   fn ok_to_connect(&self, device: Address) -> bool {
      self.config.accept_unknown_devices
         || self.config.is_known_device(&device.to_string()).is_some()
   }
}
