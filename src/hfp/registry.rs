//! Device role bookkeeping for the profile instance.
//!
//! Tracks the bounded connected list plus the transient roles a device
//! can hold: outbound target, inbound peer, active audio owner and the
//! device being evicted to make room. Pure bookkeeping, no I/O.

use bluer::Address;

#[derive(Debug)]
pub struct DeviceRegistry {
   max_connections: usize,
   connected: Vec<Address>,
   /// Device most recently confirmed over SLC.
   pub current: Option<Address>,
   /// Outbound connection in flight, locally initiated.
   pub target: Option<Address>,
   /// Inbound connection in flight, peer initiated.
   pub incoming: Option<Address>,
   /// Owner of the single SCO resource; always a connected device.
   pub active_audio: Option<Address>,
   /// Device being disconnected to make room for a new connection.
   pub multi_disconnect: Option<Address>,
}

impl DeviceRegistry {
   pub fn new(max_connections: usize) -> Self {
      debug_assert!((1..=2).contains(&max_connections));
      Self {
         max_connections,
         connected: Vec::with_capacity(max_connections),
         current: None,
         target: None,
         incoming: None,
         active_audio: None,
         multi_disconnect: None,
      }
   }

   pub fn max_connections(&self) -> usize {
      self.max_connections
   }

   pub fn connected(&self) -> &[Address] {
      &self.connected
   }

   pub fn contains(&self, device: Address) -> bool {
      self.connected.contains(&device)
   }

   pub fn is_empty(&self) -> bool {
      self.connected.is_empty()
   }

   pub fn is_full(&self) -> bool {
      self.connected.len() >= self.max_connections
   }

   /// Records a device as fully connected. Returns `false` when it was
   /// already tracked.
   pub fn add_connected(&mut self, device: Address) -> bool {
      if self.contains(device) {
         return false;
      }
      self.connected.push(device);
      self.current = Some(device);
      true
   }

   /// Removes a device from the connected list and every role it holds.
   /// Returns `false` when it was not tracked.
   pub fn remove_connected(&mut self, device: Address) -> bool {
      let Some(pos) = self.connected.iter().position(|&d| d == device) else {
         return false;
      };
      self.connected.remove(pos);
      if self.active_audio == Some(device) {
         self.active_audio = None;
      }
      if self.multi_disconnect == Some(device) {
         self.multi_disconnect = None;
      }
      true
   }

   /// The device to evict when at capacity: the oldest connection,
   /// skipping the one holding the audio resource.
   pub fn eviction_candidate(&self) -> Option<Address> {
      self
         .connected
         .iter()
         .copied()
         .find(|&d| self.active_audio != Some(d))
   }

   /// Reassigns `current` to the most recent connection.
   pub fn promote_latest(&mut self) {
      self.current = self.connected.last().copied();
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn addr(last: u8) -> Address {
      Address::new([0x00, 0x11, 0x22, 0x33, 0x44, last])
   }

   #[test]
   fn add_is_idempotent_and_bounded() {
      let mut reg = DeviceRegistry::new(2);
      assert!(reg.add_connected(addr(1)));
      assert!(!reg.add_connected(addr(1)));
      assert!(reg.add_connected(addr(2)));
      assert!(reg.is_full());
      assert_eq!(reg.current, Some(addr(2)));
      assert_eq!(reg.connected(), &[addr(1), addr(2)]);
   }

   #[test]
   fn remove_clears_dependent_roles() {
      let mut reg = DeviceRegistry::new(2);
      reg.add_connected(addr(1));
      reg.add_connected(addr(2));
      reg.active_audio = Some(addr(1));
      reg.multi_disconnect = Some(addr(1));

      assert!(reg.remove_connected(addr(1)));
      assert_eq!(reg.active_audio, None);
      assert_eq!(reg.multi_disconnect, None);
      assert!(!reg.remove_connected(addr(1)));
      assert_eq!(reg.connected(), &[addr(2)]);
   }

   #[test]
   fn eviction_skips_audio_owner() {
      let mut reg = DeviceRegistry::new(2);
      reg.add_connected(addr(1));
      reg.add_connected(addr(2));
      assert_eq!(reg.eviction_candidate(), Some(addr(1)));

      reg.active_audio = Some(addr(1));
      assert_eq!(reg.eviction_candidate(), Some(addr(2)));
   }

   #[test]
   fn eviction_with_single_audio_owner_yields_none() {
      let mut reg = DeviceRegistry::new(1);
      reg.add_connected(addr(1));
      reg.active_audio = Some(addr(1));
      assert_eq!(reg.eviction_candidate(), None);
   }

   #[test]
   fn promote_latest_follows_list_tail() {
      let mut reg = DeviceRegistry::new(2);
      reg.add_connected(addr(1));
      reg.add_connected(addr(2));
      reg.remove_connected(addr(2));
      reg.promote_latest();
      assert_eq!(reg.current, Some(addr(1)));
   }
}
