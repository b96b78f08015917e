//! Configuration management for the Hands-Free service.
//!
//! This module handles loading and saving configuration from disk,
//! including the connection cap, in-band ringing policy and the list of
//! devices allowed to connect.

use std::{env, fs, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{HfpError, Result};

/// Main configuration structure for the service.
#[derive(Serialize, Deserialize, Clone)]
pub struct Config {
   #[serde(default)]
   pub known_devices: Vec<KnownDevice>,

   /// Maximum simultaneously connected headsets (1 or 2).
   #[serde(default = "default_max_connections")]
   pub max_connections: usize,

   /// Whether SCO may open for an unanswered incoming call.
   #[serde(default)]
   pub inband_ringing: bool,

   /// Accept connections from devices not in `known_devices`.
   #[serde(default = "default_accept_unknown")]
   pub accept_unknown_devices: bool,

   /// RFCOMM server channel for the control connection.
   #[serde(default = "default_rfcomm_channel")]
   pub rfcomm_channel: u8,
}

/// A headset allowed to connect regardless of `accept_unknown_devices`.
#[derive(Serialize, Deserialize, Clone)]
pub struct KnownDevice {
   pub address: String,
   pub name: String,
}

const fn default_max_connections() -> usize {
   1
}

const fn default_accept_unknown() -> bool {
   true
}

const fn default_rfcomm_channel() -> u8 {
   3
}

impl Default for Config {
   fn default() -> Self {
      Self {
         known_devices: vec![],
         max_connections: default_max_connections(),
         inband_ringing: false,
         accept_unknown_devices: default_accept_unknown(),
         rfcomm_channel: default_rfcomm_channel(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         Self::load_from(&config_path)
      } else {
         // Create default config
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   /// Loads configuration from an explicit path.
   pub fn load_from(path: &std::path::Path) -> Result<Self> {
      let contents = fs::read_to_string(path)?;
      let mut config: Self = toml::from_str(&contents)?;
      config.max_connections = config.max_connections.clamp(1, 2);
      Ok(config)
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      // Ensure directory exists
      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("HANDSFREED_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(HfpError::ConfigDirNotFound);
      };

      Ok(config_dir.join("handsfreed").join("config.toml"))
   }

   /// Checks if the given address is a known device and returns its name.
   pub fn is_known_device(&self, address: &str) -> Option<&str> {
      self
         .known_devices
         .iter()
         .find(|d| d.address == address)
         .map(|d| d.name.as_str())
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn defaults_are_sane() {
      let config = Config::default();
      assert_eq!(config.max_connections, 1);
      assert!(!config.inband_ringing);
      assert!(config.accept_unknown_devices);
   }

   #[test]
   fn round_trip_through_toml_file() {
      let dir = tempfile::tempdir().expect("tempdir");
      let path = dir.path().join("config.toml");

      let mut config = Config::default();
      config.max_connections = 2;
      config.known_devices.push(KnownDevice {
         address: "11:22:33:44:55:66".into(),
         name: "Carkit".into(),
      });
      fs::write(&path, toml::to_string_pretty(&config).unwrap()).unwrap();

      let loaded = Config::load_from(&path).expect("load");
      assert_eq!(loaded.max_connections, 2);
      assert_eq!(
         loaded.is_known_device("11:22:33:44:55:66"),
         Some("Carkit")
      );
      assert_eq!(loaded.is_known_device("aa:bb:cc:dd:ee:ff"), None);
   }

   #[test]
   fn out_of_range_connection_cap_is_clamped() {
      let dir = tempfile::tempdir().expect("tempdir");
      let path = dir.path().join("config.toml");
      fs::write(&path, "max_connections = 7\n").unwrap();

      let loaded = Config::load_from(&path).expect("load");
      assert_eq!(loaded.max_connections, 2);
   }
}
