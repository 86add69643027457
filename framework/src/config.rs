//! Persisted device configuration (`config.json`).
//!
//! One JSON file holds everything a node needs to take its role on the
//! track. Unknown fields are ignored on load, missing fields fall back to
//! defaults, and a validation pass rejects configurations that would fight
//! the hardware (flash pins, duplicate pins). A node that fails to load a
//! valid configuration enters setup mode — outside the core's scope.

use log::warn;
use serde::{Deserialize, Serialize};

use crate::peers::parse_mac;
use crate::role::Role;

pub const FIRMWARE_MAJOR: u8 = 2;
pub const FIRMWARE_MINOR: u8 = 3;
pub const CONFIG_VERSION: u32 = 1;

/// Pins unsafe for general use on the gate hardware: the boot strap pin and
/// the flash SPI block.
const GPIO_BLACKLIST: [u8; 7] = [0, 6, 7, 8, 9, 10, 11];
const GPIO_MAX: u8 = 48;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    pub configured: bool,
    pub version: u32,

    // Network
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub hostname: String,

    // Device
    pub role: Role,
    pub device_id: u8,

    // Pins
    pub sensor_pin: u8,
    /// Second sensor: trap exit beam, or the reflectance arm pad on a
    /// start gate. 0 = not fitted.
    pub sensor_pin_2: u8,
    pub led_pin: u8,

    /// Manually configured peer MAC from old firmware; adopted as a paired
    /// row at boot. Empty = none.
    pub peer_mac: String,

    // Track
    pub track_length_m: f64,
    pub scale_factor: i32,
    /// Speed-trap beam spacing.
    pub sensor_spacing_m: f64,

    // LiDAR staging sensor
    pub lidar_enabled: bool,
    pub lidar_rx_pin: u8,
    pub lidar_tx_pin: u8,
    pub lidar_threshold_mm: u16,

    // Audio cue module
    pub audio_enabled: bool,
    pub audio_tx_pin: u8,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            configured: false,
            version: CONFIG_VERSION,
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            hostname: "chronogate".into(),
            role: Role::Finish,
            device_id: 1,
            sensor_pin: 4,
            sensor_pin_2: 0,
            led_pin: 2,
            peer_mac: String::new(),
            track_length_m: 2.0,
            scale_factor: 64,
            sensor_spacing_m: 0.10,
            lidar_enabled: false,
            lidar_rx_pin: 16,
            lidar_tx_pin: 17,
            lidar_threshold_mm: 300,
            audio_enabled: false,
            audio_tx_pin: 21,
        }
    }
}

/// What is wrong with a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Parse(String),
    InvalidValue(&'static str),
}

pub fn is_valid_gpio(pin: u8) -> bool {
    pin <= GPIO_MAX && !GPIO_BLACKLIST.contains(&pin)
}

impl DeviceConfig {
    /// Parse from JSON. Unknown fields are ignored; missing fields get
    /// defaults; a config that parses but fails validation is still an
    /// error (the node falls back to setup mode).
    pub fn from_json(json: &str) -> Result<DeviceConfig, ConfigError> {
        let cfg: DeviceConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_json(&self) -> String {
        // Serialising a plain struct of primitives cannot fail.
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_gpio(self.sensor_pin) {
            return Err(ConfigError::InvalidValue("sensor_pin"));
        }
        if !is_valid_gpio(self.led_pin) {
            return Err(ConfigError::InvalidValue("led_pin"));
        }
        if self.sensor_pin == self.led_pin {
            return Err(ConfigError::InvalidValue("sensor_pin == led_pin"));
        }
        if self.sensor_pin_2 != 0 && !is_valid_gpio(self.sensor_pin_2) {
            return Err(ConfigError::InvalidValue("sensor_pin_2"));
        }
        if self.sensor_pin_2 != 0 && self.sensor_pin_2 == self.sensor_pin {
            return Err(ConfigError::InvalidValue("sensor_pin_2 == sensor_pin"));
        }
        // A speed trap is two beams by definition; 0 means "not fitted" and
        // would wire the exit ISR onto the boot-strap pin.
        if self.role == Role::SpeedTrap && self.sensor_pin_2 == 0 {
            return Err(ConfigError::InvalidValue("sensor_pin_2 required for speedtrap"));
        }
        if self.lidar_enabled
            && (!is_valid_gpio(self.lidar_rx_pin) || !is_valid_gpio(self.lidar_tx_pin))
        {
            return Err(ConfigError::InvalidValue("lidar pins"));
        }
        if self.audio_enabled && !is_valid_gpio(self.audio_tx_pin) {
            return Err(ConfigError::InvalidValue("audio_tx_pin"));
        }
        if self.device_id == 0 {
            return Err(ConfigError::InvalidValue("device_id"));
        }
        if self.track_length_m <= 0.0 || self.track_length_m > 100.0 {
            return Err(ConfigError::InvalidValue("track_length_m"));
        }
        if self.sensor_spacing_m <= 0.0 || self.sensor_spacing_m > 10.0 {
            return Err(ConfigError::InvalidValue("sensor_spacing_m"));
        }
        if !self.peer_mac.is_empty() && parse_mac(&self.peer_mac).is_none() {
            return Err(ConfigError::InvalidValue("peer_mac"));
        }
        Ok(())
    }

    /// The legacy manual peer MAC, if one is configured and parseable.
    pub fn manual_peer_mac(&self) -> Option<crate::peers::Mac> {
        if self.peer_mac.is_empty() {
            return None;
        }
        let mac = parse_mac(&self.peer_mac);
        if mac.is_none() {
            warn!("[CONFIG] Unparseable peer_mac: {}", self.peer_mac);
        }
        mac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = DeviceConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.role, Role::Finish);
        assert_eq!(cfg.track_length_m, 2.0);
    }

    #[test]
    fn json_round_trip_recovers_every_field() {
        let mut cfg = DeviceConfig::default();
        cfg.configured = true;
        cfg.role = Role::Start;
        cfg.hostname = "start-gate".into();
        cfg.device_id = 7;
        cfg.sensor_pin = 14;
        cfg.sensor_pin_2 = 27;
        cfg.peer_mac = "A4:CF:12:05:FF:00".into();
        cfg.lidar_enabled = true;
        cfg.lidar_threshold_mm = 250;

        let back = DeviceConfig::from_json(&cfg.to_json()).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let json = r#"{
            "role": "speedtrap",
            "sensor_pin_2": 27,
            "sensor_spacing_m": 0.15,
            "wled_host": "192.168.1.50",
            "future_knob": {"nested": true}
        }"#;
        let cfg = DeviceConfig::from_json(json).unwrap();
        assert_eq!(cfg.role, Role::SpeedTrap);
        assert_eq!(cfg.sensor_pin_2, 27);
        assert_eq!(cfg.sensor_spacing_m, 0.15);
        // Missing fields fall back to defaults.
        assert_eq!(cfg.sensor_pin, 4);
    }

    #[test]
    fn speedtrap_requires_a_second_beam_pin() {
        let cfg = DeviceConfig {
            role: Role::SpeedTrap,
            ..Default::default()
        };
        assert!(cfg.validate().is_err(), "unset exit beam must not pass");

        let cfg = DeviceConfig {
            role: Role::SpeedTrap,
            sensor_pin_2: 27,
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn second_sensor_must_differ_from_first() {
        let cfg = DeviceConfig {
            sensor_pin: 4,
            sensor_pin_2: 4,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn peripheral_pins_checked_against_blacklist_when_enabled() {
        // Disabled peripherals may carry whatever the defaults say.
        let cfg = DeviceConfig {
            lidar_rx_pin: 6,
            audio_tx_pin: 9,
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());

        let cfg = DeviceConfig {
            lidar_enabled: true,
            lidar_rx_pin: 6, // flash SPI pin
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidValue("lidar pins")));

        let cfg = DeviceConfig {
            audio_enabled: true,
            audio_tx_pin: 0, // boot strap pin
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidValue("audio_tx_pin")));
    }

    #[test]
    fn gpio_validation_rejects_flash_pins() {
        for pin in [0u8, 6, 7, 8, 9, 10, 11, 49] {
            assert!(!is_valid_gpio(pin), "pin {pin}");
        }
        assert!(is_valid_gpio(4));

        let cfg = DeviceConfig {
            sensor_pin: 6,
            ..Default::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::InvalidValue("sensor_pin"))
        );
    }

    #[test]
    fn sensor_and_led_must_differ() {
        let cfg = DeviceConfig {
            sensor_pin: 4,
            led_pin: 4,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_peer_mac_is_rejected() {
        let cfg = DeviceConfig {
            peer_mac: "not-a-mac".into(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        assert!(cfg.manual_peer_mac().is_none());

        let cfg = DeviceConfig {
            peer_mac: "A4:CF:12:05:FF:00".into(),
            ..Default::default()
        };
        assert_eq!(
            cfg.manual_peer_mac(),
            Some([0xA4, 0xCF, 0x12, 0x05, 0xFF, 0x00])
        );
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            DeviceConfig::from_json("{nope"),
            Err(ConfigError::Parse(_))
        ));
    }
}
