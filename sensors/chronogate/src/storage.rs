//! Flash persistence: `config.json`, `peers.json`, `runs.csv` and the
//! latest telemetry CSV, all on a SPIFFS partition mounted into the VFS so
//! plain `std::fs` works.
//!
//! Single-writer discipline: only the main loop calls the save paths, and
//! registry saves arrive pre-debounced from the discovery engine. A failed
//! write keeps the in-memory state; the next debounce retries.

use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;

use esp_idf_svc::sys::{self, esp};
use log::{info, warn};

use race_timing::config::DeviceConfig;
use race_timing::peers::PersistedPeer;
use race_timing::race::RunRecord;
use race_timing::telemetry::CompletedRun;

const MOUNT_POINT: &str = "/storage";
const STORAGE_PARTITION: &str = "storage";

/// Mount the storage partition into the VFS. Formats on first boot.
pub fn mount() -> Result<(), sys::EspError> {
    let base_path = CString::new(MOUNT_POINT).unwrap();
    let partition = CString::new(STORAGE_PARTITION).unwrap();

    let conf = sys::esp_vfs_spiffs_conf_t {
        base_path: base_path.as_ptr(),
        partition_label: partition.as_ptr(),
        max_files: 5,
        format_if_mount_failed: true,
    };
    esp!(unsafe { sys::esp_vfs_spiffs_register(&conf) })?;
    info!("[STORAGE] SPIFFS mounted at {MOUNT_POINT}");
    Ok(())
}

/// File-based persistence rooted at the mount point.
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new() -> Self {
        Self {
            root: PathBuf::from(MOUNT_POINT),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Load and validate the device configuration. `None` means the node
    /// has no usable config and must enter setup mode.
    pub fn load_config(&self) -> Option<DeviceConfig> {
        let json = match fs::read_to_string(self.path("config.json")) {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("[STORAGE] No config.json, fresh device");
                return None;
            }
            Err(e) => {
                warn!("[STORAGE] config.json read failed: {e}");
                return None;
            }
        };
        match DeviceConfig::from_json(&json) {
            Ok(cfg) => Some(cfg),
            Err(e) => {
                warn!("[STORAGE] config.json invalid: {e:?}");
                None
            }
        }
    }

    pub fn save_config(&self, cfg: &DeviceConfig) -> io::Result<()> {
        fs::write(self.path("config.json"), cfg.to_json())?;
        info!("[STORAGE] config.json saved");
        Ok(())
    }

    /// The persisted peer table; an unreadable file is a fresh start, not
    /// an error.
    pub fn load_peers(&self) -> Vec<PersistedPeer> {
        let json = match fs::read_to_string(self.path("peers.json")) {
            Ok(json) => json,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("[STORAGE] peers.json read failed: {e}");
                } else {
                    info!("[STORAGE] No saved peers, fresh start");
                }
                return Vec::new();
            }
        };
        match serde_json::from_str::<Vec<PersistedPeer>>(&json) {
            Ok(peers) => {
                info!("[STORAGE] Loaded {} saved peer(s)", peers.len());
                peers
            }
            Err(e) => {
                warn!("[STORAGE] Bad peers.json: {e}");
                Vec::new()
            }
        }
    }

    pub fn save_peers(&self, peers: &[PersistedPeer]) -> io::Result<()> {
        let json = serde_json::to_string(peers)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(self.path("peers.json"), json)?;
        info!("[STORAGE] Saved {} paired peer(s)", peers.len());
        Ok(())
    }

    pub fn remove_peers(&self) {
        let _ = fs::remove_file(self.path("peers.json"));
    }

    /// Append one race to the log, writing the header on first use.
    pub fn append_run(&self, record: &RunRecord) -> io::Result<()> {
        let path = self.path("runs.csv");
        let fresh = fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if fresh {
            writeln!(file, "{}", RunRecord::CSV_HEADER)?;
        }
        writeln!(file, "{}", record.csv_row())?;
        Ok(())
    }

    /// Overwrite the latest telemetry run in physical units.
    pub fn write_telemetry_csv(&self, run: &CompletedRun) -> io::Result<()> {
        let mut file = File::create(self.path("telemetry_latest.csv"))?;
        writeln!(file, "{}", CompletedRun::CSV_HEADER)?;
        for row in run.csv_rows() {
            writeln!(file, "{row}")?;
        }
        info!(
            "[STORAGE] telemetry_latest.csv written ({} samples, run {})",
            run.received_samples, run.run_id
        );
        Ok(())
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}
