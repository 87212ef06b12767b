use indexmap::IndexMap;
use serde::de::{Deserializer, Error as DeError};
use serde::{Deserialize, Serialize};
use simplelog::*;
use std::{fmt::Display, fs, path::PathBuf, str::FromStr};
use toml_edit::{value, DocumentMut};

use crate::modes::MODE_ASK;
use crate::selector::UserId;

pub fn empty_string_as_none<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: FromStr,
    T::Err: Display,
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    if s.trim().is_empty() {
        Ok(None)
    } else {
        T::from_str(&s).map(Some).map_err(DeError::custom)
    }
}

fn default_fallback_name() -> String {
    "charging_only".into()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub debug: bool,
    pub disable_console_debug: bool,
    pub logfile: PathBuf,

    /// directory of flat key=value mode descriptor files
    pub mode_dir: PathBuf,
    /// global mode slot, used when no user-specific setting exists
    pub mode_setting: String,
    /// per-user mode settings keyed by uid
    pub user_mode_settings: IndexMap<String, String>,
    pub hidden_modes: Vec<String>,
    /// empty list means every loaded mode is allowed
    pub whitelist: Vec<String>,
    /// uids allowed to request mode changes over the bus; root always is
    pub allowed_uids: Vec<u32>,

    pub rescue: bool,
    pub diag: bool,
    pub diag_modes: Vec<String>,

    // usb identity presented to the host
    pub id_vendor: String,
    pub id_product: String,
    pub charging_id_product: String,
    pub manufacturer: String,
    pub product: String,
    pub serial: String,
    pub rndis_ethaddr: String,

    /// user-visible synonym published instead of `charging_fallback`
    #[serde(default = "default_fallback_name")]
    pub fallback_external_name: String,

    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub power_supply_path: Option<PathBuf>,
    pub power_supply_class: PathBuf,

    // kernel gadget roots, overridable for bring-up and tests
    pub configfs_root: PathBuf,
    pub android_root: PathBuf,
    pub udc_class_dir: PathBuf,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub udc: Option<String>,
    pub wakelock_dir: PathBuf,

    // escape-hatch command lines
    pub mtp_mount_cmd: String,
    pub mtp_service_cmd: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            debug: false,
            disable_console_debug: false,
            logfile: "/var/log/usb-moded-rs.log".into(),
            mode_dir: "/etc/usb-moded-rs/modes".into(),
            mode_setting: MODE_ASK.to_string(),
            user_mode_settings: IndexMap::new(),
            hidden_modes: Vec::new(),
            whitelist: Vec::new(),
            allowed_uids: Vec::new(),
            rescue: false,
            diag: false,
            diag_modes: Vec::new(),
            id_vendor: "0x2931".into(),
            id_product: "0x0A02".into(),
            charging_id_product: "0AFE".into(),
            manufacturer: "Rust".into(),
            product: "usb-moded-rs gadget".into(),
            serial: "0123456789ABCDEF".into(),
            rndis_ethaddr: "02:0a:f5:0d:c0:de".into(),
            fallback_external_name: default_fallback_name(),
            power_supply_path: None,
            power_supply_class: "/sys/class/power_supply".into(),
            configfs_root: "/config/usb_gadget/g1".into(),
            android_root: "/sys/class/android_usb/android0".into(),
            udc_class_dir: "/sys/class/udc".into(),
            udc: None,
            wakelock_dir: "/sys/power".into(),
            mtp_mount_cmd: "mount -t functionfs mtp /dev/mtp".into(),
            mtp_service_cmd: "mtpd".into(),
        }
    }
}

impl AppConfig {
    pub fn load(config_file: PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::File;
        let file_config: AppConfig = ::config::Config::builder()
            .add_source(File::from(config_file).required(false))
            .build()?
            .try_deserialize()
            .unwrap_or_default();

        Ok(file_config)
    }

    /// Persists the mutable settings back into the config file, keeping
    /// whatever formatting and unrelated keys the file already has.
    pub fn save(&self, config_file: PathBuf) {
        debug!("Saving config: {:?}", config_file);
        let raw = fs::read_to_string(&config_file).unwrap_or_default();
        let mut doc = raw.parse::<DocumentMut>().unwrap_or_else(|_| {
            // if the file doesn't exists or there is parse error, create a new one
            DocumentMut::new()
        });

        doc["mode_setting"] = value(&self.mode_setting);
        let mut table = toml_edit::Table::new();
        for (uid, mode) in &self.user_mode_settings {
            table.insert(uid, value(mode));
        }
        doc["user_mode_settings"] = toml_edit::Item::Table(table);

        let _ = fs::write(config_file, doc.to_string());
    }

    /// Configured mode for the given user; the global slot serves users the
    /// session tracker has not identified yet.
    pub fn mode_for_user(&self, user: UserId) -> String {
        match user {
            UserId::Id(uid) => self
                .user_mode_settings
                .get(&uid.to_string())
                .cloned()
                .unwrap_or_else(|| self.mode_setting.clone()),
            UserId::Unknown => self.mode_setting.clone(),
        }
    }

    pub fn set_mode_for_user(&mut self, user: UserId, mode: &str) {
        match user {
            UserId::Id(uid) => {
                self.user_mode_settings.insert(uid.to_string(), mode.to_string());
            }
            UserId::Unknown => self.mode_setting = mode.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_setting_overrides_global_slot() {
        let mut config = AppConfig::default();
        config.mode_setting = "mtp_mode".into();
        config.set_mode_for_user(UserId::Id(100000), "developer_mode");

        assert_eq!(config.mode_for_user(UserId::Id(100000)), "developer_mode");
        assert_eq!(config.mode_for_user(UserId::Id(100001)), "mtp_mode");
        assert_eq!(config.mode_for_user(UserId::Unknown), "mtp_mode");
    }

    #[test]
    fn save_round_trips_mode_settings() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.toml");
        fs::write(&file, "debug = true\n").unwrap();

        let mut config = AppConfig::default();
        config.set_mode_for_user(UserId::Unknown, "mass_storage");
        config.set_mode_for_user(UserId::Id(100000), "mtp_mode");
        config.save(file.clone());

        let reloaded = AppConfig::load(file).unwrap();
        // untouched keys survive the edit
        assert!(reloaded.debug);
        assert_eq!(reloaded.mode_setting, "mass_storage");
        assert_eq!(reloaded.mode_for_user(UserId::Id(100000)), "mtp_mode");
    }
}
