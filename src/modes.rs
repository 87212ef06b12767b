use indexmap::IndexMap;
use simple_config_parser::Config as KvConfig;
use simplelog::*;
use std::fs;
use std::path::{Path, PathBuf};

// module name for logging engine
const NAME: &str = "<i><bright-black> modes: </>";

// Just a generic Result type to ease error handling for us. Errors in multithreaded
// async contexts needs some extra restrictions
type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

// reserved mode names; everything else comes from descriptor files
pub const MODE_UNDEFINED: &str = "undefined";
pub const MODE_BUSY: &str = "busy";
pub const MODE_ASK: &str = "ask";
pub const MODE_CHARGER: &str = "charger";
pub const MODE_CHARGING_FALLBACK: &str = "charging_fallback";
pub const MODE_DEVELOPER: &str = "developer_mode";

/// How to realize one mode on the hardware. Loaded once from a flat
/// `key = value` file and immutable afterwards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModeDescriptor {
    pub name: String,
    /// gadget function short name, also handed to modprobe
    pub module: Option<String>,
    pub sysfs_path: Option<PathBuf>,
    pub sysfs_value: Option<String>,
    pub sysfs_reset_value: Option<String>,
    pub softconnect_path: Option<PathBuf>,
    pub softconnect: Option<String>,
    pub softconnect_disconnect: Option<String>,
    pub id_product: Option<String>,
    pub id_vendor_override: Option<String>,
    /// extra writes applied in file order, at most four pairs
    pub android_extra_sysfs: Vec<(PathBuf, String)>,
    pub network: bool,
    pub appsync: bool,
    pub mass_storage: bool,
    pub nat: bool,
    pub dhcp_server: bool,
}

// get_str yields the first (and only) hit for a key
fn kv(cfg: &KvConfig, key: &str) -> Option<String> {
    cfg.get_str(key).into_iter().next()
}

fn kv_bool(cfg: &KvConfig, key: &str) -> bool {
    kv(cfg, key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

pub fn load_mode_file(path: &Path) -> Result<ModeDescriptor> {
    let cfg = KvConfig::new()
        .file(path)
        .map_err(|e| format!("{:?}: {:?}", path, e))?;

    let name = kv(&cfg, "name").ok_or_else(|| format!("{:?}: missing 'name'", path))?;

    let mut desc = ModeDescriptor {
        name,
        module: kv(&cfg, "module"),
        sysfs_path: kv(&cfg, "sysfs_path").map(PathBuf::from),
        sysfs_value: kv(&cfg, "sysfs_value"),
        sysfs_reset_value: kv(&cfg, "sysfs_reset_value"),
        softconnect_path: kv(&cfg, "softconnect_path").map(PathBuf::from),
        softconnect: kv(&cfg, "softconnect"),
        softconnect_disconnect: kv(&cfg, "softconnect_disconnect"),
        id_product: kv(&cfg, "idProduct"),
        id_vendor_override: kv(&cfg, "idVendorOverride"),
        android_extra_sysfs: Vec::new(),
        network: kv_bool(&cfg, "network"),
        appsync: kv_bool(&cfg, "appsync"),
        mass_storage: kv_bool(&cfg, "mass_storage"),
        nat: kv_bool(&cfg, "nat"),
        dhcp_server: kv_bool(&cfg, "dhcp_server"),
    };

    // android_extra_sysfs_path / _value, then numbered suffixes 2..4
    for suffix in ["", "2", "3", "4"] {
        let path_key = format!("android_extra_sysfs_path{}", suffix);
        let value_key = format!("android_extra_sysfs_value{}", suffix);
        if let (Some(p), Some(v)) = (kv(&cfg, &path_key), kv(&cfg, &value_key)) {
            desc.android_extra_sysfs.push((PathBuf::from(p), v));
        }
    }

    Ok(desc)
}

/// All dynamic modes known to the daemon, keyed by name in load order.
#[derive(Debug, Clone, Default)]
pub struct ModeList {
    modes: IndexMap<String, ModeDescriptor>,
}

impl ModeList {
    pub fn load(dir: &Path) -> ModeList {
        let mut list = ModeList::default();
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("{} ⚙️ mode dir {:?} not readable: {}", NAME, dir, e);
                return list;
            }
        };

        let mut paths: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
        paths.sort();
        for path in paths {
            if !path.is_file() {
                continue;
            }
            match load_mode_file(&path) {
                Ok(desc) => {
                    debug!("{} loaded mode {} from {:?}", NAME, desc.name, path);
                    list.modes.insert(desc.name.clone(), desc);
                }
                Err(e) => warn!("{} ⚙️ skipping mode file: {}", NAME, e),
            }
        }
        info!("{} ⚙️ {} dynamic mode(s) loaded", NAME, list.modes.len());
        list
    }

    pub fn get(&self, name: &str) -> Option<&ModeDescriptor> {
        self.modes.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.modes.keys().cloned().collect()
    }

    pub fn insert(&mut self, desc: ModeDescriptor) {
        self.modes.insert(desc.name.clone(), desc);
    }

    pub fn len(&self) -> usize {
        self.modes.len()
    }
}

/// Maps the full-precision internal mode name to the one shown on the bus.
/// `charging_fallback` hides behind its configured synonym, everything else
/// is exposed as-is.
pub fn canonical_external(internal: &str, fallback_synonym: &str) -> String {
    match internal {
        MODE_CHARGING_FALLBACK => fallback_synonym.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_mode_file(dir: &Path, file: &str, content: &str) -> PathBuf {
        let path = dir.join(file);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn descriptor_parses_all_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_mode_file(
            dir.path(),
            "developer_mode.ini",
            "name=developer_mode\n\
             module=rndis\n\
             sysfs_path=/sys/devices/usb/fn\n\
             sysfs_value=rndis\n\
             sysfs_reset_value=none\n\
             idProduct=0AFE\n\
             network=1\n\
             android_extra_sysfs_path=/sys/extra1\n\
             android_extra_sysfs_value=a\n\
             android_extra_sysfs_path2=/sys/extra2\n\
             android_extra_sysfs_value2=b\n",
        );

        let desc = load_mode_file(&path).unwrap();
        assert_eq!(desc.name, "developer_mode");
        assert_eq!(desc.module.as_deref(), Some("rndis"));
        assert_eq!(desc.sysfs_value.as_deref(), Some("rndis"));
        assert_eq!(desc.id_product.as_deref(), Some("0AFE"));
        assert!(desc.network);
        assert!(!desc.mass_storage);
        assert_eq!(
            desc.android_extra_sysfs,
            vec![
                (PathBuf::from("/sys/extra1"), "a".to_string()),
                (PathBuf::from("/sys/extra2"), "b".to_string()),
            ]
        );
    }

    #[test]
    fn descriptor_without_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_mode_file(dir.path(), "broken.ini", "module=rndis\n");
        assert!(load_mode_file(&path).is_err());
    }

    #[test]
    fn mode_list_skips_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        write_mode_file(dir.path(), "mtp_mode.ini", "name=mtp_mode\nmodule=mtp\n");
        write_mode_file(dir.path(), "broken.ini", "no_name_here=1\n");

        let list = ModeList::load(dir.path());
        assert_eq!(list.len(), 1);
        assert!(list.get("mtp_mode").is_some());
    }

    #[test]
    fn external_name_hides_charging_fallback() {
        assert_eq!(
            canonical_external(MODE_CHARGING_FALLBACK, "charging_only"),
            "charging_only"
        );
        assert_eq!(canonical_external(MODE_UNDEFINED, "charging_only"), MODE_UNDEFINED);
        assert_eq!(canonical_external("mtp_mode", "charging_only"), "mtp_mode");
    }
}
