use simplelog::*;
use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::actions::SystemActions;
use crate::config::AppConfig;
use crate::error::UsbModedError;

// module name for logging engine
const NAME: &str = "<i><bright-black> gadget: </>";

// gadget function short names used in mode descriptors
pub const FUNCTION_MASS_STORAGE: &str = "mass_storage";
pub const FUNCTION_RNDIS: &str = "rndis";
pub const FUNCTION_MTP: &str = "mtp";
const FUNCTION_FFS_LEGACY: &str = "ffs";

const CONFIGFS_CONFIG: &str = "configs/b.1";
const CONFIGFS_STRINGS: &str = "strings/0x409";

// the MTP daemon needs this long to bring its endpoints up before the
// host may enumerate them
const MTP_SETTLE: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Android,
    ConfigFs,
}

/// USB identity attributes written once at startup.
#[derive(Debug, Clone)]
pub struct UsbIdentity {
    pub id_vendor: String,
    pub id_product: String,
    pub charging_id_product: String,
    pub manufacturer: String,
    pub product: String,
    pub serial: String,
    pub rndis_ethaddr: String,
}

impl UsbIdentity {
    pub fn from_config(config: &AppConfig) -> UsbIdentity {
        UsbIdentity {
            id_vendor: config.id_vendor.clone(),
            id_product: config.id_product.clone(),
            charging_id_product: config.charging_id_product.clone(),
            manufacturer: config.manufacturer.clone(),
            product: config.product.clone(),
            serial: config.serial.clone(),
            rndis_ethaddr: config.rndis_ethaddr.clone(),
        }
    }
}

/// Single attribute write; failure is logged and reported as plain false so
/// callers can bail out of a switch sequence on the first miss.
pub fn write_attr(path: &Path, data: &str) -> bool {
    match fs::write(path, data) {
        Ok(()) => {
            debug!("{} {:?} <- {:?}", NAME, path, data);
            true
        }
        Err(e) => {
            error!("{} write {:?} failed: {}", NAME, path, e);
            false
        }
    }
}

fn read_attr(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim_end().to_owned())
}

/// Hex id normalization: `0xNNNN` and bare `NNNN` forms become `0xnnnn`,
/// anything unparsable passes through unchanged.
pub fn normalize_hex_id(id: &str) -> String {
    let trimmed = id.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    match u16::from_str_radix(digits, 16) {
        Ok(v) => format!("0x{:04x}", v),
        Err(_) => id.to_string(),
    }
}

/// Short descriptor names to ConfigFS function directory names.
fn normalize_function(function: &str) -> String {
    match function {
        FUNCTION_MASS_STORAGE => "mass_storage.usb0".to_string(),
        FUNCTION_RNDIS => "rndis_bam.rndis".to_string(),
        FUNCTION_MTP | FUNCTION_FFS_LEGACY => "ffs.mtp".to_string(),
        other => other.to_string(),
    }
}

/// First non-dotfile entry under the UDC class directory names the one and
/// only controller we will ever talk to.
fn discover_udc(class_dir: &Path) -> Option<String> {
    let entries = fs::read_dir(class_dir).ok()?;
    for entry in entries.flatten() {
        if let Ok(fname) = entry.file_name().into_string() {
            if fname.starts_with('.') {
                continue;
            }
            info!("{} Using UDC: {:?}", NAME, fname);
            return Some(fname);
        }
    }
    None
}

fn mkdir_existing_ok(path: &Path) -> bool {
    match fs::create_dir(path) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => true,
        Err(e) => {
            error!("{} mkdir {:?} failed: {}", NAME, path, e);
            false
        }
    }
}

pub struct ConfigFsGadget {
    root: PathBuf,
    udc_name: String,
    identity: UsbIdentity,
    actions: Arc<dyn SystemActions>,
}

impl ConfigFsGadget {
    pub fn new(
        root: PathBuf,
        udc_class_dir: &Path,
        udc_override: Option<String>,
        identity: UsbIdentity,
        actions: Arc<dyn SystemActions>,
    ) -> ConfigFsGadget {
        let udc_name = match udc_override {
            Some(udc) => {
                info!("{} Using UDC: {:?}", NAME, udc);
                udc
            }
            None => discover_udc(udc_class_dir).unwrap_or_else(|| {
                warn!("{} no UDC under {:?}, gadget cannot attach", NAME, udc_class_dir);
                String::new()
            }),
        };
        ConfigFsGadget { root, udc_name, identity, actions }
    }

    fn udc_path(&self) -> PathBuf {
        self.root.join("UDC")
    }

    fn config_dir(&self) -> PathBuf {
        self.root.join(CONFIGFS_CONFIG)
    }

    fn function_dir(&self, function: &str) -> PathBuf {
        self.root.join("functions").join(function)
    }

    pub fn in_use(&self) -> bool {
        self.root.is_dir()
    }

    /// Enable or disable the UDC; a write is skipped when the attribute
    /// already holds the desired value.
    pub fn set_udc(&self, enable: bool) -> bool {
        let desired = if enable {
            if self.udc_name.is_empty() {
                error!("{} cannot enable, no UDC known", NAME);
                return false;
            }
            self.udc_name.as_str()
        } else {
            ""
        };

        if let Some(current) = read_attr(&self.udc_path()) {
            if current == desired {
                return true;
            }
        }
        write_attr(&self.udc_path(), desired)
    }

    pub fn init_values(&self) -> bool {
        if !self.in_use() {
            error!("{} configfs root {:?} is absent", NAME, self.root);
            return false;
        }

        let mut ok = write_attr(&self.root.join("idVendor"), &normalize_hex_id(&self.identity.id_vendor))
            && write_attr(&self.root.join("idProduct"), &normalize_hex_id(&self.identity.id_product));

        let strings = self.root.join(CONFIGFS_STRINGS);
        ok = ok
            && fs::create_dir_all(&strings).is_ok()
            && write_attr(&strings.join("manufacturer"), &self.identity.manufacturer)
            && write_attr(&strings.join("product"), &self.identity.product)
            && write_attr(&strings.join("serialnumber"), &self.identity.serial)
            && fs::create_dir_all(self.config_dir()).is_ok();

        // pre-register every function the device supports
        for function in [FUNCTION_MASS_STORAGE, FUNCTION_RNDIS, FUNCTION_MTP] {
            ok = ok && mkdir_existing_ok(&self.function_dir(&normalize_function(function)));
        }

        // rndis needs the windows compat flag and a fixed MAC
        let rndis = self.function_dir(&normalize_function(FUNCTION_RNDIS));
        ok = ok
            && write_attr(&rndis.join("wceis"), "1")
            && write_attr(&rndis.join("ethaddr"), &self.identity.rndis_ethaddr);

        ok
    }

    /// Drops every function symlink from the active config. Anything that
    /// is not a symlink in there means somebody else misconfigured the
    /// gadget and we refuse to touch it.
    fn clear_functions(&self) -> bool {
        let entries = match fs::read_dir(self.config_dir()) {
            Ok(entries) => entries,
            Err(e) => {
                error!("{} config dir {:?} not readable: {}", NAME, self.config_dir(), e);
                return false;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            match fs::symlink_metadata(&path) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    if let Err(e) = fs::remove_file(&path) {
                        error!("{} unlink {:?} failed: {}", NAME, path, e);
                        return false;
                    }
                }
                Ok(_) => {
                    error!("{} {:?} is not a function symlink", NAME, path);
                    return false;
                }
                Err(e) => {
                    error!("{} stat {:?} failed: {}", NAME, path, e);
                    return false;
                }
            }
        }
        true
    }

    fn link_function(&self, function: &str) -> bool {
        if !mkdir_existing_ok(&self.function_dir(function)) {
            return false;
        }
        let link = self.config_dir().join(function);
        match symlink(self.function_dir(function), &link) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => true,
            Err(e) => {
                error!("{} symlink {:?} failed: {}", NAME, link, e);
                false
            }
        }
    }

    pub fn set_function(&self, function: &str) -> bool {
        let function = normalize_function(function);
        info!("{} 🔌 enacting function {}", NAME, function);

        if !self.set_udc(false) || !self.clear_functions() || !self.link_function(&function) {
            return false;
        }

        if function == "ffs.mtp" {
            if !self.actions.mount_functionfs() || !self.actions.start_mtp_service() {
                return false;
            }
            thread::sleep(MTP_SETTLE);
        }
        true
    }

    pub fn set_charging_mode(&self) -> bool {
        self.set_udc(false)
            && self.clear_functions()
            && self.set_product_id(&self.identity.charging_id_product)
            && self.set_udc(true)
    }

    pub fn set_product_id(&self, id: &str) -> bool {
        write_attr(&self.root.join("idProduct"), &normalize_hex_id(id))
    }

    pub fn set_vendor_id(&self, id: &str) -> bool {
        write_attr(&self.root.join("idVendor"), &normalize_hex_id(id))
    }
}

pub struct AndroidGadget {
    root: PathBuf,
    identity: UsbIdentity,
}

impl AndroidGadget {
    pub fn new(root: PathBuf, identity: UsbIdentity) -> AndroidGadget {
        AndroidGadget { root, identity }
    }

    pub fn in_use(&self) -> bool {
        self.root.is_dir()
    }

    pub fn init_values(&self) -> bool {
        if !self.in_use() {
            error!("{} android gadget root {:?} is absent", NAME, self.root);
            return false;
        }
        write_attr(&self.root.join("idVendor"), &normalize_hex_id(&self.identity.id_vendor))
            && write_attr(&self.root.join("idProduct"), &normalize_hex_id(&self.identity.id_product))
            && write_attr(&self.root.join("iManufacturer"), &self.identity.manufacturer)
            && write_attr(&self.root.join("iProduct"), &self.identity.product)
            && write_attr(&self.root.join("iSerial"), &self.identity.serial)
    }

    pub fn set_udc(&self, enable: bool) -> bool {
        write_attr(&self.root.join("enable"), if enable { "1" } else { "0" })
    }

    /// enable off, swap the function list, enable on
    pub fn set_function(&self, function: &str) -> bool {
        info!("{} 🔌 enacting function {}", NAME, function);
        self.set_udc(false)
            && write_attr(&self.root.join("functions"), function)
            && self.set_udc(true)
    }

    pub fn set_charging_mode(&self) -> bool {
        // an empty function list would not enumerate at all
        self.set_udc(false)
            && self.set_product_id(&self.identity.charging_id_product)
            && write_attr(&self.root.join("functions"), FUNCTION_MASS_STORAGE)
            && self.set_udc(true)
    }

    pub fn set_product_id(&self, id: &str) -> bool {
        write_attr(&self.root.join("idProduct"), &normalize_hex_id(id))
    }

    pub fn set_vendor_id(&self, id: &str) -> bool {
        write_attr(&self.root.join("idVendor"), &normalize_hex_id(id))
    }
}

/// The one backend selected at startup. ConfigFS wins when both mechanisms
/// are present on the kernel.
pub enum GadgetBackend {
    Android(AndroidGadget),
    ConfigFs(ConfigFsGadget),
}

impl GadgetBackend {
    pub fn probe(
        config: &AppConfig,
        actions: Arc<dyn SystemActions>,
    ) -> Result<GadgetBackend, UsbModedError> {
        let identity = UsbIdentity::from_config(config);
        if config.configfs_root.is_dir() {
            info!("{} 🔌 ConfigFS gadget backend selected", NAME);
            Ok(GadgetBackend::ConfigFs(ConfigFsGadget::new(
                config.configfs_root.clone(),
                &config.udc_class_dir,
                config.udc.clone(),
                identity,
                actions,
            )))
        } else if config.android_root.is_dir() {
            info!("{} 🔌 Android sysfs gadget backend selected", NAME);
            Ok(GadgetBackend::Android(AndroidGadget::new(
                config.android_root.clone(),
                identity,
            )))
        } else {
            Err(UsbModedError::ConfigAbsent(format!(
                "no gadget backend: neither {:?} nor {:?} exists",
                config.configfs_root, config.android_root
            )))
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            GadgetBackend::Android(_) => BackendKind::Android,
            GadgetBackend::ConfigFs(_) => BackendKind::ConfigFs,
        }
    }

    pub fn in_use(&self) -> bool {
        match self {
            GadgetBackend::Android(g) => g.in_use(),
            GadgetBackend::ConfigFs(g) => g.in_use(),
        }
    }

    pub fn init_values(&self) -> bool {
        match self {
            GadgetBackend::Android(g) => g.init_values(),
            GadgetBackend::ConfigFs(g) => g.init_values(),
        }
    }

    pub fn set_udc(&self, enable: bool) -> bool {
        match self {
            GadgetBackend::Android(g) => g.set_udc(enable),
            GadgetBackend::ConfigFs(g) => g.set_udc(enable),
        }
    }

    pub fn set_function(&self, function: &str) -> bool {
        match self {
            GadgetBackend::Android(g) => g.set_function(function),
            GadgetBackend::ConfigFs(g) => g.set_function(function),
        }
    }

    pub fn set_charging_mode(&self) -> bool {
        match self {
            GadgetBackend::Android(g) => g.set_charging_mode(),
            GadgetBackend::ConfigFs(g) => g.set_charging_mode(),
        }
    }

    pub fn set_product_id(&self, id: &str) -> bool {
        match self {
            GadgetBackend::Android(g) => g.set_product_id(id),
            GadgetBackend::ConfigFs(g) => g.set_product_id(id),
        }
    }

    pub fn set_vendor_id(&self, id: &str) -> bool {
        match self {
            GadgetBackend::Android(g) => g.set_vendor_id(id),
            GadgetBackend::ConfigFs(g) => g.set_vendor_id(id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::test_support::StubActions;

    fn identity() -> UsbIdentity {
        UsbIdentity {
            id_vendor: "0x2931".into(),
            id_product: "0x0A02".into(),
            charging_id_product: "0AFE".into(),
            manufacturer: "Rust".into(),
            product: "test gadget".into(),
            serial: "0123".into(),
            rndis_ethaddr: "02:0a:f5:0d:c0:de".into(),
        }
    }

    /// Minimal configfs tree plus a udc class dir with one controller.
    fn configfs_fixture() -> (tempfile::TempDir, ConfigFsGadget) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("usb_gadget/g1");
        fs::create_dir_all(root.join(CONFIGFS_CONFIG)).unwrap();
        fs::create_dir_all(root.join("functions")).unwrap();
        fs::write(root.join("UDC"), "\n").unwrap();
        let udc_class = dir.path().join("udc");
        fs::create_dir_all(udc_class.join("dummy_udc.0")).unwrap();

        let gadget = ConfigFsGadget::new(
            root,
            &udc_class,
            None,
            identity(),
            Arc::new(StubActions::default()),
        );
        (dir, gadget)
    }

    #[test]
    fn hex_ids_normalize_to_lowercase() {
        assert_eq!(normalize_hex_id("0AFE"), "0x0afe");
        assert_eq!(normalize_hex_id("0x0AFE"), "0x0afe");
        assert_eq!(normalize_hex_id(" 0AFE "), "0x0afe");
        assert_eq!(normalize_hex_id("zzz"), "zzz");
        assert_eq!(normalize_hex_id("a02"), "0x0a02");
    }

    #[test]
    fn short_function_names_map_to_configfs_paths() {
        assert_eq!(normalize_function("mass_storage"), "mass_storage.usb0");
        assert_eq!(normalize_function("rndis"), "rndis_bam.rndis");
        assert_eq!(normalize_function("mtp"), "ffs.mtp");
        assert_eq!(normalize_function("ffs"), "ffs.mtp");
        assert_eq!(normalize_function("acm.gs0"), "acm.gs0");
    }

    #[test]
    fn probe_prefers_configfs_over_android() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.configfs_root = dir.path().join("usb_gadget/g1");
        config.android_root = dir.path().join("android0");
        config.udc_class_dir = dir.path().join("udc");
        let actions: Arc<dyn SystemActions> = Arc::new(StubActions::default());

        assert!(GadgetBackend::probe(&config, actions.clone()).is_err());

        fs::create_dir_all(&config.android_root).unwrap();
        let backend = GadgetBackend::probe(&config, actions.clone()).unwrap();
        assert_eq!(backend.kind(), BackendKind::Android);

        fs::create_dir_all(&config.configfs_root).unwrap();
        let backend = GadgetBackend::probe(&config, actions).unwrap();
        assert_eq!(backend.kind(), BackendKind::ConfigFs);
        assert!(backend.in_use());
    }

    #[test]
    fn udc_discovery_skips_dotfiles() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".hidden")).unwrap();
        fs::create_dir_all(dir.path().join("ci_hdrc.0")).unwrap();
        let udc = discover_udc(dir.path()).unwrap();
        assert_eq!(udc, "ci_hdrc.0");
    }

    #[test]
    fn udc_write_toggles_between_name_and_empty() {
        let (_dir, gadget) = configfs_fixture();

        assert!(gadget.set_udc(true));
        assert_eq!(fs::read_to_string(gadget.udc_path()).unwrap(), "dummy_udc.0");
        // repeat enable hits the read-before-write no-op path
        assert!(gadget.set_udc(true));
        assert!(gadget.set_udc(false));
        assert_eq!(fs::read_to_string(gadget.udc_path()).unwrap(), "");
    }

    #[test]
    fn product_id_normalizes_on_the_way_to_sysfs() {
        let (_dir, gadget) = configfs_fixture();
        assert!(gadget.set_product_id("0AFE"));
        assert_eq!(
            fs::read_to_string(gadget.root.join("idProduct")).unwrap(),
            "0x0afe"
        );
        assert!(gadget.set_product_id("zzz"));
        assert_eq!(fs::read_to_string(gadget.root.join("idProduct")).unwrap(), "zzz");
    }

    #[test]
    fn set_function_replaces_config_symlinks_and_leaves_udc_down() {
        let (_dir, gadget) = configfs_fixture();
        assert!(gadget.init_values());

        // pretend rndis was active
        let old_link = gadget.config_dir().join("rndis_bam.rndis");
        symlink(gadget.function_dir("rndis_bam.rndis"), &old_link).unwrap();
        fs::write(gadget.udc_path(), "dummy_udc.0").unwrap();

        assert!(gadget.set_function(FUNCTION_MASS_STORAGE));
        assert!(!old_link.exists());
        let new_link = gadget.config_dir().join("mass_storage.usb0");
        assert!(fs::symlink_metadata(&new_link).unwrap().file_type().is_symlink());
        // the switch sequencer re-enables the UDC, not set_function
        assert_eq!(fs::read_to_string(gadget.udc_path()).unwrap(), "");
    }

    #[test]
    fn stray_regular_file_in_config_dir_is_a_config_error() {
        let (_dir, gadget) = configfs_fixture();
        fs::write(gadget.config_dir().join("junk"), "not a symlink").unwrap();
        assert!(!gadget.set_function(FUNCTION_MASS_STORAGE));
    }

    #[test]
    fn charging_mode_clears_functions_and_attaches() {
        let (_dir, gadget) = configfs_fixture();
        assert!(gadget.init_values());
        let link = gadget.config_dir().join("mass_storage.usb0");
        symlink(gadget.function_dir("mass_storage.usb0"), &link).unwrap();

        assert!(gadget.set_charging_mode());
        assert!(!link.exists());
        assert_eq!(fs::read_to_string(gadget.root.join("idProduct")).unwrap(), "0x0afe");
        assert_eq!(fs::read_to_string(gadget.udc_path()).unwrap(), "dummy_udc.0");
    }

    #[test]
    fn android_switch_follows_disable_write_enable_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("android0");
        fs::create_dir_all(&root).unwrap();
        let gadget = AndroidGadget::new(root.clone(), identity());

        assert!(gadget.init_values());
        assert!(gadget.set_function("mtp,mass_storage"));
        assert_eq!(fs::read_to_string(root.join("functions")).unwrap(), "mtp,mass_storage");
        assert_eq!(fs::read_to_string(root.join("enable")).unwrap(), "1");
        assert_eq!(fs::read_to_string(root.join("iManufacturer")).unwrap(), "Rust");
    }
}
