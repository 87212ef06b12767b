use kobject_uevent::UEvent;
use netlink_sys::protocols::NETLINK_KOBJECT_UEVENT;
use simplelog::*;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;
use tokio::sync::mpsc::Sender;

use crate::error::UsbModedError;

// module name for logging engine
const NAME: &str = "<i><bright-black> cable: </>";

/// Dedicated chargers may present themselves as a PC for a moment on first
/// contact; promotions into PcConnected wait this long.
pub const PC_DEBOUNCE: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CableState {
    Unknown,
    Disconnected,
    ChargerConnected,
    PcConnected,
}

#[derive(Debug)]
pub enum CableEvent {
    /// POWER_SUPPLY_* properties of one device change
    Properties(HashMap<String, String>),
    /// the event source died twice, daemon must give up
    SourceFailed,
}

fn open_socket() -> io::Result<netlink_sys::Socket> {
    let mut socket = netlink_sys::Socket::new(NETLINK_KOBJECT_UEVENT)?;
    let sa = netlink_sys::SocketAddr::new(process::id(), 1);
    socket.bind(&sa)?;
    Ok(socket)
}

/// Blocking netlink listener thread. Decodes kobject uevents, keeps only the
/// ones for our power-supply device and hands their property maps to the
/// main loop. A dead socket is reopened once; the second failure is fatal.
pub fn uevent_listener(device_name: String, tx: Sender<CableEvent>) {
    info!("{} 📬 Starting UEvent listener thread...", NAME);
    let mut buf = vec![0u8; 1024 * 8];
    let mut reinits = 0;

    let mut socket = match open_socket() {
        Ok(socket) => socket,
        Err(e) => {
            error!("{} netlink socket setup failed: {}", NAME, e);
            let _ = tx.blocking_send(CableEvent::SourceFailed);
            return;
        }
    };

    loop {
        if let Err(e) = socket.recv(&mut buf, 0) {
            reinits += 1;
            if reinits > 1 {
                error!("{} event source failed again ({}), giving up", NAME, e);
                let _ = tx.blocking_send(CableEvent::SourceFailed);
                return;
            }
            warn!("{} event source read failed ({}), re-initializing once", NAME, e);
            match open_socket() {
                Ok(fresh) => {
                    socket = fresh;
                    continue;
                }
                Err(e) => {
                    error!("{} event source re-init failed: {}", NAME, e);
                    let _ = tx.blocking_send(CableEvent::SourceFailed);
                    return;
                }
            }
        }

        let u = match UEvent::from_netlink_packet(&buf) {
            Ok(u) => u,
            Err(e) => {
                debug!("{} undecodable uevent: {:?}", NAME, e);
                continue;
            }
        };

        let ours = u.env.get("SUBSYSTEM").is_some_and(|s| s == "power_supply")
            && u.env.get("POWER_SUPPLY_NAME").is_some_and(|n| *n == device_name);
        if ours {
            debug!("{} got uevent: {:?}", NAME, u.env);
            if tx.blocking_send(CableEvent::Properties(u.env.clone())).is_err() {
                return;
            }
        }
    }
}

/// The power-supply device we watch, picked once at startup.
#[derive(Debug, Clone)]
pub struct PowerSupply {
    pub syspath: PathBuf,
    pub name: String,
}

fn read_uevent_file(path: &Path) -> io::Result<HashMap<String, String>> {
    let content = fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.to_string(), v.trim().to_string()))
        .collect())
}

fn score_device(name: &str, props: &HashMap<String, String>) -> i32 {
    // batteries are power supplies too, never pick one
    if name.contains("battery") || name.contains("BAT") {
        return -1;
    }
    let mut score = 0;
    if name.contains("usb") {
        score += 10;
    }
    if name.contains("charger") {
        score += 5;
    }
    if props.contains_key("POWER_SUPPLY_PRESENT") {
        score += 5;
    }
    if props.contains_key("POWER_SUPPLY_ONLINE") {
        score += 10;
    }
    if props.contains_key("POWER_SUPPLY_TYPE") {
        score += 10;
    }
    score
}

impl PowerSupply {
    pub fn discover(
        class_dir: &Path,
        configured: Option<&Path>,
    ) -> Result<PowerSupply, UsbModedError> {
        if let Some(path) = configured {
            if path.is_dir() {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                info!("{} 🔋 using configured power supply {:?}", NAME, path);
                return Ok(PowerSupply { syspath: path.to_path_buf(), name });
            }
            warn!("{} configured power supply {:?} absent, scanning", NAME, path);
        }

        let entries = fs::read_dir(class_dir).map_err(|e| {
            UsbModedError::Fatal(format!("power supply class {:?}: {}", class_dir, e))
        })?;

        let mut best: Option<(i32, PowerSupply)> = None;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let syspath = entry.path();
            let props = read_uevent_file(&syspath.join("uevent")).unwrap_or_default();
            let score = score_device(&name, &props);
            debug!("{} candidate {} scored {}", NAME, name, score);
            if score > 0 && best.as_ref().map(|(s, _)| score > *s).unwrap_or(true) {
                best = Some((score, PowerSupply { syspath, name }));
            }
        }

        match best {
            Some((score, ps)) => {
                info!("{} 🔋 watching power supply {} (score {})", NAME, ps.name, score);
                Ok(ps)
            }
            None => Err(UsbModedError::Fatal(
                "no usable power supply device found".into(),
            )),
        }
    }

    /// Current properties straight from sysfs, used to seed the state at
    /// startup instead of waiting for the first hotplug.
    pub fn read_props(&self) -> Result<HashMap<String, String>, UsbModedError> {
        Ok(read_uevent_file(&self.syspath.join("uevent"))?)
    }
}

/// Property map to cable state, with the documented key fallbacks.
pub fn cable_state_from_props(props: &HashMap<String, String>, prev: CableState) -> CableState {
    let present = props
        .get("POWER_SUPPLY_PRESENT")
        .or_else(|| props.get("POWER_SUPPLY_ONLINE"));
    let present = match present {
        Some(v) => v == "1",
        None => {
            warn!("{} neither PRESENT nor ONLINE reported, assuming disconnect", NAME);
            return CableState::Disconnected;
        }
    };
    if !present {
        return CableState::Disconnected;
    }

    let supply_type = props
        .get("POWER_SUPPLY_REAL_TYPE")
        .or_else(|| props.get("POWER_SUPPLY_TYPE"));
    let Some(supply_type) = supply_type else {
        warn!("{} supply type not reported, optimistically assuming a PC", NAME);
        return CableState::PcConnected;
    };

    match supply_type.as_str() {
        "USB" | "USB_CDP" => CableState::PcConnected,
        "USB_DCP" | "USB_HVDCP" | "USB_HVDCP_3" => CableState::ChargerConnected,
        "USB_FLOAT" => {
            if !matches!(prev, CableState::ChargerConnected | CableState::PcConnected) {
                warn!("{} floating charger detected", NAME);
            }
            CableState::ChargerConnected
        }
        "Unknown" => CableState::Disconnected,
        other => {
            warn!("{} unhandled power supply type {:?}", NAME, other);
            CableState::Disconnected
        }
    }
}

/// What the main loop should do with one observation.
#[derive(Debug, PartialEq, Eq)]
pub enum CableAction {
    None,
    Apply(CableState),
    /// start the PcConnected promotion timer
    ArmTimer,
}

/// Debounce bookkeeping. The timer itself lives in the main loop; this
/// tracks the applied state and whether a PcConnected promotion is pending.
#[derive(Debug)]
pub struct CableMonitor {
    current: CableState,
    pending_pc: bool,
}

impl CableMonitor {
    pub fn new() -> CableMonitor {
        CableMonitor { current: CableState::Unknown, pending_pc: false }
    }

    pub fn current(&self) -> CableState {
        self.current
    }

    pub fn observe(&mut self, proposed: CableState) -> CableAction {
        if proposed == self.current {
            // a repeat PcConnected keeps a pending promotion timer running
            if proposed != CableState::PcConnected {
                self.pending_pc = false;
            }
            return CableAction::None;
        }

        if proposed == CableState::PcConnected && self.current != CableState::Unknown {
            if self.pending_pc {
                return CableAction::None;
            }
            debug!("{} deferring PcConnected promotion", NAME);
            self.pending_pc = true;
            return CableAction::ArmTimer;
        }

        // everything else applies immediately and cancels a pending promotion
        self.pending_pc = false;
        self.current = proposed;
        CableAction::Apply(proposed)
    }

    /// The promotion timer expired without a contradicting observation.
    pub fn timer_fired(&mut self) -> Option<CableState> {
        if !self.pending_pc {
            return None;
        }
        self.pending_pc = false;
        self.current = CableState::PcConnected;
        Some(CableState::PcConnected)
    }
}
