use simplelog::*;

use crate::config::AppConfig;
use crate::error::UsbModedError;
use crate::modes::ModeList;
use crate::selector::UserId;

// module name for logging engine
const NAME: &str = "<i><bright-black> bridge: </>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeEvent {
    /// external mode just became `ask`, the UI should pop the mode dialog
    ConnectedDialogShow,
}

/// Outbound signal surface towards the IPC bus bridge. The bridge process
/// plumbing is not our business; it gets semantic notifications and turns
/// them into whatever wire format it speaks.
pub trait ModeBridge: Send {
    fn current_state(&mut self, mode: &str);
    fn target_state(&mut self, mode: &str);
    fn event(&mut self, event: BridgeEvent);
    fn supported_modes(&mut self, modes: &[String]);
    fn hidden_modes(&mut self, modes: &[String]);
    fn whitelist(&mut self, modes: &[String]);
}

/// Default bridge: just log. Keeps the daemon fully functional when no bus
/// is around (rescue shells, tests, early boot).
pub struct LogBridge;

impl ModeBridge for LogBridge {
    fn current_state(&mut self, mode: &str) {
        info!("{} 📣 current_state: {}", NAME, mode);
    }

    fn target_state(&mut self, mode: &str) {
        info!("{} 📣 target_state: {}", NAME, mode);
    }

    fn event(&mut self, event: BridgeEvent) {
        info!("{} 📣 event: {:?}", NAME, event);
    }

    fn supported_modes(&mut self, modes: &[String]) {
        info!("{} 📣 supported_modes: {:?}", NAME, modes);
    }

    fn hidden_modes(&mut self, modes: &[String]) {
        info!("{} 📣 hidden_modes: {:?}", NAME, modes);
    }

    fn whitelist(&mut self, modes: &[String]) {
        info!("{} 📣 whitelist: {:?}", NAME, modes);
    }
}

/// Inbound requests the bridge (and the user-session notifier behind it)
/// feeds into the main loop.
#[derive(Debug, Clone)]
pub enum BridgeRequest {
    /// switch to a mode right now
    ModeRequest { mode: String, uid: u32 },
    /// persist a mode preference for a user
    SetModeSetting { mode: String, uid: u32 },
    UserChanging,
    UserChanged { user: UserId },
    LockChanged { unlocked: bool },
    ActingDeadChanged { acting_dead: bool },
    ReloadConfig,
}

/// Whitelist plus capability policy for inbound mode requests. Root may do
/// anything; everyone else needs to be listed and may only pick modes that
/// are actually on offer.
pub fn check_mode_request(
    config: &AppConfig,
    modes: &ModeList,
    mode: &str,
    uid: u32,
) -> Result<(), UsbModedError> {
    if uid != 0 && !config.allowed_uids.contains(&uid) {
        return Err(UsbModedError::PolicyDenied {
            uid,
            reason: "uid not allowed to control usb modes".into(),
        });
    }

    if modes.get(mode).is_none() {
        return Err(UsbModedError::PolicyDenied {
            uid,
            reason: format!("unknown mode {}", mode),
        });
    }
    if config.hidden_modes.iter().any(|m| m == mode) {
        return Err(UsbModedError::PolicyDenied {
            uid,
            reason: format!("mode {} is hidden", mode),
        });
    }
    if !config.whitelist.is_empty() && !config.whitelist.iter().any(|m| m == mode) {
        return Err(UsbModedError::PolicyDenied {
            uid,
            reason: format!("mode {} not whitelisted", mode),
        });
    }
    Ok(())
}

#[cfg(test)]
pub mod test_support {
    use super::{BridgeEvent, ModeBridge};

    /// Records every outbound signal for assertions.
    #[derive(Default)]
    pub struct RecordingBridge {
        pub signals: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
    }

    impl RecordingBridge {
        pub fn log(&self) -> std::sync::Arc<std::sync::Mutex<Vec<String>>> {
            self.signals.clone()
        }
    }

    impl ModeBridge for RecordingBridge {
        fn current_state(&mut self, mode: &str) {
            self.signals.lock().unwrap().push(format!("current_state:{}", mode));
        }

        fn target_state(&mut self, mode: &str) {
            self.signals.lock().unwrap().push(format!("target_state:{}", mode));
        }

        fn event(&mut self, event: BridgeEvent) {
            self.signals.lock().unwrap().push(format!("event:{:?}", event));
        }

        fn supported_modes(&mut self, modes: &[String]) {
            self.signals.lock().unwrap().push(format!("supported_modes:{:?}", modes));
        }

        fn hidden_modes(&mut self, modes: &[String]) {
            self.signals.lock().unwrap().push(format!("hidden_modes:{:?}", modes));
        }

        fn whitelist(&mut self, modes: &[String]) {
            self.signals.lock().unwrap().push(format!("whitelist:{:?}", modes));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modes::ModeDescriptor;

    fn modes_with(names: &[&str]) -> ModeList {
        let mut list = ModeList::default();
        for name in names {
            list.insert(ModeDescriptor { name: name.to_string(), ..Default::default() });
        }
        list
    }

    #[test]
    fn root_passes_the_capability_check() {
        let config = AppConfig::default();
        let modes = modes_with(&["mtp_mode"]);
        assert!(check_mode_request(&config, &modes, "mtp_mode", 0).is_ok());
    }

    #[test]
    fn unlisted_uid_is_denied() {
        let mut config = AppConfig::default();
        let modes = modes_with(&["mtp_mode"]);
        assert!(check_mode_request(&config, &modes, "mtp_mode", 100000).is_err());

        config.allowed_uids = vec![100000];
        assert!(check_mode_request(&config, &modes, "mtp_mode", 100000).is_ok());
    }

    #[test]
    fn hidden_and_unknown_modes_are_denied_even_for_root() {
        let mut config = AppConfig::default();
        config.hidden_modes = vec!["diag_mode".into()];
        let modes = modes_with(&["mtp_mode", "diag_mode"]);

        assert!(check_mode_request(&config, &modes, "diag_mode", 0).is_err());
        assert!(check_mode_request(&config, &modes, "no_such_mode", 0).is_err());
    }

    #[test]
    fn whitelist_restricts_requests() {
        let mut config = AppConfig::default();
        config.allowed_uids = vec![100000];
        config.whitelist = vec!["mass_storage".into()];
        let modes = modes_with(&["mtp_mode", "mass_storage"]);

        assert!(check_mode_request(&config, &modes, "mtp_mode", 100000).is_err());
        assert!(check_mode_request(&config, &modes, "mass_storage", 100000).is_ok());
    }
}
