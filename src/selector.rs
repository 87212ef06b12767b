use simplelog::*;

use crate::config::AppConfig;
use crate::error::UsbModedError;
use crate::modes::{ModeList, MODE_ASK, MODE_CHARGING_FALLBACK, MODE_DEVELOPER};

// module name for logging engine
const NAME: &str = "<i><bright-black> selector: </>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserId {
    Unknown,
    Id(u32),
}

/// What the user-session notifier last told us. The daemon starts pessimistic
/// and only exposes data once a session confirms the device is usable.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub user: UserId,
    pub unlocked: bool,
    pub acting_dead: bool,
    pub user_changing: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState {
            user: UserId::Unknown,
            unlocked: false,
            acting_dead: false,
            user_changing: false,
        }
    }
}

impl SessionState {
    pub fn data_export_allowed(&self) -> bool {
        self.unlocked && !self.acting_dead && !self.user_changing
    }
}

/// Modes the given session may pick right now: loaded, not hidden, and on
/// the whitelist when one is configured.
pub fn available_modes(config: &AppConfig, modes: &ModeList) -> Vec<String> {
    modes
        .names()
        .into_iter()
        .filter(|name| !config.hidden_modes.contains(name))
        .filter(|name| config.whitelist.is_empty() || config.whitelist.contains(name))
        .collect()
}

/// Policy decision for a PC connection. Pure function of its inputs.
pub fn select_mode(
    config: &AppConfig,
    session: &SessionState,
    modes: &ModeList,
) -> Result<String, UsbModedError> {
    if config.rescue {
        info!("{} 🚒 rescue boot, forcing {}", NAME, MODE_DEVELOPER);
        return Ok(MODE_DEVELOPER.to_string());
    }

    if config.diag {
        return match config.diag_modes.first() {
            Some(mode) => {
                info!("{} 🩺 diagnostic boot, forcing {}", NAME, mode);
                Ok(mode.clone())
            }
            None => Err(UsbModedError::Fatal(
                "diagnostic boot configured without diagnostic modes".into(),
            )),
        };
    }

    let mut mode = config.mode_for_user(session.user);

    if mode == MODE_ASK {
        if session.user == UserId::Unknown {
            debug!("{} no user yet, not asking anybody", NAME);
            return Ok(MODE_CHARGING_FALLBACK.to_string());
        }
        let available = available_modes(config, modes);
        if available.len() == 1 {
            // a dialog with one button is no question at all
            mode = available[0].clone();
        }
    }

    if !mode.is_empty() && session.data_export_allowed() {
        return Ok(mode);
    }

    debug!("{} data export not permitted, falling back to charging", NAME);
    Ok(MODE_CHARGING_FALLBACK.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modes::ModeDescriptor;

    fn mode_list(names: &[&str]) -> ModeList {
        let mut list = ModeList::default();
        for name in names {
            list.insert(ModeDescriptor { name: name.to_string(), ..Default::default() });
        }
        list
    }

    fn unlocked_session(uid: u32) -> SessionState {
        SessionState {
            user: UserId::Id(uid),
            unlocked: true,
            acting_dead: false,
            user_changing: false,
        }
    }

    #[test]
    fn rescue_flag_wins_over_everything() {
        let mut config = AppConfig::default();
        config.rescue = true;
        config.diag = true;
        let session = SessionState::default();
        let modes = mode_list(&["mtp_mode"]);
        assert_eq!(select_mode(&config, &session, &modes).unwrap(), MODE_DEVELOPER);
    }

    #[test]
    fn diag_without_modes_is_a_config_error() {
        let mut config = AppConfig::default();
        config.diag = true;
        let session = unlocked_session(100000);
        let modes = mode_list(&[]);
        assert!(select_mode(&config, &session, &modes).is_err());

        config.diag_modes = vec!["diag_mode".into()];
        assert_eq!(select_mode(&config, &session, &modes).unwrap(), "diag_mode");
    }

    #[test]
    fn ask_with_single_available_mode_resolves_silently() {
        let mut config = AppConfig::default();
        config.mode_setting = MODE_ASK.into();
        let session = unlocked_session(100000);
        let modes = mode_list(&["mtp_mode"]);
        assert_eq!(select_mode(&config, &session, &modes).unwrap(), "mtp_mode");
    }

    #[test]
    fn ask_with_choice_stays_ask() {
        let mut config = AppConfig::default();
        config.mode_setting = MODE_ASK.into();
        let session = unlocked_session(100000);
        let modes = mode_list(&["mtp_mode", "developer_mode"]);
        assert_eq!(select_mode(&config, &session, &modes).unwrap(), MODE_ASK);
    }

    #[test]
    fn ask_without_user_charges_only() {
        let mut config = AppConfig::default();
        config.mode_setting = MODE_ASK.into();
        let session = SessionState { unlocked: true, ..Default::default() };
        let modes = mode_list(&["mtp_mode"]);
        assert_eq!(
            select_mode(&config, &session, &modes).unwrap(),
            MODE_CHARGING_FALLBACK
        );
    }

    #[test]
    fn locked_device_never_exports_data() {
        let mut config = AppConfig::default();
        config.mode_setting = "mtp_mode".into();
        let mut session = unlocked_session(100000);
        session.unlocked = false;
        let modes = mode_list(&["mtp_mode"]);
        assert_eq!(
            select_mode(&config, &session, &modes).unwrap(),
            MODE_CHARGING_FALLBACK
        );

        session.unlocked = true;
        assert_eq!(select_mode(&config, &session, &modes).unwrap(), "mtp_mode");
    }

    #[test]
    fn user_change_in_progress_blocks_export() {
        let mut config = AppConfig::default();
        config.mode_setting = "mtp_mode".into();
        let mut session = unlocked_session(100000);
        session.user_changing = true;
        let modes = mode_list(&["mtp_mode"]);
        assert_eq!(
            select_mode(&config, &session, &modes).unwrap(),
            MODE_CHARGING_FALLBACK
        );
    }

    #[test]
    fn hidden_and_whitelist_shape_availability() {
        let mut config = AppConfig::default();
        config.hidden_modes = vec!["diag_mode".into()];
        let modes = mode_list(&["mtp_mode", "diag_mode", "mass_storage"]);
        assert_eq!(available_modes(&config, &modes), vec!["mtp_mode", "mass_storage"]);

        config.whitelist = vec!["mass_storage".into()];
        assert_eq!(available_modes(&config, &modes), vec!["mass_storage"]);
    }
}
