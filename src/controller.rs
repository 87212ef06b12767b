use simplelog::*;
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::sync::{Arc, RwLock};

use crate::bridge::{check_mode_request, BridgeEvent, BridgeRequest, ModeBridge};
use crate::cable::CableState;
use crate::config::AppConfig;
use crate::modes::{canonical_external, ModeList, MODE_ASK, MODE_BUSY, MODE_CHARGER, MODE_CHARGING_FALLBACK, MODE_UNDEFINED};
use crate::selector::{select_mode, SessionState, UserId};

// module name for logging engine
const NAME: &str = "<i><bright-black> control: </>";

/// The process-wide mode view. `internal` is full precision, `target` is
/// where we are heading, `external` is what the bus sees (`busy` while a
/// switch is in flight).
#[derive(Debug, Clone)]
pub struct ControllerState {
    pub internal: String,
    pub target: String,
    pub external: String,
    pub user_for_mode: UserId,
}

impl Default for ControllerState {
    fn default() -> Self {
        ControllerState {
            internal: MODE_UNDEFINED.to_string(),
            target: MODE_UNDEFINED.to_string(),
            external: MODE_UNDEFINED.to_string(),
            user_for_mode: UserId::Unknown,
        }
    }
}

/// Single mutator of the mode state. Lives on the main loop; everything it
/// learns arrives as events, everything it decides leaves as a work item or
/// a bridge signal.
pub struct Controller {
    state: ControllerState,
    cable: CableState,
    session: SessionState,
    config: AppConfig,
    config_file: PathBuf,
    modes: Arc<RwLock<ModeList>>,
    bridge: Box<dyn ModeBridge>,
    work_tx: Sender<String>,
}

impl Controller {
    pub fn new(
        config: AppConfig,
        config_file: PathBuf,
        modes: Arc<RwLock<ModeList>>,
        bridge: Box<dyn ModeBridge>,
        work_tx: Sender<String>,
    ) -> Controller {
        Controller {
            state: ControllerState::default(),
            cable: CableState::Unknown,
            session: SessionState::default(),
            config,
            config_file,
            modes,
            bridge,
            work_tx,
        }
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    fn publish_target(&mut self, mode: &str) {
        if self.state.target != mode {
            self.state.target = mode.to_string();
            self.bridge.target_state(mode);
        }
    }

    fn publish_external(&mut self, mode: &str) {
        if self.state.external != mode {
            self.state.external = mode.to_string();
            self.bridge.current_state(mode);
            if mode == MODE_ASK {
                self.bridge.event(BridgeEvent::ConnectedDialogShow);
            }
        }
    }

    /// Announce the mode lists once after load and on every reload.
    pub fn publish_mode_lists(&mut self) {
        let supported: Vec<String> = {
            let modes = self.modes.read().unwrap();
            modes
                .names()
                .into_iter()
                .filter(|name| !self.config.hidden_modes.contains(name))
                .collect()
        };
        self.bridge.supported_modes(&supported);
        let hidden = self.config.hidden_modes.clone();
        self.bridge.hidden_modes(&hidden);
        let whitelist = self.config.whitelist.clone();
        self.bridge.whitelist(&whitelist);
    }

    fn run_selector(&self) -> String {
        let modes = self.modes.read().unwrap();
        match select_mode(&self.config, &self.session, &modes) {
            Ok(mode) => mode,
            Err(e) => {
                error!("{} mode selection failed: {}", NAME, e);
                MODE_CHARGING_FALLBACK.to_string()
            }
        }
    }

    /// Debounced cable state from the observer.
    pub fn set_cable_state(&mut self, state: CableState) {
        if state == self.cable {
            return;
        }
        info!("{} 🔌 cable state {:?} -> {:?}", NAME, self.cable, state);
        self.cable = state;
        match state {
            CableState::Disconnected => self.set_usb_mode(MODE_UNDEFINED),
            CableState::ChargerConnected => self.set_usb_mode(MODE_CHARGER),
            CableState::PcConnected => {
                let mode = self.run_selector();
                self.set_usb_mode(&mode);
            }
            CableState::Unknown => (),
        }
    }

    /// Request a mode. The newest request always wins; work already started
    /// in the worker is never cancelled mid-write.
    pub fn set_usb_mode(&mut self, mode: &str) {
        if self.state.external != MODE_BUSY && mode == self.state.internal {
            debug!("{} already in {}, nothing to switch", NAME, mode);
            return;
        }
        if self.state.external == MODE_BUSY && mode == self.state.target {
            debug!("{} already heading for {}", NAME, mode);
            return;
        }

        info!("{} 🎯 mode requested: {}", NAME, mode);
        self.state.internal = mode.to_string();
        self.publish_target(mode);
        self.publish_external(MODE_BUSY);
        self.state.user_for_mode = UserId::Unknown;
        if self.work_tx.send(mode.to_string()).is_err() {
            error!("{} worker is gone, mode request dropped", NAME);
        }
    }

    /// Worker completion. A completion for anything but the current target
    /// is stale: a newer request is already queued behind it and the state
    /// stays busy until that one reports back.
    pub fn mode_switched(&mut self, requested: &str, reached: &str) {
        if requested != self.state.target {
            debug!(
                "{} stale completion for {} while heading for {}",
                NAME, requested, self.state.target
            );
            return;
        }

        if requested != reached {
            warn!("{} ⚠️ wanted {}, hardware settled on {}", NAME, requested, reached);
        }
        self.state.internal = reached.to_string();
        // target and external must agree whenever we are not busy
        let external = canonical_external(reached, &self.config.fallback_external_name);
        self.publish_target(&external);
        self.publish_external(&external);
        self.state.user_for_mode = self.session.user;
    }

    /// Device lock or user changes may have just made data export legal.
    /// Only a charging-ish mode is ever upgraded; a mode the user actively
    /// picked stays put.
    pub fn rethink_charging_fallback(&mut self) {
        if self.cable != CableState::PcConnected {
            return;
        }
        if self.state.internal != MODE_UNDEFINED && self.state.internal != MODE_CHARGING_FALLBACK {
            return;
        }
        if !self.session.data_export_allowed() {
            return;
        }
        info!("{} 🔓 data export now permitted, rethinking", NAME);
        let mode = self.run_selector();
        self.set_usb_mode(&mode);
    }

    pub fn handle_request(&mut self, request: BridgeRequest) {
        debug!("{} inbound request: {:?}", NAME, request);
        match request {
            BridgeRequest::ModeRequest { mode, uid } => {
                let verdict =
                    check_mode_request(&self.config, &self.modes.read().unwrap(), &mode, uid);
                match verdict {
                    Ok(()) => self.set_usb_mode(&mode),
                    Err(e) => warn!("{} ⛔ {}", NAME, e),
                }
            }
            BridgeRequest::SetModeSetting { mode, uid } => {
                // `ask` is always a legal preference, it exposes nothing
                let verdict = if mode == MODE_ASK {
                    Ok(())
                } else {
                    check_mode_request(&self.config, &self.modes.read().unwrap(), &mode, uid)
                };
                match verdict {
                    Ok(()) => {
                        self.config.set_mode_for_user(self.session.user, &mode);
                        self.config.save(self.config_file.clone());
                        if self.cable == CableState::PcConnected {
                            let mode = self.run_selector();
                            self.set_usb_mode(&mode);
                        }
                    }
                    Err(e) => warn!("{} ⛔ {}", NAME, e),
                }
            }
            BridgeRequest::UserChanging => {
                self.session.user_changing = true;
            }
            BridgeRequest::UserChanged { user } => {
                self.session.user = user;
                self.session.user_changing = false;
                self.rethink_charging_fallback();
            }
            BridgeRequest::LockChanged { unlocked } => {
                self.session.unlocked = unlocked;
                self.rethink_charging_fallback();
            }
            BridgeRequest::ActingDeadChanged { acting_dead } => {
                self.session.acting_dead = acting_dead;
                self.rethink_charging_fallback();
            }
            BridgeRequest::ReloadConfig => {
                let fresh = ModeList::load(&self.config.mode_dir);
                *self.modes.write().unwrap() = fresh;
                self.publish_mode_lists();
            }
        }
    }
}
