use simplelog::*;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};

use crate::actions::SystemActions;
use crate::error::UsbModedError;
use crate::gadget::{write_attr, GadgetBackend, FUNCTION_MTP};
use crate::modes::{
    ModeDescriptor, ModeList, MODE_ASK, MODE_CHARGER, MODE_CHARGING_FALLBACK, MODE_UNDEFINED,
};

// module name for logging engine
const NAME: &str = "<i><bright-black> worker: </>";

/// Sent back to the main loop when one switch attempt is done. `reached`
/// differs from `requested` when the hardware forced a fallback.
#[derive(Debug)]
pub struct Completion {
    pub requested: String,
    pub reached: String,
}

/// Starts the dedicated switch thread. The returned sender is the only way
/// to hand it work; completions travel back over `done_tx`.
pub fn spawn(
    backend: Arc<GadgetBackend>,
    modes: Arc<RwLock<ModeList>>,
    actions: Arc<dyn SystemActions>,
    done_tx: tokio::sync::mpsc::Sender<Completion>,
) -> (Sender<String>, JoinHandle<()>) {
    let (tx, rx) = channel();
    let handle = thread::spawn(move || worker_loop(rx, backend, modes, actions, done_tx));
    (tx, handle)
}

fn worker_loop(
    rx: Receiver<String>,
    backend: Arc<GadgetBackend>,
    modes: Arc<RwLock<ModeList>>,
    actions: Arc<dyn SystemActions>,
    done_tx: tokio::sync::mpsc::Sender<Completion>,
) {
    info!("{} 🧵 switch thread up", NAME);
    let mut previous: Option<ModeDescriptor> = None;

    while let Ok(mut mode) = rx.recv() {
        // collapse the queue to the newest request before touching hardware
        while let Ok(newer) = rx.try_recv() {
            debug!("{} superseding {} with {}", NAME, mode, newer);
            mode = newer;
        }

        let reached = switch_to(&mode, &backend, &modes, &actions, &mut previous);
        if done_tx.blocking_send(Completion { requested: mode, reached }).is_err() {
            // main loop is gone, so are we
            return;
        }
    }
    info!("{} switch thread finished.", NAME);
}

fn switch_to(
    mode: &str,
    backend: &GadgetBackend,
    modes: &RwLock<ModeList>,
    actions: &Arc<dyn SystemActions>,
    previous: &mut Option<ModeDescriptor>,
) -> String {
    info!("{} 🔀 switching to {}", NAME, mode);
    match apply_mode(mode, backend, modes, actions, previous) {
        Ok(()) => mode.to_string(),
        Err(e) => {
            warn!("{} ⚠️ {}, trying charging fallback", NAME, e);
            if mode != MODE_CHARGING_FALLBACK
                && apply_mode(MODE_CHARGING_FALLBACK, backend, modes, actions, previous).is_ok()
            {
                MODE_CHARGING_FALLBACK.to_string()
            } else {
                error!("{} 🪫 charging fallback failed too, detaching gadget", NAME);
                backend.set_udc(false);
                MODE_UNDEFINED.to_string()
            }
        }
    }
}

/// Undo the leftovers of the mode we are leaving. Best effort; a mode we
/// could not fully clean up must not block the next one.
fn apply_reset(actions: &Arc<dyn SystemActions>, previous: &mut Option<ModeDescriptor>) {
    if let Some(prev) = previous.take() {
        if let (Some(path), Some(reset)) = (prev.sysfs_path.as_ref(), prev.sysfs_reset_value.as_ref())
        {
            write_attr(path, reset);
        }
        if let (Some(path), Some(disconnect)) =
            (prev.softconnect_path.as_ref(), prev.softconnect_disconnect.as_ref())
        {
            write_attr(path, disconnect);
        }
        if matches!(prev.module.as_deref(), Some(FUNCTION_MTP) | Some("ffs")) {
            actions.stop_mtp_service();
        }
    }
}

fn apply_mode(
    mode: &str,
    backend: &GadgetBackend,
    modes: &RwLock<ModeList>,
    actions: &Arc<dyn SystemActions>,
    previous: &mut Option<ModeDescriptor>,
) -> Result<(), UsbModedError> {
    match mode {
        // no cable: quiesce the gadget entirely
        MODE_UNDEFINED => {
            if !backend.set_udc(false) {
                return Err(UsbModedError::TransitionFailed(mode.to_string()));
            }
            apply_reset(actions, previous);
            Ok(())
        }
        // `ask` keeps the hardware charging until the dialog is answered
        MODE_CHARGER | MODE_CHARGING_FALLBACK | MODE_ASK => {
            if !backend.set_udc(false) {
                return Err(UsbModedError::TransitionFailed(mode.to_string()));
            }
            apply_reset(actions, previous);
            if !backend.set_charging_mode() {
                return Err(UsbModedError::TransitionFailed(mode.to_string()));
            }
            Ok(())
        }
        name => {
            let descriptor = modes.read().unwrap().get(name).cloned();
            let Some(descriptor) = descriptor else {
                return Err(UsbModedError::TransitionFailed(format!(
                    "no descriptor for {}",
                    name
                )));
            };

            debug!(
                "{} {} flags: network={} appsync={} mass_storage={} nat={} dhcp={}",
                NAME,
                name,
                descriptor.network,
                descriptor.appsync,
                descriptor.mass_storage,
                descriptor.nat,
                descriptor.dhcp_server
            );

            if !backend.set_udc(false) {
                return Err(UsbModedError::TransitionFailed(name.to_string()));
            }
            apply_reset(actions, previous);

            if let Some(module) = descriptor.module.as_deref() {
                // missing modules are fine on kernels with built-in functions
                actions.load_module(module);
            }

            if let (Some(path), Some(value)) =
                (descriptor.sysfs_path.as_ref(), descriptor.sysfs_value.as_ref())
            {
                if !write_attr(path, value) {
                    return Err(UsbModedError::TransitionFailed(name.to_string()));
                }
            }
            for (path, value) in &descriptor.android_extra_sysfs {
                if !write_attr(path, value) {
                    return Err(UsbModedError::TransitionFailed(name.to_string()));
                }
            }

            if let Some(id) = descriptor.id_product.as_deref() {
                if !backend.set_product_id(id) {
                    return Err(UsbModedError::TransitionFailed(name.to_string()));
                }
            }
            if let Some(id) = descriptor.id_vendor_override.as_deref() {
                if !backend.set_vendor_id(id) {
                    return Err(UsbModedError::TransitionFailed(name.to_string()));
                }
            }

            if let Some(function) = descriptor.module.as_deref() {
                if !backend.set_function(function) {
                    return Err(UsbModedError::TransitionFailed(name.to_string()));
                }
            }

            if let (Some(path), Some(connect)) =
                (descriptor.softconnect_path.as_ref(), descriptor.softconnect.as_ref())
            {
                if !write_attr(path, connect) {
                    return Err(UsbModedError::TransitionFailed(name.to_string()));
                }
            }

            if !backend.set_udc(true) {
                return Err(UsbModedError::TransitionFailed(name.to_string()));
            }
            *previous = Some(descriptor);
            Ok(())
        }
    }
}
