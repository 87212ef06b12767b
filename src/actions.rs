use nix::sys::signal::{kill as nix_kill, Signal};
use nix::unistd::Pid;
use simplelog::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::Mutex;
use std::thread::sleep;
use std::time::Duration;

use crate::config::AppConfig;

// module name for logging engine
const NAME: &str = "<i><bright-black> actions: </>";

/// The only process spawns the daemon performs. Kept behind a trait so the
/// switch logic can be exercised without touching the system.
pub trait SystemActions: Send + Sync {
    /// mount FunctionFS for the MTP function on /dev/mtp
    fn mount_functionfs(&self) -> bool;
    fn start_mtp_service(&self) -> bool;
    fn stop_mtp_service(&self) -> bool;
    /// quiet modprobe, missing modules are not an error
    fn load_module(&self, name: &str) -> bool;
}

pub struct ShellActions {
    mount_cmd: String,
    service_cmd: String,
    mtp_child: Mutex<Option<Child>>,
}

impl ShellActions {
    pub fn new(config: &AppConfig) -> ShellActions {
        ShellActions {
            mount_cmd: config.mtp_mount_cmd.clone(),
            service_cmd: config.mtp_service_cmd.clone(),
            mtp_child: Mutex::new(None),
        }
    }

    fn run(&self, cmd_line: &str) -> bool {
        match shell_words::split(cmd_line) {
            Ok(tokens) if !tokens.is_empty() => {
                let program = &tokens[0];
                let args = &tokens[1..];
                debug!("{} running: {} {:?}", NAME, program, args);
                match Command::new(program).args(args).status() {
                    Ok(status) if status.success() => true,
                    Ok(status) => {
                        error!("{} {} exited with {}", NAME, program, status);
                        false
                    }
                    Err(e) => {
                        error!("{} failed to run {}: {}", NAME, program, e);
                        false
                    }
                }
            }
            Ok(_) => {
                warn!("{} empty command string, nothing to run.", NAME);
                false
            }
            Err(e) => {
                error!("{} failed to parse command: {:?}", NAME, e);
                false
            }
        }
    }
}

impl SystemActions for ShellActions {
    fn mount_functionfs(&self) -> bool {
        self.run(&self.mount_cmd)
    }

    fn start_mtp_service(&self) -> bool {
        let mut child = self.mtp_child.lock().unwrap();
        if child.is_some() {
            debug!("{} mtp service already running.", NAME);
            return true;
        }
        match shell_words::split(&self.service_cmd) {
            Ok(tokens) if !tokens.is_empty() => {
                let program = &tokens[0];
                let args = &tokens[1..];
                info!("{} starting mtp service: {} {:?}", NAME, program, args);
                match Command::new(program).args(args).spawn() {
                    Ok(process) => {
                        *child = Some(process);
                        true
                    }
                    Err(e) => {
                        error!("{} failed to start {}: {}", NAME, program, e);
                        false
                    }
                }
            }
            Ok(_) => {
                warn!("{} empty mtp service command, nothing to run.", NAME);
                false
            }
            Err(e) => {
                error!("{} failed to parse mtp service command: {:?}", NAME, e);
                false
            }
        }
    }

    fn stop_mtp_service(&self) -> bool {
        let mut child = self.mtp_child.lock().unwrap();
        if let Some(mut proc) = child.take() {
            let pid = proc.id();
            info!("{} sending SIGTERM to mtp service {}", NAME, pid);
            let _ = nix_kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            sleep(Duration::from_millis(500));

            match proc.try_wait() {
                Ok(Some(status)) => {
                    info!("{} mtp service exited with status: {:?}", NAME, status);
                }
                Ok(None) => {
                    info!("{} mtp service still running, sending SIGKILL...", NAME);
                    let _ = nix_kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
                    let _ = proc.wait();
                }
                Err(e) => {
                    error!("{} error checking mtp service status: {:?}", NAME, e);
                }
            }
        } else {
            debug!("{} no mtp service to stop.", NAME);
        }
        true
    }

    fn load_module(&self, name: &str) -> bool {
        let mut res = Command::new("modprobe").arg("-q").arg(name).status();
        if let Err(ref e) = res {
            if e.kind() == std::io::ErrorKind::NotFound {
                res = Command::new("/sbin/modprobe").arg("-q").arg(name).status();
            }
        }
        match res {
            Ok(status) if status.success() => true,
            Ok(_) => {
                debug!("{} modprobe {} reported failure", NAME, name);
                false
            }
            Err(e) => {
                warn!("{} modprobe not runnable: {}", NAME, e);
                false
            }
        }
    }
}

/// Best-effort sysfs wake lock held while a kernel event is being handled,
/// so the device does not suspend mid-decision.
pub struct WakeLock {
    lock_path: PathBuf,
    unlock_path: PathBuf,
}

const WAKELOCK_TAG: &str = "usb_moded_rs";

impl WakeLock {
    pub fn new(dir: &Path) -> WakeLock {
        WakeLock {
            lock_path: dir.join("wake_lock"),
            unlock_path: dir.join("wake_unlock"),
        }
    }

    pub fn acquire(&self) {
        if let Err(e) = fs::write(&self.lock_path, WAKELOCK_TAG) {
            debug!("{} wake lock not taken: {}", NAME, e);
        }
    }

    pub fn release(&self) {
        if let Err(e) = fs::write(&self.unlock_path, WAKELOCK_TAG) {
            debug!("{} wake lock not released: {}", NAME, e);
        }
    }
}

#[cfg(test)]
pub mod test_support {
    use super::SystemActions;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Records escape-hatch calls instead of spawning anything.
    #[derive(Default)]
    pub struct StubActions {
        pub calls: Mutex<Vec<String>>,
        pub fail_mtp: AtomicBool,
    }

    impl StubActions {
        pub fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl SystemActions for StubActions {
        fn mount_functionfs(&self) -> bool {
            self.record("mount_functionfs");
            !self.fail_mtp.load(Ordering::SeqCst)
        }

        fn start_mtp_service(&self) -> bool {
            self.record("start_mtp_service");
            !self.fail_mtp.load(Ordering::SeqCst)
        }

        fn stop_mtp_service(&self) -> bool {
            self.record("stop_mtp_service");
            true
        }

        fn load_module(&self, name: &str) -> bool {
            self.record(&format!("load_module {}", name));
            true
        }
    }
}
