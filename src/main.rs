mod actions;
mod bridge;
mod cable;
mod config;
mod controller;
mod error;
mod gadget;
mod modes;
mod selector;
mod worker;

use crate::actions::{ShellActions, SystemActions, WakeLock};
use crate::bridge::{BridgeRequest, LogBridge};
use crate::cable::{
    cable_state_from_props, CableAction, CableEvent, CableMonitor, PowerSupply, PC_DEBOUNCE,
};
use crate::config::AppConfig;
use crate::controller::Controller;
use crate::gadget::GadgetBackend;
use crate::modes::ModeList;
use crate::worker::Completion;
use anyhow::{anyhow, Context};
use clap::Parser;
use humantime::format_duration;
use simplelog::*;

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::runtime::Builder;
use tokio::sync::mpsc;
use tokio::time::sleep_until;

// module name for logging engine
const NAME: &str = "<i><bright-black> main: </>";

/// USB gadget mode supervisor daemon
#[derive(Parser, Debug)]
#[clap(version, long_about = None, about = "🔌 usb-moded-rs, USB gadget mode supervisor")]
struct Args {
    /// Config file path
    #[clap(
        short,
        long,
        value_parser,
        default_value = "/etc/usb-moded-rs/config.toml"
    )]
    config: PathBuf,

    /// Rescue boot: force developer mode regardless of policy
    #[clap(long)]
    rescue: bool,

    /// Diagnostic boot: force the first configured diagnostic mode
    #[clap(long)]
    diag: bool,

    /// Override the ConfigFS gadget root (bring-up on unusual kernels)
    #[clap(long, value_parser)]
    configfs_root: Option<PathBuf>,

    /// Override the Android sysfs gadget root (bring-up on unusual kernels)
    #[clap(long, value_parser)]
    android_root: Option<PathBuf>,
}

fn logging_init(debug: bool, disable_console_debug: bool, log_path: &PathBuf) {
    let conf = ConfigBuilder::new()
        .set_time_format("%F, %H:%M:%S%.3f".to_string())
        .set_write_log_enable_colors(true)
        .build();

    let mut loggers = vec![];

    let requested_level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let console_logger: Box<dyn SharedLogger> = TermLogger::new(
        {
            if disable_console_debug {
                LevelFilter::Info
            } else {
                requested_level
            }
        },
        conf.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    );
    loggers.push(console_logger);

    let mut logfile_error: Option<String> = None;
    let logfile = OpenOptions::new().create(true).append(true).open(log_path);
    match logfile {
        Ok(logfile) => {
            loggers.push(WriteLogger::new(requested_level, conf, logfile));
        }
        Err(e) => {
            logfile_error = Some(format!(
                "Error creating/opening log file: {:?}: {:?}",
                log_path, e
            ));
        }
    }

    CombinedLogger::init(loggers).expect("Cannot initialize logging subsystem");
    if logfile_error.is_some() {
        error!("{} {}", NAME, logfile_error.unwrap());
        warn!("{} Will do console logging only...", NAME);
    }
}

async fn tokio_main(
    config: AppConfig,
    config_file: PathBuf,
    backend: Arc<GadgetBackend>,
    modes: Arc<RwLock<ModeList>>,
    actions: Arc<dyn SystemActions>,
) -> anyhow::Result<()> {
    let power_supply = PowerSupply::discover(
        &config.power_supply_class,
        config.power_supply_path.as_deref(),
    )
    .context("power supply discovery")?;

    let (cable_tx, mut cable_rx) = mpsc::channel::<CableEvent>(16);
    let (done_tx, mut done_rx) = mpsc::channel::<Completion>(16);
    // the bus bridge collaborator clones this sender to feed requests in
    let (_request_tx, mut request_rx) = mpsc::channel::<BridgeRequest>(16);

    let (work_tx, _worker) = worker::spawn(backend, modes.clone(), actions, done_tx);

    // start uevent listener in own thread
    let device_name = power_supply.name.clone();
    std::thread::spawn(move || cable::uevent_listener(device_name, cable_tx));

    let wakelock = WakeLock::new(&config.wakelock_dir);
    let mut monitor = CableMonitor::new();
    let mut controller = Controller::new(
        config,
        config_file,
        modes,
        Box::new(LogBridge),
        work_tx,
    );
    controller.publish_mode_lists();

    // seed cable state so we act before the first hotplug
    match power_supply.read_props() {
        Ok(props) => {
            let proposed = cable_state_from_props(&props, monitor.current());
            if let CableAction::Apply(state) = monitor.observe(proposed) {
                controller.set_cable_state(state);
            }
        }
        Err(e) => warn!("{} initial power supply read failed: {}", NAME, e),
    }

    let mut debounce_deadline: Option<tokio::time::Instant> = None;

    loop {
        tokio::select! {
            event = cable_rx.recv() => match event {
                Some(CableEvent::Properties(props)) => {
                    wakelock.acquire();
                    let proposed = cable_state_from_props(&props, monitor.current());
                    match monitor.observe(proposed) {
                        CableAction::Apply(state) => {
                            debounce_deadline = None;
                            controller.set_cable_state(state);
                        }
                        CableAction::ArmTimer => {
                            debounce_deadline = Some(tokio::time::Instant::now() + PC_DEBOUNCE);
                        }
                        CableAction::None => (),
                    }
                    wakelock.release();
                }
                Some(CableEvent::SourceFailed) | None => {
                    return Err(anyhow!("cable event source lost"));
                }
            },
            Some(done) = done_rx.recv() => {
                controller.mode_switched(&done.requested, &done.reached);
            },
            Some(request) = request_rx.recv() => {
                controller.handle_request(request);
            },
            _ = sleep_until(debounce_deadline.unwrap_or_else(tokio::time::Instant::now)),
                if debounce_deadline.is_some() =>
            {
                debounce_deadline = None;
                if let Some(state) = monitor.timer_fired() {
                    controller.set_cable_state(state);
                }
            },
        }
    }
}

fn main() {
    let started = Instant::now();

    // CLI arguments
    let args = Args::parse();

    // parse config
    let mut config = AppConfig::load(args.config.clone()).unwrap();
    if args.rescue {
        config.rescue = true;
    }
    if args.diag {
        config.diag = true;
    }
    if let Some(ref root) = args.configfs_root {
        config.configfs_root = root.clone();
    }
    if let Some(ref root) = args.android_root {
        config.android_root = root.clone();
    }

    logging_init(config.debug, config.disable_console_debug, &config.logfile);
    info!(
        "🔌 <b><blue>usb-moded-rs</> is starting, version: {}",
        env!("CARGO_PKG_VERSION")
    );

    // check and display config
    if args.config.exists() {
        info!(
            "{} ⚙️ config loaded from file: {}",
            NAME,
            args.config.display()
        );
    } else {
        warn!(
            "{} ⚙️ config file: {} doesn't exist, defaults used",
            NAME,
            args.config.display()
        );
    }
    debug!("{} ⚙️ startup configuration: {:#?}", NAME, config);

    if config.diag && config.diag_modes.is_empty() {
        error!(
            "{} 💥 diagnostic boot configured without diagnostic modes",
            NAME
        );
        std::process::exit(1);
    }

    let actions: Arc<dyn SystemActions> = Arc::new(ShellActions::new(&config));
    let backend = match GadgetBackend::probe(&config, actions.clone()) {
        Ok(backend) => Arc::new(backend),
        Err(e) => {
            error!("{} 💥 gadget backend probe failed: {}", NAME, e);
            std::process::exit(1);
        }
    };
    if !backend.init_values() {
        error!("{} 💥 gadget identity setup failed", NAME);
        std::process::exit(1);
    }

    let modes = Arc::new(RwLock::new(ModeList::load(&config.mode_dir)));

    // build main tokio runtime for the event loop
    let runtime = Builder::new_multi_thread().enable_all().build().unwrap();
    let result = runtime.block_on(tokio_main(config, args.config, backend, modes, actions));

    if let Err(e) = result {
        error!("{} 💥 {:#}", NAME, e);
        info!(
            "🚩 usb-moded-rs terminated, running time: {}",
            format_duration(started.elapsed()).to_string()
        );
        std::process::exit(1);
    }
    info!(
        "🚩 usb-moded-rs terminated, running time: {}",
        format_duration(started.elapsed()).to_string()
    );
}
