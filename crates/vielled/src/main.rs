use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use vielleconf::Settings;
use vielled::alsa::{AlsaMixer, PortEnumerator, SysfsPortEnumerator};
use vielled::controller::{MidiController, SynthController, SystemController};
use vielled::dispatch::Dispatcher;
use vielled::engine::{NullEngine, StringEngine};
use vielled::input::manager::InputManager;
use vielled::input::mdev::MdevInput;
use vielled::input::{calibration, sources_from_config};
use vielled::server::AppContext;
use vielled::signals::Signals;
use vielled::state::{PowerState, State, StateHandle};
use vielled::synth::{NullSynth, Synth};
use vielled::ui::{Display, FbDisplay, MemoryDisplay, Menu};
use vielled::util::PeriodicTimer;
use vielled::{engine, server, VERSION};
use viellestore::Store;

#[derive(Parser)]
#[command(name = "vielled", version, about = "Vielle control-plane firmware")]
struct Args {
    /// Configuration file
    #[arg(long, default_value = "/etc/vielle.toml")]
    config: PathBuf,

    /// Log all MIDI traffic through the synthesizer
    #[arg(long)]
    dump_midi: bool,

    /// Enable synthesizer debug output
    #[arg(long)]
    debug_fs: bool,

    /// Verbose logging
    #[arg(long)]
    debug: bool,

    /// Abort with a backtrace on fatal errors instead of a message
    #[arg(long)]
    traceback: bool,
}

fn main() {
    let args = Args::parse();
    if let Err(e) = start(&args) {
        if args.traceback {
            panic!("fatal: {:?}", e);
        }
        eprintln!("{:#}", e);
        std::process::exit(2);
    }
}

fn init_logging(settings: &Settings, debug: bool) {
    let directives = if debug {
        "debug".to_string()
    } else {
        settings.logging.filter_directives()
    };
    let filter = EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match settings.logging.log_method.as_str() {
        "file" => {
            match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&settings.logging.log_file)
            {
                Ok(file) => {
                    builder.with_writer(Arc::new(file)).with_ansi(false).init();
                    return;
                }
                Err(e) => {
                    eprintln!("unable to open log file: {}, logging to console", e);
                }
            }
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("warn")),
                )
                .init();
        }
        method => {
            // the syslog transport is not configured here; console is
            // the fallback for anything but "file"
            if method == "syslog" {
                eprintln!("log_method = syslog is not supported, logging to console");
            }
            builder.init();
        }
    }
}

fn start(args: &Args) -> anyhow::Result<()> {
    let settings = Settings::load(&args.config)
        .with_context(|| format!("unable to load config {:?}", args.config))?;
    init_logging(&settings, args.debug);
    settings.create_dirs().context("unable to create data dirs")?;

    let signals = Signals::new();

    // state tree
    let power = PowerState::new(
        settings.system.power_state_ac.clone(),
        settings.system.power_state_usb.clone(),
        settings.system.battery_voltage.clone(),
    );
    let state = StateHandle::new(
        signals.clone(),
        State::new(settings.core.sound_dir.clone(), power),
    );

    // external collaborators; the native bindings register themselves
    // here on the device image
    let engine: Arc<dyn StringEngine> = Arc::new(NullEngine);
    let synth: Arc<dyn Synth> = Arc::new(NullSynth);
    if args.dump_midi || args.debug_fs {
        warn!("synthesizer debug flags are handled by the native synth binding");
    }

    // event queue, menu and input plumbing
    let (queue_tx, queue_rx) = crossbeam_channel::unbounded();

    let display: Box<dyn Display> = match FbDisplay::open(
        128,
        32,
        &settings.system.display_device,
        settings.system.display_mmap,
    ) {
        Ok(display) => Box::new(display),
        Err(e) => {
            warn!("unable to open display device: {}, using memory display", e);
            Box::new(MemoryDisplay::new(128, 32))
        }
    };

    let store = Arc::new(Store::open(settings.core.data_dir.join("vielle.db"))?);
    let menu = Menu::new(
        display,
        state.clone(),
        Arc::clone(&store),
        queue_tx.clone(),
        signals.clone(),
    );
    menu.message("Starting...", 0, false, false);

    let input_manager = Arc::new(InputManager::start(queue_tx.clone()));

    // controllers
    let synth_ctrl = SynthController::new(Arc::clone(&engine), Arc::clone(&synth), state.clone());
    synth_ctrl.start_listening(&signals);

    let system_ctrl = SystemController::new(
        state.clone(),
        Arc::new(AlsaMixer::new(&settings.system.alsa_mixer)),
        settings.system.backlight_control.clone(),
        [
            settings.system.led_brightness_1.clone(),
            settings.system.led_brightness_2.clone(),
            settings.system.led_brightness_3.clone(),
        ],
        settings.system.udc_config.clone(),
    );
    system_ctrl.start_listening(&signals);
    for led in 1..=3 {
        system_ctrl.set_string_led(led, false);
    }
    system_ctrl.update_udc_configuration();

    let midi_ctrl = MidiController::new(
        state.clone(),
        Arc::clone(&engine),
        Arc::clone(&input_manager),
        settings.find_config_file("midi.json"),
    );
    midi_ctrl.start_listening(&signals);

    // restore key calibration and mapping ranges
    let keys = calibration::load_keys(&store);
    if let Err(e) = calibration::commit_keys(engine.as_ref(), &keys) {
        error!("unable to commit key calibration: {}", e);
    }
    for info in engine::MAPPINGS {
        if let Ok(Some(ranges)) = store.load_config(&format!("mapping:{}", info.id)) {
            match serde_json::from_value::<Vec<engine::MappingRange>>(ranges) {
                Ok(ranges) => {
                    if let Err(e) = engine.set_mapping_ranges(info.id, &ranges) {
                        error!("unable to restore mapping {}: {}", info.id, e);
                    }
                }
                Err(e) => warn!("unreadable mapping blob {}: {}", info.id, e),
            }
        }
    }

    menu.message("Loading preset...", 0, false, false);

    // seed global settings, then restore the persisted configuration
    state.apply(|s, ch| s.clear(ch));
    let _ = state.set_by_path("ui.brightness", &serde_json::json!(80));
    let _ = state.set_by_path("pitchbend_range", &serde_json::json!(100));
    if let Ok(Some(misc)) = store.load_config("misc") {
        state.apply(|s, ch| s.from_misc_dict(&misc, false, ch));
    }
    if let Some(first) = store.first_preset()? {
        let _lock = state.lock(None, false);
        if let Err(e) = state.load_preset(&store, first.id) {
            error!("unable to load initial preset: {}", e);
        }
    }

    // enumerate MIDI ports present at boot
    let ports = Arc::new(SysfsPortEnumerator::default());
    state.update_midi_ports(ports.ports(), &store);

    // physical input sources from the input map
    let input_map = settings
        .find_config_file(&settings.core.input_config)
        .with_context(|| format!("input map \"{}\" not found", settings.core.input_config))?;
    let raw = std::fs::read_to_string(&input_map)?;
    let config: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("unable to parse input map {:?}", input_map))?;
    for source in sources_from_config(&config)? {
        input_manager.register(source);
    }
    input_manager.register(Box::new(MdevInput::new("/tmp/vielle-mdev", "mdev hotplug")));

    // web plane on its own runtime thread
    let ctx = Arc::new(AppContext {
        state: state.clone(),
        store: Arc::clone(&store),
        signals: signals.clone(),
        settings: settings.clone(),
        engine: Arc::clone(&engine),
        menu: Arc::clone(&menu),
        version: VERSION.to_string(),
    });
    let shutdown_tx = queue_tx.clone();
    std::thread::Builder::new()
        .name("vielle-web".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Runtime::new() {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!("unable to start web runtime: {}", e);
                    return;
                }
            };
            // SIGINT drains into a clean dispatcher shutdown
            runtime.spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    let _ = shutdown_tx.send(vielled::events::Event::Shutdown);
                }
            });
            if let Err(e) = runtime.block_on(server::serve(ctx)) {
                error!("web server failed: {}", e);
            }
        })
        .context("unable to spawn web thread")?;

    // periodic timers: power poll and menu idle sweep
    let power_state = state.clone();
    let _power_timer = PeriodicTimer::start(Duration::from_secs(3), move || {
        power_state.update_power();
    });
    let idle_menu = Arc::clone(&menu);
    let _idle_timer = PeriodicTimer::start(Duration::from_secs(1), move || {
        idle_menu.check_idle();
    });

    menu.goto_named("home");

    let poweroff: Arc<dyn Fn() + Send + Sync> = Arc::new(|| {
        if let Err(e) = Command::new("/sbin/poweroff").status() {
            error!("unable to invoke poweroff: {}", e);
        }
    });
    let dispatcher = Dispatcher::new(queue_rx, state, menu, store, ports, poweroff);
    dispatcher.run();
    Ok(())
}
