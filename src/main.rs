use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{CommandFactory, Parser};
use nix::unistd::getuid;

use jackfreqd::actuator::Actuator;
use jackfreqd::audio_link::AudioLink;
use jackfreqd::config::{Config, FileConfig, Overrides};
use jackfreqd::constants::NICE_INCREMENT;
use jackfreqd::control_loop::ControlLoop;
use jackfreqd::discovery::ProcessDiscovery;
use jackfreqd::error::{Error, ErrorKind, Result};
use jackfreqd::jack_engine::JackEngine;
use jackfreqd::load::{CpuStatSampler, LoadSensor, LoadSource};
use jackfreqd::privilege::{PrivilegeContext, PrivilegeGate};
use jackfreqd::signals::ControlSignals;
use jackfreqd::sysfs::CpufreqTree;
use jackfreqd::topology::{AffectedCpus, Cpuid, Override, Topology};
use jackfreqd::unit::discover_units;

/// jackfreqd: CPU frequency scaling driven by the JACK DSP load.
///
/// Every poll interval the DSP load of the audio server (and optionally the
/// per-thread CPU utilization) is compared with an upper and a lower threshold.
/// Above the upper one the CPU jumps to its highest speed, below the lower one
/// it steps down one frequency. All CPUs run the userspace governor while the
/// daemon is active and are left at full speed on exit.
#[derive(Debug, Parser)]
#[command(name = "jackfreqd", version)]
struct Opts {
    /// Configuration file. /etc/jackfreqd.toml is read when present.
    #[clap(short = 'f', long)]
    config: Option<PathBuf>,

    /// Increase output verbosity, can be used more than once.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only report errors.
    #[clap(short = 'q', long)]
    quiet: bool,

    /// Number of threads per power-managed core.
    #[clap(short = 'c', long)]
    threads_per_unit: Option<usize>,

    /// Frequency step in kHz. Builds the table from min, max and this step.
    #[clap(short = 's', long)]
    step: Option<u32>,

    /// Polling interval in msecs [default: 250].
    #[clap(short = 'p', long)]
    poll: Option<u64>,

    /// DSP usage upper limit percentage [default: 50].
    #[clap(short = 'u', long)]
    dsp_upper: Option<f32>,

    /// DSP usage lower limit percentage [default: 10].
    #[clap(short = 'l', long)]
    dsp_lower: Option<f32>,

    /// CPU usage upper limit percentage [default: 80].
    #[clap(short = 'U', long)]
    cpu_upper: Option<f32>,

    /// CPU usage lower limit percentage [default: 40].
    #[clap(short = 'L', long)]
    cpu_lower: Option<f32>,

    /// User name or uid to connect to the audio server as.
    #[clap(short = 'j', long)]
    user: Option<String>,

    /// Group name or gid to connect to the audio server as.
    #[clap(short = 'J', long)]
    group: Option<String>,

    /// Reconnect to the audio server after it goes away.
    #[clap(short = 'r', long)]
    reconnect: bool,

    /// Load source driving decisions [default: dsp].
    #[clap(short = 'm', long, value_enum)]
    sensor: Option<LoadSource>,

    /// Client name registered with the audio server [default: jackfreqd].
    #[clap(short = 'n', long)]
    client_name: Option<String>,
}

impl Opts {
    fn overrides(&self) -> Overrides {
        Overrides {
            poll_interval_ms: self.poll,
            step_khz: self.step,
            threads_per_unit: self.threads_per_unit,
            sensor: self.sensor,
            reconnect: self.reconnect,
            client_name: self.client_name.clone(),
            dsp_upper: self.dsp_upper,
            dsp_lower: self.dsp_lower,
            cpu_upper: self.cpu_upper,
            cpu_lower: self.cpu_lower,
            owner_user: self.user.clone(),
            owner_group: self.group.clone(),
        }
    }

    fn log_level(&self) -> simplelog::LevelFilter {
        if self.quiet {
            return simplelog::LevelFilter::Error;
        }
        match self.verbose {
            0 => simplelog::LevelFilter::Info,
            1 => simplelog::LevelFilter::Debug,
            _ => simplelog::LevelFilter::Trace,
        }
    }
}

fn init_logger(level: simplelog::LevelFilter) {
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    if let Err(e) = simplelog::TermLogger::init(
        level,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    ) {
        eprintln!("cannot initialize logging: {e}");
    }
}

fn exit_code(err: &Error) -> ExitCode {
    ExitCode::from(u8::try_from(err.exit_code()).unwrap_or(1))
}

/// Exports the audio server's runtime directory so the client finds its socket.
fn export_runtime_dir(discovery: &ProcessDiscovery, pid: Option<u32>) {
    if std::env::var_os("XDG_RUNTIME_DIR").is_some() {
        return;
    }
    let Some(dir) = pid.and_then(|pid| discovery.xdg_runtime_dir(pid)) else {
        return;
    };
    log::debug!("using XDG_RUNTIME_DIR={dir}");
    // SAFETY: called from main before the signal handler thread or any audio
    // client thread exists.
    unsafe { std::env::set_var("XDG_RUNTIME_DIR", dir) };
}

/// Resolves who the audio client connects as and exports the server's runtime directory.
///
/// Runs before any thread is spawned and before the governors are touched.
fn prepare_owner(config: &Config) -> Result<Option<PrivilegeContext>> {
    if !config.sensor.uses_dsp() {
        return Ok(None);
    }
    let discovery = ProcessDiscovery::default();
    let mut server = None;
    let ctx = PrivilegeContext::resolve(
        config.owner_user.as_deref(),
        config.owner_group.as_deref(),
        || {
            server = discovery.find_audio_server_owner();
            server
        },
    )?;
    let pid = server
        .or_else(|| discovery.find_audio_server_owner())
        .map(|info| info.pid);
    export_runtime_dir(&discovery, pid);
    Ok(ctx)
}

/// Installs the signal handler and opens the audio connection.
fn start_sensor(
    config: &Config,
    owner: Option<PrivilegeContext>,
    signals: &Arc<ControlSignals>,
) -> Result<LoadSensor<JackEngine>> {
    let handler = signals.clone();
    ctrlc::set_handler(move || {
        handler.on_signal(|| {
            eprintln!("forced exit");
            std::process::exit(1);
        })
    })?;

    let link = if config.sensor.uses_dsp() {
        let mut link = AudioLink::new(
            JackEngine::new(&config.client_name),
            PrivilegeGate::for_process(owner),
            config.reconnect,
            signals.clone(),
        );
        if let Err(e) = link.connect() {
            if !config.reconnect {
                return Err(e);
            }
            log::warn!("{e}, retrying every poll interval");
        }
        Some(link)
    } else {
        None
    };
    let stat = config.sensor.uses_cpu().then(CpuStatSampler::default);
    Ok(LoadSensor::new(link, stat))
}

fn run(config: Config, owner: Option<PrivilegeContext>) -> Result<()> {
    // SAFETY: nice(2) only lowers the priority of this process.
    if unsafe { libc::nice(NICE_INCREMENT) } == -1 {
        log::debug!("cannot lower the scheduling priority");
    }

    let tree = CpufreqTree::default();
    let ncpus = tree.count_cpus()?;
    let topology = Topology::detect(
        ncpus,
        &[
            &Override(config.threads_per_unit),
            &AffectedCpus(&tree),
            &Cpuid,
        ],
    );
    let mut units = discover_units(&tree, &topology, config.step_khz)?;

    let signals = Arc::new(ControlSignals::new());
    let sensor = match start_sensor(&config, owner, &signals) {
        Ok(sensor) => sensor,
        Err(e) => {
            Actuator::new().restore_max(&mut units);
            return Err(e);
        }
    };

    let mut control = ControlLoop::new(
        units,
        sensor,
        config.policy(),
        signals,
        config.poll_interval,
    );
    control.synchronize();
    log::info!(
        "jackfreqd running: sensor {:?}, polling every {} ms",
        config.sensor,
        config.poll_interval.as_millis()
    );
    control.run();
    log::info!("jackfreqd exiting");
    Ok(())
}

/// Logs `err`; configuration errors also get the usage text.
fn report(err: &Error) -> ExitCode {
    log::error!("{err}");
    if err.kind() == ErrorKind::Config {
        let _ = Opts::command().print_help();
    }
    exit_code(err)
}

fn main() -> ExitCode {
    let opts = Opts::parse();
    init_logger(opts.log_level());

    let config = match FileConfig::load(opts.config.as_deref())
        .and_then(|file| Config::resolve(file, opts.overrides()))
    {
        Ok(config) => config,
        Err(e) => return report(&e),
    };
    if !getuid().is_root() {
        return report(&Error::NotRoot);
    }
    let owner = match prepare_owner(&config) {
        Ok(owner) => owner,
        Err(e) => return report(&e),
    };

    match run(config, owner) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => report(&e),
    }
}
