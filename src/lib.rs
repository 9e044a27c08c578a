// Public modules
pub mod actuator;
pub mod audio_link;
pub mod config;
pub mod control_loop;
pub mod decider;
pub mod discovery;
pub mod error;
pub mod freq_table;
pub mod jack_engine;
pub mod load;
pub mod privilege;
pub mod signals;
pub mod sysfs;
pub mod topology;
pub mod unit;

// Re-export constants commonly used
pub mod constants {
    pub const SYSFS_CPU_ROOT: &str = "/sys/devices/system/cpu";
    pub const PROC_ROOT: &str = "/proc";
    pub const PROC_STAT: &str = "/proc/stat";
    pub const DEFAULT_CONFIG_PATH: &str = "/etc/jackfreqd.toml";

    pub const MANUAL_GOVERNOR: &str = "userspace";
    pub const AUDIO_SERVER_NAMES: &[&str] = &["jackd", "jackdbus", "pipewire"];
    pub const DEFAULT_CLIENT_NAME: &str = "jackfreqd";

    pub const DEFAULT_POLL_MS: u64 = 250;
    pub const DEFAULT_STEP_KHZ: u32 = 100_000;
    pub const MAX_TABLE_ENTRIES: usize = 100;
    pub const LEGACY_MHZ_THRESHOLD: u32 = 10_000;

    pub const DEFAULT_DSP_UPPER: f32 = 50.0;
    pub const DEFAULT_DSP_LOWER: f32 = 10.0;
    pub const DEFAULT_CPU_UPPER: f32 = 80.0;
    pub const DEFAULT_CPU_LOWER: f32 = 40.0;

    // three periods of 1024 frames at 48 kHz
    pub const CONNECT_SETTLE_MS: u64 = 64;
    pub const NICE_INCREMENT: i32 = 5;
}
