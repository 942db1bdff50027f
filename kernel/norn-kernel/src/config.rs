//! Boot configuration from the kernel command line.
//!
//! The cmdline is a space-separated list of `key=value` words. Unknown
//! keys are ignored (and logged once the logger is up).

use norn_core::log::LogLevel;

/// Maximum bytes of the init path kept from the cmdline.
const INIT_PATH_CAP: usize = 64;

/// Parsed boot configuration.
#[derive(Debug, Clone)]
pub struct BootConfig {
    /// Maximum log level.
    pub log_level: LogLevel,
    /// Whether to bring up application processors.
    pub smp: bool,
    /// Path of the init program inside the initramfs.
    pub init_path: InitPath,
}

/// Fixed-capacity init path storage (the heap is not up when the cmdline
/// is parsed).
#[derive(Debug, Clone)]
pub struct InitPath {
    buf: [u8; INIT_PATH_CAP],
    len: usize,
}

impl InitPath {
    fn new(path: &str) -> Self {
        let mut buf = [0u8; INIT_PATH_CAP];
        let len = path.len().min(INIT_PATH_CAP);
        buf[..len].copy_from_slice(&path.as_bytes()[..len]);
        Self { buf, len }
    }

    /// The path as a string slice.
    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or("/init")
    }
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            smp: true,
            init_path: InitPath::new("/init"),
        }
    }
}

impl BootConfig {
    /// Parses a command line, falling back to defaults for missing or
    /// malformed entries.
    pub fn parse(cmdline: &str) -> Self {
        let mut cfg = Self::default();
        for word in cmdline.split_ascii_whitespace() {
            let Some((key, value)) = word.split_once('=') else {
                continue;
            };
            match key {
                "loglevel" => {
                    if let Some(level) = LogLevel::from_name(value) {
                        cfg.log_level = level;
                    }
                }
                "smp" => cfg.smp = value != "off",
                "init" => cfg.init_path = InitPath::new(value),
                _ => norn_core::kdebug!("config: ignoring cmdline key {:?}", key),
            }
        }
        cfg
    }
}
