//! `log` backend for the injected library.
//!
//! Records leave the process through one of two channels:
//!
//! 1. **Descriptor:** when `CLOAK_LOG_FD` holds a file-descriptor number,
//!    each record is written straight to it.  The fd stays open for the
//!    process lifetime.
//! 2. **Log file:** when only `CLOAK_LOG` is set, each record is appended to
//!    the named file (open + write + close per record).
//!
//! With neither set, records are dropped.  Output goes through raw `write`,
//! never through stdio, so logging cannot feed back into the `fgets` shim.

use std::ffi::CString;
use std::sync::OnceLock;

use libc::{c_int, c_void};
use log::{LevelFilter, Log, Metadata, Record};

pub const LOG_FD_ENV: &str = "CLOAK_LOG_FD";
pub const LOG_PATH_ENV: &str = "CLOAK_LOG";
pub const LOG_LEVEL_ENV: &str = "CLOAK_LOG_LEVEL";

#[derive(Debug)]
enum Sink {
    Fd(c_int),
    File(CString),
    Discard,
}

#[derive(Debug)]
pub struct CloakLogger {
    sink: Sink,
    level: LevelFilter,
}

impl CloakLogger {
    fn from_env() -> Self {
        let level = std::env::var(LOG_LEVEL_ENV)
            .ok()
            .and_then(|level| level.parse().ok())
            .unwrap_or(LevelFilter::Info);

        let fd = std::env::var(LOG_FD_ENV)
            .ok()
            .and_then(|fd| fd.parse::<c_int>().ok())
            .filter(|fd| *fd >= 0);
        let sink = match fd {
            Some(fd) => Sink::Fd(fd),
            None => match std::env::var(LOG_PATH_ENV).ok().and_then(|p| CString::new(p).ok()) {
                Some(path) => Sink::File(path),
                None => Sink::Discard,
            },
        };
        CloakLogger { sink, level }
    }

    pub fn level(&self) -> LevelFilter {
        self.level
    }
}

fn get_tid() -> i64 {
    unsafe { libc::syscall(libc::SYS_gettid) as i64 }
}

fn write_to_fd(fd: c_int, buf: &[u8]) {
    unsafe {
        libc::write(fd, buf.as_ptr() as *const c_void, buf.len());
    }
}

fn format_record(record: &Record<'_>) -> String {
    format!(
        "{}\t{}\t{}\t{}\t{}\n",
        record.level(),
        record.target(),
        unsafe { libc::getpid() },
        get_tid(),
        record.args()
    )
}

impl Log for CloakLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level && !matches!(self.sink, Sink::Discard)
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format_record(record);
        match &self.sink {
            Sink::Fd(fd) => write_to_fd(*fd, line.as_bytes()),
            Sink::File(path) => {
                let fd = unsafe {
                    libc::open(
                        path.as_ptr(),
                        libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND | libc::O_CLOEXEC,
                        0o644,
                    )
                };
                if fd < 0 {
                    return;
                }
                write_to_fd(fd, line.as_bytes());
                unsafe {
                    libc::close(fd);
                }
            }
            Sink::Discard => {}
        }
    }

    fn flush(&self) {}
}

static LOGGER: OnceLock<CloakLogger> = OnceLock::new();

/// Install the logger.  Returns `false` if a logger was already installed.
pub fn init() -> bool {
    let logger = LOGGER.get_or_init(CloakLogger::from_env);
    match log::set_logger(logger) {
        Ok(()) => {
            log::set_max_level(logger.level());
            true
        }
        Err(_) => false,
    }
}
