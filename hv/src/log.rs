//! Hypervisor logging subsystem
//!
//! Structured logging filtered by (type, level) pairs so that one noisy
//! subsystem can be turned up without drowning the console. Output goes
//! through a pluggable sink (the byte-channel console on a running
//! system, a capture buffer in tests).

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};
use spin::Mutex;

/// Log levels, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Always = 0,
    Error = 1,
    Warn = 2,
    Normal = 3,
    Debug = 4,
    Verbose = 5,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Always => "ALWAYS",
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Normal => "NORMAL",
            LogLevel::Debug => "DEBUG",
            LogLevel::Verbose => "VERBOSE",
        }
    }
}

/// Subsystem tags; each has its own runtime threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum LogType {
    Misc = 0,
    Mmu = 1,
    Irq = 2,
    Partition = 3,
    ByteChan = 4,
    Doorbell = 5,
    Errorq = 6,
    Pm = 7,
    DevTree = 8,
    Emu = 9,
    Pamu = 10,
}

const LOGTYPE_COUNT: usize = 11;

/// Per-type thresholds; messages above the threshold are dropped.
static THRESHOLDS: [AtomicU8; LOGTYPE_COUNT] = [const { AtomicU8::new(LogLevel::Normal as u8) }; LOGTYPE_COUNT];

/// Console sink; None discards (early boot, or a test that doesn't care).
static SINK: Mutex<Option<fn(&str)>> = Mutex::new(None);

pub fn set_sink(sink: fn(&str)) {
    *SINK.lock() = Some(sink);
}

pub fn set_threshold(ty: LogType, level: LogLevel) {
    THRESHOLDS[ty as usize].store(level as u8, Ordering::Relaxed);
}

pub fn threshold(ty: LogType) -> LogLevel {
    match THRESHOLDS[ty as usize].load(Ordering::Relaxed) {
        0 => LogLevel::Always,
        1 => LogLevel::Error,
        2 => LogLevel::Warn,
        3 => LogLevel::Normal,
        4 => LogLevel::Debug,
        _ => LogLevel::Verbose,
    }
}

#[inline]
pub fn enabled(ty: LogType, level: LogLevel) -> bool {
    level as u8 <= THRESHOLDS[ty as usize].load(Ordering::Relaxed)
}

#[doc(hidden)]
pub fn _log(ty: LogType, level: LogLevel, args: fmt::Arguments) {
    if !enabled(ty, level) {
        return;
    }

    use alloc::string::String;
    use fmt::Write;

    let mut line = String::new();
    let _ = write!(line, "HV[{}]: {}\n", level.as_str(), args);

    if let Some(sink) = *SINK.lock() {
        sink(&line);
    }
}

/// Log a message tagged with a subsystem type and level.
#[macro_export]
macro_rules! printlog {
    ($ty:expr, $level:expr, $($arg:tt)*) => {
        $crate::log::_log($ty, $level, format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_threshold_filters_debug() {
        assert!(enabled(LogType::Misc, LogLevel::Normal));
        assert!(enabled(LogType::Misc, LogLevel::Error));
        assert!(!enabled(LogType::Misc, LogLevel::Debug));
    }

    #[test]
    fn test_threshold_is_per_type() {
        set_threshold(LogType::Mmu, LogLevel::Verbose);
        assert!(enabled(LogType::Mmu, LogLevel::Verbose));
        assert!(!enabled(LogType::Irq, LogLevel::Verbose));
        set_threshold(LogType::Mmu, LogLevel::Normal);
    }
}
