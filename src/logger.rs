use bitflags::bitflags;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::fmt::Write as _;

/// Sink installed by the host; receives already-formatted lines.
pub type LogSink = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

static LOGGER: Lazy<LogManager> = Lazy::new(LogManager::new);

pub fn error(message: impl Into<String>) {
    LOGGER.log(LogLevel::Error, message.into());
}

pub fn warn(message: impl Into<String>) {
    LOGGER.log(LogLevel::Warn, message.into());
}

pub fn info(message: impl Into<String>) {
    LOGGER.log(LogLevel::Info, message.into());
}

pub fn debug(message: impl Into<String>) {
    LOGGER.log(LogLevel::Debug, message.into());
}

pub fn breadcrumb(flag: BreadcrumbFlags, message: impl Into<String>) {
    LOGGER.breadcrumb(flag, message.into());
}

pub fn install_sink(sink: Option<LogSink>, level: Option<&str>) {
    LOGGER.install_sink(sink, level);
}

pub fn set_breadcrumb_mask(mask: u32) {
    LOGGER.set_breadcrumb_mask(mask);
}

bitflags! {
    #[derive(Clone, Copy, Debug)]
    pub struct BreadcrumbFlags: u32 {
        const TUN  = 0b0000_0001;
        const CONN = 0b0000_0010;
        const DNS  = 0b0000_0100;
        const DPI  = 0b0000_1000;
        const PCAP = 0b0001_0000;
        const POLL = 0b0010_0000;
        const ALL  = u32::MAX;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    fn from_str(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "error" | "err" => LogLevel::Error,
            "warn" | "warning" => LogLevel::Warn,
            "debug" | "dbg" => LogLevel::Debug,
            _ => LogLevel::Info,
        }
    }
}

struct SinkInner {
    sink: LogSink,
    breadcrumbs: BreadcrumbFlags,
    min_level: LogLevel,
}

struct LogManager {
    sink: Mutex<Option<SinkInner>>,
    prefix: String,
}

impl LogManager {
    fn new() -> Self {
        let pid = std::process::id();
        Self {
            sink: Mutex::new(None),
            prefix: format!("[cap-p{pid}]"),
        }
    }

    fn install_sink(&self, sink: Option<LogSink>, level: Option<&str>) {
        let mut guard = self.sink.lock();
        *guard = sink.map(|sink| SinkInner {
            sink,
            breadcrumbs: BreadcrumbFlags::empty(),
            min_level: level.map(LogLevel::from_str).unwrap_or(LogLevel::Info),
        });
    }

    fn set_breadcrumb_mask(&self, mask: u32) {
        if let Some(inner) = self.sink.lock().as_mut() {
            inner.breadcrumbs = BreadcrumbFlags::from_bits_truncate(mask);
        }
    }

    fn log(&self, level: LogLevel, message: String) {
        if message.is_empty() {
            return;
        }
        self.dispatch(level, BreadcrumbFlags::empty(), message);
    }

    fn breadcrumb(&self, flag: BreadcrumbFlags, message: String) {
        if message.is_empty() || flag.is_empty() {
            return;
        }
        self.dispatch(LogLevel::Debug, flag, message);
    }

    fn dispatch(&self, level: LogLevel, breadcrumbs: BreadcrumbFlags, message: String) {
        let guard = self.sink.lock();
        let Some(inner) = guard.as_ref() else { return };
        if level > inner.min_level && breadcrumbs.is_empty() {
            return;
        }
        if !breadcrumbs.is_empty() && !inner.breadcrumbs.intersects(breadcrumbs) {
            return;
        }

        let mut formatted = String::new();
        if breadcrumbs.is_empty() {
            let _ = write!(formatted, "{} {}", self.prefix, message);
        } else {
            let _ = write!(
                formatted,
                "{} [{}] {}",
                self.prefix,
                label_for(breadcrumbs),
                message
            );
        }
        (inner.sink)(level, &formatted);
    }
}

fn label_for(flags: BreadcrumbFlags) -> &'static str {
    if flags.contains(BreadcrumbFlags::CONN) {
        "CONN"
    } else if flags.contains(BreadcrumbFlags::DNS) {
        "DNS"
    } else if flags.contains(BreadcrumbFlags::DPI) {
        "DPI"
    } else if flags.contains(BreadcrumbFlags::TUN) {
        "TUN"
    } else if flags.contains(BreadcrumbFlags::PCAP) {
        "PCAP"
    } else if flags.contains(BreadcrumbFlags::POLL) {
        "POLL"
    } else {
        "LOG"
    }
}
