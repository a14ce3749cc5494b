use chrono::Local;
use once_cell::sync::Lazy;
use std::sync::{Arc, Mutex};

// Thread-safe log storage shared by every run context in the process
static LOGS: Lazy<Arc<Mutex<Vec<String>>>> = Lazy::new(|| Arc::new(Mutex::new(Vec::new())));

// Current log level
static LOG_LEVEL: Lazy<Arc<Mutex<LogLevel>>> = Lazy::new(|| Arc::new(Mutex::new(LogLevel::Info)));

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Debug => "🔍",
            LogLevel::Info => "ℹ️",
            LogLevel::Warning => "⚠️",
            LogLevel::Error => "❌",
        }
    }
}

// Set the current log level
pub fn set_log_level(level: LogLevel) {
    if let Ok(mut current_level) = LOG_LEVEL.lock() {
        *current_level = level;
    }
}

// Get the current log level
pub fn get_log_level() -> LogLevel {
    if let Ok(level) = LOG_LEVEL.lock() {
        *level
    } else {
        LogLevel::Info
    }
}

// Log a message with timestamp and level
pub fn log(level: LogLevel, message: &str) {
    let timestamp = Local::now().format("%H:%M:%S").to_string();
    let formatted = format!("[{}] {} {}", timestamp, level.prefix(), message);

    if let Ok(mut logs) = LOGS.lock() {
        logs.push(formatted.clone());
    }

    if level >= get_log_level() {
        eprintln!("{}", formatted);
    }
}

// Get all logs captured so far
pub fn get_logs() -> Vec<String> {
    if let Ok(logs) = LOGS.lock() {
        logs.clone()
    } else {
        vec!["Error accessing logs".to_string()]
    }
}

// Clear all logs
pub fn clear_logs() {
    if let Ok(mut logs) = LOGS.lock() {
        logs.clear();
    }
}

// Convenience functions for different log levels
pub fn debug(message: &str) {
    log(LogLevel::Debug, message);
}

pub fn info(message: &str) {
    log(LogLevel::Info, message);
}

pub fn warning(message: &str) {
    log(LogLevel::Warning, message);
}

pub fn error(message: &str) {
    log(LogLevel::Error, message);
}

/// Splits raw output chunks into lines and feeds each complete line through a
/// chain of handlers. A handler returning `false` stops the line from
/// reaching the handlers after it, which lets a workflow-command handler
/// swallow `::command::` lines before they hit the log.
pub struct LineWriter {
    buffer: String,
    handlers: Vec<Box<dyn FnMut(&str) -> bool + Send>>,
}

impl LineWriter {
    pub fn new() -> Self {
        LineWriter {
            buffer: String::new(),
            handlers: Vec::new(),
        }
    }

    pub fn with_handler(mut self, handler: impl FnMut(&str) -> bool + Send + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    pub fn write(&mut self, chunk: &str) {
        self.buffer.push_str(chunk);
        while let Some(idx) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=idx).collect();
            self.dispatch(line.trim_end_matches(['\n', '\r']));
        }
    }

    /// Flush whatever is left in the buffer as a final line.
    pub fn flush(&mut self) {
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.dispatch(line.trim_end_matches(['\n', '\r']));
        }
    }

    fn dispatch(&mut self, line: &str) {
        for handler in &mut self.handlers {
            if !handler(line) {
                break;
            }
        }
    }
}

impl Default for LineWriter {
    fn default() -> Self {
        Self::new()
    }
}
