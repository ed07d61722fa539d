//! File logger for livedebug
//!
//! One file per day under ~/.livedebug/logs/, reopened when the date rolls
//! over. Each line carries the controller endpoint and the debugging
//! session it belongs to, tracked per tokio task (per thread outside a
//! runtime).

use chrono::{Local, NaiveDate};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use tokio::task::Id as TaskId;

use crate::storage;

const FILE_PREFIX: &str = "livedebug-";
const RETENTION_DAYS: i64 = 7;
const SESSION_PREFIX_LEN: usize = 24;

static LOGGER: Mutex<Option<Logger>> = Mutex::new(None);
static TRACE: AtomicBool = AtomicBool::new(false);
static TASK_CONTEXTS: OnceLock<Mutex<HashMap<TaskId, LogContext>>> = OnceLock::new();

thread_local! {
    static THREAD_CONTEXT: RefCell<LogContext> = RefCell::new(LogContext::default());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Error,
    Warn,
    Info,
    Debug,
    Rpc,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Rpc => "RPC",
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
struct LogContext {
    controller: Option<String>,
    session: Option<String>,
}

impl LogContext {
    fn prefix(&self) -> String {
        let mut parts = Vec::new();
        if let Some(controller) = &self.controller {
            parts.push(format!("ctl:{}", controller));
        }
        if let Some(session) = &self.session {
            let short: String = session.chars().take(SESSION_PREFIX_LEN).collect();
            parts.push(format!("ses:{}", short));
        }
        if parts.is_empty() {
            String::new()
        } else {
            format!("[{}] ", parts.join("|"))
        }
    }
}

fn update_context(update: impl FnOnce(&mut LogContext)) {
    if let Some(task) = tokio::task::try_id() {
        let store = TASK_CONTEXTS.get_or_init(|| Mutex::new(HashMap::new()));
        if let Ok(mut contexts) = store.lock() {
            update(contexts.entry(task).or_default());
        }
        return;
    }
    THREAD_CONTEXT.with(|c| update(&mut c.borrow_mut()));
}

fn current_context() -> LogContext {
    if let Some(task) = tokio::task::try_id() {
        return TASK_CONTEXTS
            .get()
            .and_then(|store| store.lock().ok()?.get(&task).cloned())
            .unwrap_or_default();
    }
    THREAD_CONTEXT.with(|c| c.borrow().clone())
}

/// Tag following lines from this task with a session id
pub fn set_session(session: &str) {
    update_context(|ctx| ctx.session = Some(session.to_string()));
}

/// Tag following lines from this task with the controller endpoint
pub fn set_controller(controller: &str) {
    update_context(|ctx| ctx.controller = Some(controller.to_string()));
}

/// Forget this task's context
pub fn clear_context() {
    if let Some(task) = tokio::task::try_id() {
        if let Some(Ok(mut contexts)) = TASK_CONTEXTS.get().map(|s| s.lock()) {
            contexts.remove(&task);
        }
        return;
    }
    THREAD_CONTEXT.with(|c| *c.borrow_mut() = LogContext::default());
}

fn file_for(dir: &Path, date: NaiveDate) -> PathBuf {
    dir.join(format!("{}{}.log", FILE_PREFIX, date.format("%Y-%m-%d")))
}

struct Logger {
    dir: PathBuf,
    date: NaiveDate,
    file: File,
}

impl Logger {
    fn open(dir: PathBuf, date: NaiveDate) -> Option<Self> {
        fs::create_dir_all(&dir).ok()?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_for(&dir, date))
            .ok()?;
        Some(Self { dir, date, file })
    }

    fn path(&self) -> PathBuf {
        file_for(&self.dir, self.date)
    }

    fn write(&mut self, level: Level, message: &str) {
        let now = Local::now();
        if now.date_naive() != self.date {
            if let Some(next) = Logger::open(self.dir.clone(), now.date_naive()) {
                *self = next;
            }
        }
        let line = format!(
            "[{}] [{}] {}{}\n",
            now.format("%Y-%m-%d %H:%M:%S%.3f"),
            level.as_str(),
            current_context().prefix(),
            message
        );
        let _ = self.file.write_all(line.as_bytes());
        let _ = self.file.flush();
    }
}

/// Open today's log file. Later calls only update tracing. Debug lines are
/// written when `trace` is set or LIVEDEBUG_TRACE is in the environment.
pub fn init(trace: bool) {
    set_trace(trace || std::env::var_os("LIVEDEBUG_TRACE").is_some());
    let Ok(dir) = storage::logs_dir() else {
        return;
    };
    if let Ok(mut guard) = LOGGER.lock() {
        if guard.is_none() {
            *guard = Logger::open(dir, Local::now().date_naive());
        }
    }
}

fn write(level: Level, message: &str) {
    if let Ok(mut guard) = LOGGER.lock() {
        if let Some(logger) = guard.as_mut() {
            logger.write(level, message);
        }
    }
}

pub fn info(message: &str) {
    write(Level::Info, message);
}

pub fn error(message: &str) {
    write(Level::Error, message);
}

pub fn warn(message: &str) {
    write(Level::Warn, message);
}

fn set_trace(on: bool) {
    TRACE.store(on, Ordering::Relaxed);
}

/// Only written with tracing on
pub fn debug(message: &str) {
    if TRACE.load(Ordering::Relaxed) {
        write(Level::Debug, message);
    }
}

/// One line per handled controller call
pub fn rpc(procedure: &str, args: &str, outcome: &str) {
    let msg = format!(
        "{} args={} outcome={}",
        procedure,
        truncate(args, 200),
        truncate(outcome, 300)
    );
    write(Level::Rpc, &msg);
}

/// File currently written to, if logging is initialized
pub fn current_log_path() -> Option<PathBuf> {
    let guard = LOGGER.lock().ok()?;
    guard.as_ref().map(Logger::path)
}

/// Delete our log files older than the retention window
pub fn cleanup_old_logs() {
    if let Ok(dir) = storage::logs_dir() {
        remove_stale_logs(&dir, Local::now() - chrono::Duration::days(RETENTION_DAYS));
    }
}

fn remove_stale_logs(dir: &Path, cutoff: chrono::DateTime<Local>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(FILE_PREFIX) {
            continue;
        }
        let modified = entry.metadata().and_then(|m| m.modified());
        if let Ok(modified) = modified {
            if chrono::DateTime::<Local>::from(modified) < cutoff {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

/// Shorten to `max_len` characters for a log line
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() > max_len {
        let head: String = s.chars().take(max_len).collect();
        format!("{}...", head)
    } else {
        s.to_string()
    }
}
