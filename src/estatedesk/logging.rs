//! Logging setup: console output plus a JSON-per-line disk log.
//!
//! Both sinks pass every message through [`redact`] so secrets that end up in
//! log statements (connection strings, argument dumps) never reach disk or a
//! terminal scrollback. The disk sink rotates by size, keeping a bounded
//! number of backups.

use chrono::Utc;
use lazy_static::lazy_static;
use log::{LevelFilter, Log, Metadata, Record};
use regex::Regex;
use serde_json::json;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::estatedesk::config::Config;

const SENSITIVE_KEYS: [&str; 10] = [
    "password",
    "pwd",
    "secret",
    "apiKey",
    "accessToken",
    "authorization",
    "clientSecret",
    "privateKey",
    "certificate",
    "passphrase",
];

lazy_static! {
    static ref SENSITIVE_RE: Regex = {
        let keys = SENSITIVE_KEYS.join("|");
        Regex::new(&format!(r#"(?i)("(?:{})"\s*:\s*)"([^"]+)""#, keys))
            .expect("sensitive-key regex must compile")
    };
}

/// Replace the value of any sensitive `"key": "value"` pair in `msg`.
pub fn redact(msg: &str) -> String {
    SENSITIVE_RE
        .replace_all(msg, "${1}\"<REDACTED>\"")
        .into_owned()
}

/// Size-rotating disk sink that writes one JSON object per line.
pub struct DiskLog {
    path: PathBuf,
    max_bytes: u64,
    backup_count: u32,
    file: Mutex<Option<File>>,
}

impl DiskLog {
    /// Open (creating parent directories) a disk log at `path`.
    pub fn open(path: &str, max_bytes: u64, backup_count: u32) -> std::io::Result<Self> {
        let path = PathBuf::from(path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            max_bytes,
            backup_count,
            file: Mutex::new(Some(file)),
        })
    }

    fn write_line(&self, line: &str) {
        let Ok(mut guard) = self.file.lock() else {
            return;
        };
        if self.should_rotate(guard.as_ref(), line.len() as u64) {
            *guard = self.rotate();
        }
        if let Some(file) = guard.as_mut() {
            let _ = writeln!(file, "{}", line);
        }
    }

    fn should_rotate(&self, file: Option<&File>, incoming: u64) -> bool {
        file.and_then(|f| f.metadata().ok())
            .map(|m| m.len() + incoming > self.max_bytes)
            .unwrap_or(false)
    }

    // mcp.log -> mcp.log.1 -> mcp.log.2 ... up to backup_count, oldest removed.
    fn rotate(&self) -> Option<File> {
        for i in (1..self.backup_count).rev() {
            let from = backup_path(&self.path, i);
            let to = backup_path(&self.path, i + 1);
            if from.exists() {
                let _ = fs::rename(&from, &to);
            }
        }
        if self.backup_count > 0 {
            let _ = fs::rename(&self.path, backup_path(&self.path, 1));
        } else {
            let _ = fs::remove_file(&self.path);
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .ok()
    }
}

fn backup_path(path: &Path, index: u32) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(format!(".{}", index));
    PathBuf::from(os)
}

impl Log for DiskLog {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let entry = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "level": record.level().to_string(),
            "logger": record.target(),
            "message": redact(&record.args().to_string()),
            "module": record.module_path(),
            "file": record.file(),
            "line": record.line(),
        });
        self.write_line(&entry.to_string());
    }

    fn flush(&self) {
        if let Ok(mut guard) = self.file.lock() {
            if let Some(file) = guard.as_mut() {
                let _ = file.flush();
            }
        }
    }
}

/// Fan-out logger: redacting console formatter plus the disk sink.
struct HostLogger {
    console: env_logger::Logger,
    disk: DiskLog,
    level: LevelFilter,
}

impl Log for HostLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        self.console.log(record);
        self.disk.log(record);
    }

    fn flush(&self) {
        self.console.flush();
        self.disk.flush();
    }
}

/// Install the process-wide logger from the configured path and level.
///
/// Must be called at most once; a second call reports the error from the
/// `log` facade.
pub fn init(config: &Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let level = parse_level(&config.log_level);

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.format(|buf, record: &Record| {
        writeln!(
            buf,
            "{} {} {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            redact(&record.args().to_string())
        )
    });
    let console = builder.build();

    let disk = DiskLog::open(&config.log_path, 10 * 1024 * 1024, 5)?;

    log::set_boxed_logger(Box::new(HostLogger {
        console,
        disk,
        level,
    }))?;
    log::set_max_level(level);
    log::debug!("Logging initialized: console and disk at {}", config.log_path);
    Ok(())
}

fn parse_level(raw: &str) -> LevelFilter {
    match raw.to_uppercase().as_str() {
        "TRACE" => LevelFilter::Trace,
        "DEBUG" => LevelFilter::Debug,
        "WARN" | "WARNING" => LevelFilter::Warn,
        "ERROR" => LevelFilter::Error,
        _ => LevelFilter::Info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_sensitive_pairs_case_insensitively() {
        let msg = r#"{"apikey": "abc123", "name": "Sonu"}"#;
        let out = redact(msg);
        assert!(out.contains(r#""apikey": "<REDACTED>""#));
        assert!(out.contains(r#""name": "Sonu""#));
    }

    #[test]
    fn redacts_nested_and_multiple_keys() {
        let msg = r#"{"outer": {"clientSecret":"s3cr3t"}, "password" : "hunter2"}"#;
        let out = redact(msg);
        assert!(!out.contains("s3cr3t"));
        assert!(!out.contains("hunter2"));
        assert_eq!(out.matches("<REDACTED>").count(), 2);
    }

    #[test]
    fn leaves_plain_messages_untouched() {
        let msg = "Tool `find` finished in 12ms";
        assert_eq!(redact(msg), msg);
    }

    #[test]
    fn disk_log_rotates_by_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp.log");
        let sink = DiskLog::open(path.to_str().unwrap(), 128, 2).unwrap();

        for i in 0..50 {
            sink.write_line(&format!("{{\"n\":{},\"pad\":\"xxxxxxxxxxxxxxxx\"}}", i));
        }

        assert!(path.exists());
        assert!(backup_path(&path, 1).exists());
        let main_len = fs::metadata(&path).unwrap().len();
        assert!(main_len <= 160, "main file grew past the cap: {}", main_len);
    }
}
