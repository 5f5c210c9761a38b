use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;

/// One pipeline request as it goes into the access log.
#[derive(Debug, Clone, Default)]
pub struct AccessRecord {
    pub client_ip: String,
    pub status: u16,
    pub uri: String,
    pub location_host: String,
    pub cluster: String,
    pub duration: Duration,
    pub request_id: String,
}

impl AccessRecord {
    pub fn line(&self) -> String {
        let fields = [
            normalize_field(&self.client_ip),
            format_access_time(),
            self.status.to_string(),
            normalize_field_replace(&self.uri),
            normalize_field(&self.location_host),
            normalize_field(&self.cluster),
            self.duration.as_millis().to_string(),
            normalize_field(&self.request_id),
        ];
        format!("{}\n", fields.join(" "))
    }
}

/// Access lines go to an hourly rotated file when a path is configured and
/// to stdout while the caller asks for it.
#[derive(Debug)]
pub struct AccessLogger {
    file: Option<Mutex<FileSink>>,
}

#[derive(Debug)]
struct FileSink {
    path: PathBuf,
    file: File,
    stamp: String,
}

impl AccessLogger {
    pub fn new(path: Option<&str>) -> Result<Self> {
        let file = match path.filter(|p| !p.is_empty()) {
            Some(path) => {
                let path = Path::new(path);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("create access log dir {}", parent.display()))?;
                }
                let file = open_append(path)?;
                Some(Mutex::new(FileSink {
                    path: path.to_path_buf(),
                    file,
                    stamp: rotation_stamp(),
                }))
            }
            None => None,
        };
        Ok(Self { file })
    }

    pub fn log(&self, record: &AccessRecord, stdout: bool) {
        if self.file.is_none() && !stdout {
            return;
        }
        let line = record.line();
        if stdout {
            let _ = std::io::stdout().write_all(line.as_bytes());
        }
        if let Some(sink) = &self.file {
            let mut sink = sink.lock().unwrap_or_else(|e| e.into_inner());
            sink.rotate_if_needed();
            if let Err(err) = sink.file.write_all(line.as_bytes()) {
                log::warn!("access log write to {} failed: {err}", sink.path.display());
            }
        }
    }
}

impl FileSink {
    fn rotate_if_needed(&mut self) {
        let stamp = rotation_stamp();
        if stamp == self.stamp {
            return;
        }
        let rotated = PathBuf::from(format!("{}.{}", self.path.display(), self.stamp));
        if let Err(err) = fs::rename(&self.path, &rotated) {
            log::warn!("access log rotation of {} failed: {err}", self.path.display());
        }
        match open_append(&self.path) {
            Ok(file) => {
                self.file = file;
                self.stamp = stamp;
            }
            Err(err) => log::warn!("access log reopen failed: {err:#}"),
        }
    }
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open access log {}", path.display()))
}

fn rotation_stamp() -> String {
    Local::now().format("%Y%m%d%H").to_string()
}

fn normalize_field(s: &str) -> String {
    if s.is_empty() {
        "-".to_string()
    } else {
        s.to_string()
    }
}

fn normalize_field_replace(s: &str) -> String {
    if s.is_empty() {
        "-".to_string()
    } else {
        s.replace(' ', "+")
    }
}

fn format_access_time() -> String {
    Local::now().format("[%d/%b/%Y:%H:%M:%S %z]").to_string()
}
