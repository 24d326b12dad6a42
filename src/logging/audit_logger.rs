use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::model::Severity;

const CHANNEL_BUFFER_SIZE: usize = 1000;

#[derive(Debug, Clone, PartialEq)]
pub enum AuditEvent {
    CommandSucceeded {
        timestamp: DateTime<Utc>,
        command_id: i64,
        bot_id: String,
        pair: String,
        command: String,
        message: String,
    },
    CommandFailed {
        timestamp: DateTime<Utc>,
        command_id: i64,
        bot_id: String,
        pair: String,
        command: String,
        severity: Severity,
        message: String,
    },
    StopLossUpdated {
        timestamp: DateTime<Utc>,
        bot_id: String,
        pair: String,
        previous: f64,
        stop_loss: f64,
        pnl_percent: f64,
    },
}

impl AuditEvent {
    fn to_csv_row(&self) -> Vec<String> {
        match self {
            AuditEvent::CommandSucceeded { timestamp, command_id, bot_id, pair, command, message } => {
                vec![
                    timestamp.to_rfc3339(),
                    "COMMAND_SUCCEEDED".to_string(),
                    bot_id.clone(),
                    pair.clone(),
                    command_id.to_string(),
                    command.clone(),
                    String::new(),
                    message.clone(),
                    String::new(),
                ]
            }
            AuditEvent::CommandFailed {
                timestamp,
                command_id,
                bot_id,
                pair,
                command,
                severity,
                message,
            } => {
                vec![
                    timestamp.to_rfc3339(),
                    "COMMAND_FAILED".to_string(),
                    bot_id.clone(),
                    pair.clone(),
                    command_id.to_string(),
                    command.clone(),
                    severity.as_str().to_string(),
                    message.clone(),
                    String::new(),
                ]
            }
            AuditEvent::StopLossUpdated { timestamp, bot_id, pair, previous, stop_loss, pnl_percent } => {
                vec![
                    timestamp.to_rfc3339(),
                    "STOP_LOSS_UPDATED".to_string(),
                    bot_id.clone(),
                    pair.clone(),
                    String::new(),
                    String::new(),
                    String::new(),
                    format!("{} -> {}", previous, stop_loss),
                    format!("{:.2}", pnl_percent),
                ]
            }
        }
    }
}

const CSV_HEADER: &[&str] = &[
    "timestamp", "event", "bot_id", "pair", "command_id", "command", "severity", "message",
    "pnl_percent",
];

/// Appends audit events to a daily CSV file from a background task.
///
/// A disabled logger drops every event.
#[derive(Clone, Debug)]
pub struct AuditLogger {
    sender: Option<mpsc::Sender<AuditEvent>>,
}

/// Handle of the writer task. Awaiting it after every logger clone has been
/// dropped guarantees the queued events reached the disk.
#[derive(Debug)]
pub struct AuditWriter {
    handle: Option<JoinHandle<()>>,
}

impl AuditWriter {
    pub async fn finish(self) {
        if let Some(handle) = self.handle {
            if let Err(e) = handle.await {
                error!("Audit writer task failed: {}", e);
            }
        }
    }
}

impl AuditLogger {
    pub fn new(log_dir: &str) -> (Self, AuditWriter) {
        let (sender, receiver) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let audit_dir = PathBuf::from(log_dir).join("audit");
        let handle = tokio::spawn(writer_task(audit_dir, receiver));
        (
            Self {
                sender: Some(sender),
            },
            AuditWriter {
                handle: Some(handle),
            },
        )
    }

    pub fn disabled() -> (Self, AuditWriter) {
        (Self { sender: None }, AuditWriter { handle: None })
    }

    pub fn from_config(enabled: bool, log_dir: &str) -> (Self, AuditWriter) {
        if enabled {
            Self::new(log_dir)
        } else {
            Self::disabled()
        }
    }

    pub fn log(&self, event: AuditEvent) {
        let Some(sender) = &self.sender else {
            return;
        };
        if let Err(e) = sender.try_send(event) {
            warn!("Audit logger buffer full, dropping event: {}", e);
        }
    }
}

fn csv_file_path(dir: &Path, date: NaiveDate) -> PathBuf {
    dir.join(format!("audit-{}.csv", date.format("%Y-%m-%d")))
}

fn ensure_csv_with_header(path: &Path) -> io::Result<()> {
    match fs::OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => {
            let mut wtr = csv::Writer::from_writer(file);
            wtr.write_record(CSV_HEADER)?;
            wtr.flush()?;
        }
        Err(ref e) if e.kind() == io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(e),
    }
    Ok(())
}

fn write_csv_row(audit_dir: &Path, row: &[String]) {
    let today = Utc::now().date_naive();
    let file_path = csv_file_path(audit_dir, today);

    if let Err(e) = ensure_csv_with_header(&file_path) {
        error!("Failed to create CSV header: {}", e);
        return;
    }

    let file = match fs::OpenOptions::new().append(true).open(&file_path) {
        Ok(f) => f,
        Err(e) => {
            error!("Failed to open audit log file: {}", e);
            return;
        }
    };

    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);

    if let Err(e) = wtr.write_record(row) {
        error!("Failed to write audit event: {}", e);
    }
    if let Err(e) = wtr.flush() {
        error!("Failed to flush audit log: {}", e);
    }
}

async fn writer_task(audit_dir: PathBuf, mut receiver: mpsc::Receiver<AuditEvent>) {
    if let Err(e) = fs::create_dir_all(&audit_dir) {
        error!("Failed to create audit log directory: {}", e);
        return;
    }

    info!("AuditLogger started: {}", audit_dir.display());

    while let Some(event) = receiver.recv().await {
        let row = event.to_csv_row();
        let dir = audit_dir.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || {
            write_csv_row(&dir, &row);
        }).await {
            error!("Audit log write task panicked: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn timestamp() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap()
    }

    #[test]
    fn test_command_failed_csv_row() {
        let event = AuditEvent::CommandFailed {
            timestamp: timestamp(),
            command_id: 42,
            bot_id: "7".to_string(),
            pair: "BTCUSDT".to_string(),
            command: "take-profit-long-2".to_string(),
            severity: Severity::Warn,
            message: "P/L is less than specified percent.".to_string(),
        };

        let row = event.to_csv_row();
        assert_eq!(row.len(), CSV_HEADER.len());
        assert_eq!(row[0], "2024-01-15T10:30:00+00:00");
        assert_eq!(row[1], "COMMAND_FAILED");
        assert_eq!(row[4], "42");
        assert_eq!(row[6], "warn");
        assert_eq!(row[7], "P/L is less than specified percent.");
    }

    #[test]
    fn test_stop_loss_updated_csv_row() {
        let event = AuditEvent::StopLossUpdated {
            timestamp: timestamp(),
            bot_id: "7".to_string(),
            pair: "ETHUSDT".to_string(),
            previous: 0.0,
            stop_loss: 103.0,
            pnl_percent: 7.0,
        };

        let row = event.to_csv_row();
        assert_eq!(row[1], "STOP_LOSS_UPDATED");
        assert_eq!(row[7], "0 -> 103");
        assert_eq!(row[8], "7.00");
    }

    #[test]
    fn test_csv_file_path() {
        let dir = PathBuf::from("logs/audit");
        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let path = csv_file_path(&dir, date);
        assert_eq!(path, PathBuf::from("logs/audit/audit-2024-01-15.csv"));
    }

    #[tokio::test]
    async fn test_writer_flushes_on_finish() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().to_str().unwrap().to_string();
        let (logger, writer) = AuditLogger::new(&log_dir);
        logger.log(AuditEvent::CommandSucceeded {
            timestamp: Utc::now(),
            command_id: 1,
            bot_id: "7".to_string(),
            pair: "BTCUSDT".to_string(),
            command: "enter-long".to_string(),
            message: "Position opened successfully.".to_string(),
        });
        drop(logger);
        writer.finish().await;

        let path = csv_file_path(&dir.path().join("audit"), Utc::now().date_naive());
        let contents = fs::read_to_string(path).unwrap();
        assert!(contents.starts_with("timestamp,event"));
        assert!(contents.contains("COMMAND_SUCCEEDED"));
    }
}
