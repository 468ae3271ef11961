use anyhow::Result;
use chrono::{DateTime, Local};
use log::{LevelFilter, Record};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;

use studyroom::models::{Message, MessageStatus};

// Logging setup and small helpers for the terminal frontend.

pub struct SimpleLogger {
    log_file: Option<Mutex<File>>,
}

impl SimpleLogger {
    pub fn new(log_file_path: Option<&str>) -> Result<Self> {
        let log_file = match log_file_path {
            Some(path) => Some(Mutex::new(
                OpenOptions::new().create(true).append(true).open(path)?,
            )),
            None => None,
        };

        Ok(SimpleLogger { log_file })
    }
}

impl log::Log for SimpleLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let now: DateTime<Local> = Local::now();
        let log_message = format!(
            "[{}] {} [{}:{}] {}\n",
            now.format("%Y-%m-%d %H:%M:%S"),
            record.level(),
            record.file().unwrap_or("unknown"),
            record.line().unwrap_or(0),
            record.args()
        );

        match &self.log_file {
            Some(file) => {
                let mut file = file.lock().unwrap_or_else(|p| p.into_inner());
                let _ = file.write_all(log_message.as_bytes());
            }
            // Log lines go to stderr so they do not interleave with chat output.
            None => eprint!("{}", log_message),
        }
    }

    fn flush(&self) {
        match &self.log_file {
            Some(file) => {
                let _ = file.lock().unwrap_or_else(|p| p.into_inner()).flush();
            }
            None => {
                let _ = std::io::stderr().flush();
            }
        }
    }
}

/// Read a line of input from stdin, trimming whitespace
pub fn read_line() -> Result<String> {
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

pub fn setup_logging(log_file: Option<&str>, level: LevelFilter) -> Result<()> {
    let logger = SimpleLogger::new(log_file)?;
    log::set_boxed_logger(Box::new(logger)).map(|()| log::set_max_level(level))?;

    log::info!("Logging initialized at level: {}", level);
    log::info!("{} version {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    Ok(())
}

/// One line per message for the terminal.
pub fn format_message(message: &Message, local_user: &str) -> String {
    let who = match &message.sender {
        studyroom::SenderRef::User(user) if user.id != local_user => user.display_name().to_string(),
        studyroom::SenderRef::Id(id) if id != local_user => id.clone(),
        _ => "me".to_string(),
    };
    let marker = match message.status {
        MessageStatus::Sending => " (sending)",
        MessageStatus::Failed => " (failed)",
        MessageStatus::Sent => "",
    };
    let mut line = format!(
        "[{}] {}: {}{}",
        message.created_at.with_timezone(&Local).format("%H:%M"),
        who,
        message.content,
        marker
    );
    for attachment in &message.attachments {
        line.push_str(&format!(" [file: {}]", attachment.original_name));
    }
    line
}
