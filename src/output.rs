//! Output drivers: format the notification stream for people.
//!
//! Drivers consume a [`NotifierServer`]'s stream and write one fixed
//! five-line record per item. The core guarantees each item appears
//! exactly once and in order; presentation is the driver's concern.
//!
//! Record layout:
//!
//! ```text
//! ID 1f3c... [urgency critical]
//!   Application: editor
//!   Summary: Build finished
//!   Body: 0 errors
//!   Category: -
//! ```
//!
//! The bracketed label is the status category for locally synthesized
//! events, the application-supplied urgency for remote notifications, and
//! `-` when neither is present. The stdout driver additionally prints a
//! `Notifications received: N` summary when the stream ends cleanly.

use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};

use crate::notifier::{NotificationStream, NotifierServer};
use crate::protocol::Message;

/// Well-known urgency levels render by name; anything else numerically.
fn urgency_label(urgency: u8) -> String {
    match urgency {
        0 => "low".to_string(),
        1 => "normal".to_string(),
        2 => "critical".to_string(),
        other => other.to_string(),
    }
}

/// Format one stream item as a five-line record.
pub fn format_record(message: &Message) -> String {
    match message {
        Message::Notify(n) => {
            let label = match (n.category, n.urgency) {
                (Some(category), _) => category.as_str().to_string(),
                (None, Some(urgency)) => format!("urgency {}", urgency_label(urgency)),
                (None, None) => "-".to_string(),
            };
            let category = n
                .category
                .map_or_else(|| "-".to_string(), |c| c.as_str().to_string());
            format!(
                "ID {} [{}]\n  Application: {}\n  Summary: {}\n  Body: {}\n  Category: {}\n",
                n.id, label, n.app_name, n.summary, n.body, category
            )
        }
        other => format!(
            "ID - [-]\n  Application: -\n  Summary: {}\n  Body: -\n  Category: -\n",
            other.kind()
        ),
    }
}

/// Where the formatted records go.
#[derive(Debug, Clone)]
pub enum OutputDriver {
    /// Print records to standard output.
    Stdout,
    /// Append records to a log file.
    File(PathBuf),
}

impl OutputDriver {
    /// Consume the server's stream until it ends, writing one record per
    /// item.
    ///
    /// Iterating the server starts it lazily; a clean end of stream
    /// returns `Ok`. A forced termination never returns here — the
    /// sentinel exits the process from inside the stream.
    ///
    /// # Errors
    ///
    /// Propagates start failures and output I/O errors.
    pub async fn run(&self, server: &Arc<NotifierServer>) -> Result<()> {
        let mut stream = server.iter().await.context("could not start notifier")?;

        match self {
            OutputDriver::Stdout => {
                let mut stdout = std::io::stdout();
                let count = write_records(&mut stream, &mut stdout)
                    .await
                    .context("could not write to stdout")?;
                writeln!(stdout, "Notifications received: {count}")
                    .context("could not write to stdout")?;
            }
            OutputDriver::File(path) => {
                let mut file = open_log(path)?;
                write_records(&mut stream, &mut file)
                    .await
                    .with_context(|| format!("could not write to '{}'", path.display()))?;
            }
        }
        Ok(())
    }
}

/// Write one record per stream item until the stream ends, flushing after
/// each. Returns the number of records written.
async fn write_records(
    stream: &mut NotificationStream,
    out: &mut impl Write,
) -> std::io::Result<usize> {
    let mut count = 0;
    while let Some(message) = stream.next().await {
        out.write_all(format_record(&message).as_bytes())?;
        out.flush()?;
        count += 1;
    }
    Ok(count)
}

fn open_log(path: &Path) -> Result<std::fs::File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("could not open output file '{}'", path.display()))
}
