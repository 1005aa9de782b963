use std::fmt::Write;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::debug;

use super::mail::{MailMessage, Mailer};
use crate::config::{Accumulation, TextHandlerConfig};
use crate::measurement::{Measurement, MeasurementBatch, MeasurementSink, TIMESTAMP_FORMAT};
use crate::Result;

const MISSING: &str = "--";

/// Mails the accumulated measurements of a device as a text table.
pub struct TextReportHandler {
    identifier: String,
    config: TextHandlerConfig,
    mailer: Arc<dyn Mailer>,
    sink: Mutex<MeasurementSink>,
}

impl TextReportHandler {
    #[must_use]
    pub fn new(identifier: &str, config: TextHandlerConfig, mailer: Arc<dyn Mailer>) -> Self {
        TextReportHandler {
            identifier: identifier.to_string(),
            config,
            mailer,
            sink: Mutex::default(),
        }
    }

    /// Merge a batch into the sink, stamping every key with `timestamp`.
    pub fn log(&self, timestamp: DateTime<Utc>, batch: &MeasurementBatch) {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .merge(timestamp, batch);
    }

    /// Render the current sink contents, `None` if it is empty.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        let sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        if sink.is_empty() {
            return None;
        }
        Some(render(&sink.snapshot()))
    }

    /// Number of keys currently accumulated.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send the report. Returns `false` without sending anything when there is
    /// nothing to report.
    ///
    /// With [Accumulation::Clear] only the values that went out are removed, values
    /// merged while the mail was being sent wait for the next report.
    ///
    /// # Errors
    /// If the mail cannot be delivered, the sink is left untouched in that case.
    pub fn deliver(&self) -> Result<bool> {
        let snapshot = self
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot();
        if snapshot.is_empty() {
            debug!(identifier = %self.identifier, "no measurements to report");
            return Ok(false);
        }
        let message = MailMessage::new(&self.config.mail, &self.identifier, render(&snapshot));
        self.mailer.send(&message)?;

        if self.config.accumulation == Accumulation::Clear {
            self.sink
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove_reported(&snapshot);
        }
        Ok(true)
    }
}

/// One line per measurement: `{ts} | {key} | {unit} | {value}`, keys and units
/// left aligned to the widest of the snapshot.
#[must_use]
pub fn render(snapshot: &[Measurement]) -> String {
    let key_width = snapshot.iter().map(|m| m.key.chars().count()).max().unwrap_or(0);
    let unit_width = snapshot
        .iter()
        .filter_map(|m| m.unit.as_ref())
        .map(|u| u.chars().count())
        .max()
        .unwrap_or(0)
        .max(2);

    let mut text = String::new();
    for m in snapshot {
        let value = m
            .value
            .as_ref()
            .map_or_else(|| MISSING.to_string(), ToString::to_string);
        // writing to a String cannot fail
        let _ = writeln!(
            text,
            "{} | {:<key_width$} | {:<unit_width$} | {}",
            m.observed_at.format(TIMESTAMP_FORMAT),
            m.key,
            m.unit.as_deref().unwrap_or(MISSING),
            value,
        );
    }
    text
}
