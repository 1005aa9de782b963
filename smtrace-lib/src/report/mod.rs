//! Scheduled reporting.
//!
//! A [ReportScheduler] owns the handlers of one report target. Events logged to the
//! scheduler are routed to the handlers accepting their kind, and every handler is
//! delivered on its own cron schedules from a timer thread. Deliveries run on a
//! thread pool so a slow mail server never holds up a reader.
mod capture;
mod mail;
mod pcapng;
mod schedule;
mod text;

pub use capture::*;
pub use mail::*;
pub use pcapng::*;
pub use schedule::*;
pub use text::*;

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use threadpool::ThreadPool;
use tracing::{debug, error, info, span, warn, Level};

use crate::config::{Config, HandlerConfig};
use crate::framing::Frame;
use crate::measurement::MeasurementBatch;
use crate::{Error, Result};

/// Something a device produced that handlers may be interested in.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Values decoded from one telegram.
    Measurements(MeasurementBatch),
    /// A raw telegram.
    Telegram(Frame),
}

impl Event {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Measurements(_) => EventKind::Measurements,
            Event::Telegram(_) => EventKind::Telegram,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Measurements,
    Telegram,
}

/// The report handlers a target can be configured with.
pub enum ReportHandler {
    Text(TextReportHandler),
    Capture(CaptureReportHandler),
}

impl ReportHandler {
    /// Build the handler described by `config` reporting for `identifier`.
    ///
    /// # Errors
    /// If the handler cannot be created, e.g., the capture file cannot be opened.
    pub fn build(identifier: &str, config: &HandlerConfig, mailers: &MailerFactory) -> Result<Self> {
        let mailer = mailers(config.mail());
        Ok(match config {
            HandlerConfig::Text(cfg) => {
                ReportHandler::Text(TextReportHandler::new(identifier, cfg.clone(), mailer))
            }
            HandlerConfig::Capture(cfg) => {
                ReportHandler::Capture(CaptureReportHandler::new(identifier, cfg.clone(), mailer)?)
            }
        })
    }

    /// Event kinds this handler accepts.
    #[must_use]
    pub fn accepts(&self) -> &'static [EventKind] {
        match self {
            ReportHandler::Text(_) => &[EventKind::Measurements],
            ReportHandler::Capture(_) => &[EventKind::Telegram],
        }
    }

    /// Hand `event`, observed at `timestamp`, to the handler.
    ///
    /// # Errors
    /// [Error::UnexpectedEvent] if the handler does not accept the event kind, or the
    /// handler's own failure.
    pub fn log(&self, timestamp: DateTime<Utc>, event: &Event) -> Result<()> {
        match (self, event) {
            (ReportHandler::Text(h), Event::Measurements(batch)) => {
                h.log(timestamp, batch);
                Ok(())
            }
            (ReportHandler::Capture(h), Event::Telegram(frame)) => h.log(timestamp, frame),
            (_, event) => Err(Error::UnexpectedEvent { got: event.kind() }),
        }
    }

    /// Produce and send the report. `Ok(false)` if there was nothing to send.
    ///
    /// # Errors
    /// If rendering or delivery fails.
    pub fn deliver(&self) -> Result<bool> {
        match self {
            ReportHandler::Text(h) => h.deliver(),
            ReportHandler::Capture(h) => h.deliver(),
        }
    }
}

/// A handler together with the schedules it is delivered on.
pub struct ScheduledHandler {
    pub name: String,
    pub handler: ReportHandler,
    pub schedules: Vec<CronSchedule>,
}

struct Job {
    name: String,
    handler: Arc<ReportHandler>,
    schedule: CronSchedule,
}

/// Routes events to the handlers of one report target and delivers them on their
/// cron schedules.
pub struct ReportScheduler {
    identifier: String,
    handlers: Vec<(String, Arc<ReportHandler>)>,
    pool: ThreadPool,
    stop: Option<Sender<()>>,
    timer: Option<JoinHandle<()>>,
}

impl ReportScheduler {
    const DEFAULT_DELIVERY_THREADS: usize = 2;

    /// Start the timer thread for `handlers`.
    ///
    /// # Errors
    /// [Error::Io] if the timer thread cannot be spawned.
    pub fn new(identifier: &str, handlers: Vec<ScheduledHandler>) -> Result<Self> {
        let pool = threadpool::Builder::new()
            .num_threads(Self::DEFAULT_DELIVERY_THREADS)
            .thread_name(format!("{identifier}-delivery"))
            .build();

        let mut jobs = Vec::default();
        let mut routed = Vec::default();
        for scheduled in handlers {
            let handler = Arc::new(scheduled.handler);
            for schedule in scheduled.schedules {
                jobs.push(Job {
                    name: scheduled.name.clone(),
                    handler: handler.clone(),
                    schedule,
                });
            }
            routed.push((scheduled.name, handler));
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let timer = {
            let pool = pool.clone();
            let identifier = identifier.to_string();
            thread::Builder::new()
                .name(format!("{identifier}-scheduler"))
                .spawn(move || {
                    let _span = span!(Level::DEBUG, "scheduler", identifier = %identifier).entered();
                    // crontab lines are wall-clock times of the host
                    let mut next: Vec<Option<DateTime<Local>>> = {
                        let now = Local::now();
                        jobs.iter().map(|j| j.schedule.next_after(&now)).collect()
                    };
                    loop {
                        let Some(due) = next.iter().flatten().min().copied() else {
                            debug!("no further fire times");
                            // wait for shutdown
                            let _ = stop_rx.recv();
                            break;
                        };
                        let wait = (due - Local::now()).to_std().unwrap_or(Duration::ZERO);
                        match stop_rx.recv_timeout(wait) {
                            Err(RecvTimeoutError::Timeout) => {}
                            _ => break,
                        }
                        let now = Local::now();
                        for (job, next) in jobs.iter().zip(next.iter_mut()) {
                            if next.is_some_and(|t| t <= now) {
                                debug!(handler = %job.name, schedule = %job.schedule, "firing");
                                let handler = job.handler.clone();
                                let name = job.name.clone();
                                pool.execute(move || deliver(&name, &handler));
                                *next = job.schedule.next_after(&now);
                            }
                        }
                    }
                    debug!("scheduler stopped");
                })?
        };

        info!(identifier, handlers = routed.len(), "report scheduler started");
        Ok(ReportScheduler {
            identifier: identifier.to_string(),
            handlers: routed,
            pool,
            stop: Some(stop_tx),
            timer: Some(timer),
        })
    }

    /// Build the handlers of report target `report` from `config`.
    ///
    /// # Errors
    /// If the report target is unknown, a cron expression is invalid or any handler
    /// fails to build.
    pub fn from_config(
        identifier: &str,
        config: &Config,
        report: &str,
        mailers: &MailerFactory,
    ) -> Result<Self> {
        let mut handlers = Vec::default();
        for resolved in config.handlers_for(report)? {
            let schedules = resolved
                .cron
                .iter()
                .map(|expr| CronSchedule::parse(expr))
                .collect::<Result<Vec<_>>>()?;
            let handler = ReportHandler::build(identifier, &resolved.config, mailers)?;
            handlers.push(ScheduledHandler {
                name: resolved.name,
                handler,
                schedules,
            });
        }
        Self::new(identifier, handlers)
    }

    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Handlers by name, in configured order.
    pub fn handlers(&self) -> impl Iterator<Item = (&str, &ReportHandler)> {
        self.handlers.iter().map(|(n, h)| (n.as_str(), h.as_ref()))
    }

    /// Stamp `event` with the current time and pass it to every handler accepting its
    /// kind. Returns the number of handlers that received it.
    pub fn log(&self, event: &Event) -> usize {
        let timestamp = Utc::now();
        let kind = event.kind();
        let mut count = 0;
        for (name, handler) in &self.handlers {
            if !handler.accepts().contains(&kind) {
                continue;
            }
            count += 1;
            if let Err(err) = handler.log(timestamp, event) {
                warn!(identifier = %self.identifier, handler = %name, %err, "handler failed to log event");
            }
        }
        count
    }

    /// Deliver every handler once on the calling thread.
    pub fn trigger_all(&self) {
        for (name, handler) in &self.handlers {
            deliver(name, handler);
        }
    }

    /// Stop the timer and wait for running deliveries. Later calls do nothing.
    pub fn shutdown(&mut self) {
        // dropping the sender wakes the timer
        drop(self.stop.take());
        if let Some(timer) = self.timer.take() {
            if timer.join().is_err() {
                error!(identifier = %self.identifier, "scheduler thread panicked");
            }
            self.pool.join();
            info!(identifier = %self.identifier, "report scheduler stopped");
        }
    }
}

impl Drop for ReportScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn deliver(name: &str, handler: &ReportHandler) {
    match handler.deliver() {
        Ok(true) => info!(handler = name, "report delivered"),
        Ok(false) => debug!(handler = name, "nothing to report"),
        Err(err) => error!(handler = name, %err, "report delivery failed"),
    }
}
