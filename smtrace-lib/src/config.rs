//! YAML configuration document.
//!
//! ```yaml
//! general:
//!   log_level: info
//! meters:
//!   basement:
//!     serial: { port: /dev/ttyUSB0, baudrate: 9600 }
//!     note: heat pump
//!     report: daily
//! reporters:
//!   daily:
//!     cron: ["0 6 * * *"]
//!     handlers: [values]
//! handlers:
//!   values:
//!     kind: text
//!     mail: { server: mail.example.com, from: meter@example.com, to: me@example.com }
//! ```
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::format::{Item, StrftimeItems};
use serde::{Deserialize, Serialize};

use crate::report::CronSchedule;
use crate::{Error, Result};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    /// Devices by identifier.
    #[serde(default)]
    pub meters: BTreeMap<String, DeviceConfig>,
    /// Report targets by name.
    #[serde(default)]
    pub reporters: BTreeMap<String, ReportTargetConfig>,
    /// Handlers by name, referenced from report targets.
    #[serde(default)]
    pub handlers: BTreeMap<String, HandlerConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeneralConfig {
    /// Log filter used when `SMTRACE_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    pub serial: SerialConfig,
    /// Free text appended to the device identifier in reports.
    #[serde(default)]
    pub note: String,
    /// Name of the report target this device feeds.
    pub report: String,
}

impl DeviceConfig {
    /// Identifier used for reports, `"{device} / {note}"`.
    #[must_use]
    pub fn report_identifier(&self, device: &str) -> String {
        if self.note.is_empty() {
            device.to_string()
        } else {
            format!("{device} / {}", self.note)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParityConfig {
    #[default]
    None,
    Even,
    Odd,
    Mark,
    Space,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SerialConfig {
    pub port: String,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    /// Data bits, 5 to 8.
    #[serde(default = "default_bytesize")]
    pub bytesize: u8,
    /// Stop bits: 1, 2, or 15 for one and a half.
    #[serde(default = "default_stopbits")]
    pub stopbits: u8,
    #[serde(default)]
    pub parity: ParityConfig,
    /// Read timeout, bounds how long a stop request may take to be noticed.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_baudrate() -> u32 {
    9600
}

fn default_bytesize() -> u8 {
    8
}

fn default_stopbits() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportTargetConfig {
    /// Cron expressions for handlers that do not declare their own.
    #[serde(default)]
    pub cron: Vec<String>,
    /// Handler names, in order.
    pub handlers: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Security {
    #[default]
    None,
    Starttls,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MailConfig {
    pub server: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub security: Security,
    /// `[user, password]`; login only happens with STARTTLS and exactly two values.
    /// Never serialized.
    #[serde(default, skip_serializing)]
    pub auth: Vec<String>,
    pub from: String,
    /// Recipients, separated by `,` or `;`.
    pub to: String,
    #[serde(default)]
    pub cc: Option<String>,
    #[serde(default)]
    pub subject_prefix: Option<String>,
}

fn default_smtp_port() -> u16 {
    25
}

/// What happens to accumulated measurements after a report was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Accumulation {
    /// Keep a running latest-value table.
    #[default]
    Keep,
    /// Start over after every successful delivery.
    Clear,
}

/// When a capture file is replaced by a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Rotation {
    /// One file for the lifetime of the handler.
    #[default]
    None,
    /// A new file after every successful delivery.
    PerDelivery,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TextHandlerConfig {
    #[serde(default)]
    pub cron: Vec<String>,
    pub mail: MailConfig,
    #[serde(default)]
    pub accumulation: Accumulation,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CaptureHandlerConfig {
    #[serde(default)]
    pub cron: Vec<String>,
    pub mail: MailConfig,
    /// Directory capture files are written to.
    pub location: PathBuf,
    /// strftime template for capture file names, `%N` is the device identifier.
    #[serde(default = "default_naming")]
    pub naming: String,
    /// Record every n-th telegram.
    #[serde(default = "default_samplerate")]
    pub samplerate: u32,
    #[serde(default)]
    pub rotation: Rotation,
}

fn default_naming() -> String {
    "%Y%m%dT%H%M%S_%N.pcapng".to_string()
}

fn default_samplerate() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum HandlerConfig {
    Text(TextHandlerConfig),
    Capture(CaptureHandlerConfig),
}

impl HandlerConfig {
    /// Cron expressions declared by the handler itself.
    #[must_use]
    pub fn cron(&self) -> &[String] {
        match self {
            HandlerConfig::Text(cfg) => &cfg.cron,
            HandlerConfig::Capture(cfg) => &cfg.cron,
        }
    }

    #[must_use]
    pub fn mail(&self) -> &MailConfig {
        match self {
            HandlerConfig::Text(cfg) => &cfg.mail,
            HandlerConfig::Capture(cfg) => &cfg.mail,
        }
    }
}

/// A handler of a report target with its effective cron expressions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedHandler {
    pub name: String,
    pub config: HandlerConfig,
    pub cron: Vec<String>,
}

impl Config {
    /// Read and validate a configuration file.
    ///
    /// # Errors
    /// [Error::Io] if the file cannot be read, otherwise see [Config::from_yaml].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Parse and validate a configuration document.
    ///
    /// # Errors
    /// [Error::Yaml] for malformed documents, [Error::Config] or [Error::Cron] if
    /// validation fails.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check references between sections and every handler parameter that can be
    /// checked without touching devices.
    ///
    /// # Errors
    /// The first problem found.
    pub fn validate(&self) -> Result<()> {
        for (name, meter) in &self.meters {
            if !self.reporters.contains_key(&meter.report) {
                return Err(Error::Config(format!(
                    "meter {name:?} references unknown report {:?}",
                    meter.report
                )));
            }
        }
        for name in self.reporters.keys() {
            for handler in self.handlers_for(name)? {
                if handler.cron.is_empty() {
                    return Err(Error::Config(format!(
                        "handler {:?} of report {name:?} has no cron expression",
                        handler.name
                    )));
                }
                for expr in &handler.cron {
                    CronSchedule::parse(expr)?;
                }
            }
        }
        for (name, handler) in &self.handlers {
            if let HandlerConfig::Capture(cfg) = handler {
                if cfg.samplerate == 0 {
                    return Err(Error::Config(format!(
                        "handler {name:?}: samplerate must be at least 1"
                    )));
                }
                validate_naming(&cfg.naming)
                    .map_err(|reason| Error::Config(format!("handler {name:?}: {reason}")))?;
            }
        }
        Ok(())
    }

    /// The handlers of report target `report` in configured order.
    ///
    /// # Errors
    /// [Error::Config] if the report or one of its handlers does not exist.
    pub fn handlers_for(&self, report: &str) -> Result<Vec<ResolvedHandler>> {
        let target = self
            .reporters
            .get(report)
            .ok_or_else(|| Error::Config(format!("unknown report {report:?}")))?;
        target
            .handlers
            .iter()
            .map(|name| {
                let config = self.handlers.get(name).ok_or_else(|| {
                    Error::Config(format!("report {report:?} references unknown handler {name:?}"))
                })?;
                let cron = if config.cron().is_empty() {
                    target.cron.clone()
                } else {
                    config.cron().to_vec()
                };
                Ok(ResolvedHandler {
                    name: name.clone(),
                    config: config.clone(),
                    cron,
                })
            })
            .collect()
    }
}

/// Make sure a capture file name template only uses known strftime specifiers.
pub(crate) fn validate_naming(naming: &str) -> std::result::Result<(), String> {
    if naming.trim().is_empty() {
        return Err("naming template is empty".to_string());
    }
    let template = naming.replace("%N", "");
    if StrftimeItems::new(&template).any(|item| matches!(item, Item::Error)) {
        return Err(format!("invalid naming template {naming:?}"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
meters:
  basement:
    serial: { port: /dev/ttyUSB0, baudrate: 9600, parity: even, bytesize: 7 }
    note: heat pump
    report: daily
reporters:
  daily:
    cron: ["0 6 * * *"]
    handlers: [values, capture]
handlers:
  values:
    kind: text
    accumulation: clear
    mail:
      server: mail.example.com
      security: starttls
      auth: [user, secret]
      from: meter@example.com
      to: me@example.com
      cc: "a@example.com;b@example.com"
      subject_prefix: "Meter: "
  capture:
    kind: capture
    cron: ["*/5 * * * *", "0 0 12 * * * *"]
    location: /tmp
    naming: "%Y%m%d_%N.pcapng"
    samplerate: 10
    rotation: per_delivery
    mail: { server: localhost, port: 2525, from: meter@example.com, to: me@example.com }
"#;

    #[test]
    fn load_full_document() {
        let config = Config::from_yaml(CONFIG).unwrap();

        assert_eq!(config.general.log_level, "info");
        let meter = &config.meters["basement"];
        assert_eq!(meter.serial.parity, ParityConfig::Even);
        assert_eq!(meter.serial.bytesize, 7);
        assert_eq!(meter.serial.stopbits, 1);
        assert_eq!(meter.serial.timeout_ms, 1000);
        assert_eq!(meter.report_identifier("basement"), "basement / heat pump");

        let handlers = config.handlers_for("daily").unwrap();
        assert_eq!(handlers.len(), 2);
        assert_eq!(handlers[0].name, "values");
        assert_eq!(handlers[0].cron, vec!["0 6 * * *"]);
        let HandlerConfig::Text(text) = &handlers[0].config else {
            panic!("expected text handler");
        };
        assert_eq!(text.accumulation, Accumulation::Clear);
        assert_eq!(text.mail.security, Security::Starttls);
        assert_eq!(text.mail.port, 25);

        assert_eq!(handlers[1].cron.len(), 2);
        let HandlerConfig::Capture(capture) = &handlers[1].config else {
            panic!("expected capture handler");
        };
        assert_eq!(capture.samplerate, 10);
        assert_eq!(capture.rotation, Rotation::PerDelivery);
    }

    #[test]
    fn unknown_report_is_rejected() {
        let text = CONFIG.replace("report: daily", "report: weekly");
        assert!(matches!(Config::from_yaml(&text), Err(Error::Config(_))));
    }

    #[test]
    fn unknown_handler_is_rejected() {
        let text = CONFIG.replace("[values, capture]", "[values, missing]");
        assert!(matches!(Config::from_yaml(&text), Err(Error::Config(_))));
    }

    #[test]
    fn zero_samplerate_is_rejected() {
        let text = CONFIG.replace("samplerate: 10", "samplerate: 0");
        assert!(matches!(Config::from_yaml(&text), Err(Error::Config(_))));
    }

    #[test]
    fn invalid_cron_is_rejected() {
        let text = CONFIG.replace("0 6 * * *", "every morning");
        assert!(matches!(Config::from_yaml(&text), Err(Error::Cron { .. })));
    }

    #[test]
    fn handler_without_any_cron_is_rejected() {
        let text = CONFIG.replace(r#"cron: ["0 6 * * *"]"#, "cron: []");
        assert!(matches!(Config::from_yaml(&text), Err(Error::Config(_))));
    }

    #[test]
    fn malformed_yaml() {
        assert!(matches!(
            Config::from_yaml("meters: [unbalanced"),
            Err(Error::Yaml(_))
        ));
    }

    #[test]
    fn naming_templates() {
        assert!(validate_naming("%Y%m%d_%N.pcapng").is_ok());
        assert!(validate_naming("").is_err());
        assert!(validate_naming("%Q_%N").is_err());
    }
}
