use std::io::{stdout, Write};

use anyhow::Result;
use serde::Serialize;
use smtrace::config::{Config, HandlerConfig, ResolvedHandler};
use smtrace::supervisor::port_settings;

#[derive(Debug, Clone)]
pub enum Format {
    Json,
    Text,
}

impl clap::ValueEnum for Format {
    fn value_variants<'a>() -> &'a [Self] {
        &[Self::Json, Self::Text]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        match self {
            Self::Json => Some(clap::builder::PossibleValue::new("json")),
            Self::Text => Some(clap::builder::PossibleValue::new("text")),
        }
    }
}

#[derive(Debug, Serialize)]
struct MeterSummary {
    device: String,
    identifier: String,
    port: String,
    /// Problem with the serial settings, if any.
    serial_error: Option<String>,
    report: String,
    handlers: Vec<ResolvedHandler>,
}

fn summarize(config: &Config) -> Result<Vec<MeterSummary>> {
    config
        .meters
        .iter()
        .map(|(device, meter)| {
            Ok(MeterSummary {
                device: device.clone(),
                identifier: meter.report_identifier(device),
                port: meter.serial.port.clone(),
                serial_error: port_settings(&meter.serial).err().map(|e| e.to_string()),
                report: meter.report.clone(),
                handlers: config.handlers_for(&meter.report)?,
            })
        })
        .collect()
}

fn kind(config: &HandlerConfig) -> &'static str {
    match config {
        HandlerConfig::Text(_) => "text",
        HandlerConfig::Capture(_) => "capture",
    }
}

fn write_text<W: Write>(mut out: W, meters: &[MeterSummary]) -> Result<()> {
    for meter in meters {
        writeln!(out, "meter {} ({})", meter.device, meter.identifier)?;
        match &meter.serial_error {
            Some(err) => writeln!(out, "  port:   {} [{err}]", meter.port)?,
            None => writeln!(out, "  port:   {}", meter.port)?,
        }
        writeln!(out, "  report: {}", meter.report)?;
        for handler in &meter.handlers {
            writeln!(
                out,
                "    {:<12} {:<8} {}",
                handler.name,
                kind(&handler.config),
                handler.cron.join(", ")
            )?;
        }
    }
    Ok(())
}

pub fn check(config: &Config, format: &Format) -> Result<()> {
    let meters = summarize(config)?;
    match format {
        Format::Json => {
            serde_json::to_writer_pretty(stdout(), &meters)?;
            println!();
        }
        Format::Text => write_text(stdout(), &meters)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
meters:
  basement:
    serial: { port: /dev/ttyUSB0, parity: mark }
    note: heat pump
    report: daily
reporters:
  daily:
    cron: ["0 6 * * *"]
    handlers: [values]
handlers:
  values:
    kind: text
    mail:
      server: smtp.example.com
      security: starttls
      auth: [meter, s3cr3t-pa55]
      from: meter@example.com
      to: me@example.com
"#;

    #[test]
    fn text_summary() {
        let config = Config::from_yaml(CONFIG).unwrap();
        let mut out = Vec::new();
        write_text(&mut out, &summarize(&config).unwrap()).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("meter basement (basement / heat pump)\n"));
        assert!(text.contains("unsupported parity"));
        assert!(text.contains("values       text     0 6 * * *"));
    }

    #[test]
    fn json_summary() {
        let config = Config::from_yaml(CONFIG).unwrap();
        let value = serde_json::to_value(summarize(&config).unwrap()).unwrap();
        assert_eq!(value[0]["device"], "basement");
        assert_eq!(value[0]["handlers"][0]["config"]["kind"], "text");
    }

    #[test]
    fn json_summary_omits_credentials() {
        let config = Config::from_yaml(CONFIG).unwrap();
        let json = serde_json::to_string(&summarize(&config).unwrap()).unwrap();

        assert!(json.contains("smtp.example.com"));
        assert!(!json.contains("s3cr3t-pa55"));
        assert!(!json.contains("auth"));
    }
}
