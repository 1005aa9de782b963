//! Process-wide ownership of device readers.
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serialport::{DataBits, Parity, SerialPort, StopBits};
use tracing::{debug, error, info, warn};

use crate::config::{Config, DeviceConfig, ParityConfig, SerialConfig};
use crate::framing::Frame;
use crate::measurement::from_entries;
use crate::obis::{ObisLookup, ObisRegistry};
use crate::reader::{DeviceReader, Protocol, ReaderState};
use crate::report::{smtp_mailers, Event, MailerFactory, ReportScheduler};
use crate::sml::{FrameDecoder, SmlDecoder};
use crate::{Error, Result};

/// How often liveness is polled while waiting for readers to finish.
pub const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Map the symbolic serial settings to `serialport` settings.
///
/// # Errors
/// [Error::Config] for settings the port cannot be configured with.
pub fn port_settings(serial: &SerialConfig) -> Result<(DataBits, StopBits, Parity)> {
    let data_bits = match serial.bytesize {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        8 => DataBits::Eight,
        n => return Err(Error::Config(format!("unsupported bytesize {n}"))),
    };
    let stop_bits = match serial.stopbits {
        1 => StopBits::One,
        2 => StopBits::Two,
        n => return Err(Error::Config(format!("unsupported stopbits {n}"))),
    };
    let parity = match serial.parity {
        ParityConfig::None => Parity::None,
        ParityConfig::Even => Parity::Even,
        ParityConfig::Odd => Parity::Odd,
        p @ (ParityConfig::Mark | ParityConfig::Space) => {
            return Err(Error::Config(format!("unsupported parity {p:?}")))
        }
    };
    Ok((data_bits, stop_bits, parity))
}

/// Open the serial port described by `serial`.
///
/// # Errors
/// [Error::Config] for unsupported settings, [Error::Serial] if the port cannot be
/// opened.
pub fn open_serial(serial: &SerialConfig) -> Result<Box<dyn SerialPort>> {
    let (data_bits, stop_bits, parity) = port_settings(serial)?;
    let port = serialport::new(&serial.port, serial.baudrate)
        .data_bits(data_bits)
        .stop_bits(stop_bits)
        .parity(parity)
        .timeout(Duration::from_millis(serial.timeout_ms))
        .open()?;
    Ok(port)
}

/// The [Protocol] of a meter: every telegram is logged raw, decoded and the
/// measurements logged to the device's report scheduler.
pub struct MeterProtocol {
    device: String,
    identifier: String,
    report: String,
    config: Arc<Config>,
    mailers: MailerFactory,
    decoder: Box<dyn FrameDecoder>,
    lookup: Arc<dyn ObisLookup>,
    scheduler: Option<ReportScheduler>,
}

impl MeterProtocol {
    #[must_use]
    pub fn new(
        device: &str,
        meter: &DeviceConfig,
        config: Arc<Config>,
        mailers: MailerFactory,
    ) -> Self {
        MeterProtocol {
            device: device.to_string(),
            identifier: meter.report_identifier(device),
            report: meter.report.clone(),
            config,
            mailers,
            decoder: Box::new(SmlDecoder::new()),
            lookup: Arc::new(ObisRegistry::new()),
            scheduler: None,
        }
    }

    #[must_use]
    pub fn with_decoder(mut self, decoder: Box<dyn FrameDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    #[must_use]
    pub fn with_lookup(mut self, lookup: Arc<dyn ObisLookup>) -> Self {
        self.lookup = lookup;
        self
    }
}

impl Protocol for MeterProtocol {
    fn prepare(&mut self) -> Result<()> {
        self.scheduler = Some(ReportScheduler::from_config(
            &self.identifier,
            &self.config,
            &self.report,
            &self.mailers,
        )?);
        Ok(())
    }

    fn handle_frame(&mut self, frame: Frame) {
        let Some(scheduler) = &self.scheduler else {
            return;
        };
        scheduler.log(&Event::Telegram(frame.clone()));
        match self.decoder.decode(&frame) {
            Ok(entries) => {
                let batch = from_entries(&entries, self.lookup.as_ref());
                if !batch.is_empty() {
                    scheduler.log(&Event::Measurements(batch));
                }
            }
            Err(err) => {
                error!(
                    device = %self.device,
                    %err,
                    frame = hex::encode(frame.as_bytes()),
                    "failed to decode telegram"
                );
            }
        }
    }

    fn disperse(&mut self) {
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.shutdown();
        }
    }

    fn connection_lost(&mut self, error: Option<&Error>) {
        match error {
            Some(err) => warn!(device = %self.device, %err, "connection lost"),
            None => debug!(device = %self.device, "connection closed"),
        }
    }
}

/// Runs one [DeviceReader] per configured meter.
///
/// Devices that fail to start are logged and skipped, the remaining devices run
/// regardless.
#[derive(Debug, Default)]
pub struct Supervisor {
    readers: BTreeMap<String, DeviceReader>,
}

impl Supervisor {
    /// Open the serial ports of all meters and start reading.
    #[must_use]
    pub fn start(config: Arc<Config>) -> Self {
        Self::start_with(config, |_, meter| open_serial(&meter.serial), &smtp_mailers())
    }

    /// Start all meters of `config`, opening their sources with `open`.
    pub fn start_with<R, F>(config: Arc<Config>, mut open: F, mailers: &MailerFactory) -> Self
    where
        R: Read + Send + 'static,
        F: FnMut(&str, &DeviceConfig) -> Result<R>,
    {
        let mut readers = BTreeMap::default();
        for (device, meter) in &config.meters {
            info!(device, "configuring meter");
            let source = match open(device, meter) {
                Ok(source) => source,
                Err(err) => {
                    error!(device, %err, "failed to open meter; skipping");
                    continue;
                }
            };
            let protocol = MeterProtocol::new(device, meter, config.clone(), mailers.clone());
            match DeviceReader::start(device, source, protocol) {
                Ok(reader) => {
                    info!(device, "meter started");
                    readers.insert(device.clone(), reader);
                }
                Err(err) => error!(device, %err, "failed to start reader; skipping"),
            }
        }
        Supervisor { readers }
    }

    /// True while any reader has not finished.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.readers.values().any(DeviceReader::is_alive)
    }

    /// Ask every reader to stop. Does not block.
    pub fn stop(&self) {
        for (device, reader) in &self.readers {
            debug!(device, "stopping meter");
            reader.stop();
        }
    }

    /// Poll [is_alive](Self::is_alive) every [SHUTDOWN_POLL_INTERVAL] until all
    /// readers are done or `grace` has passed. Returns true if all readers finished.
    #[must_use]
    pub fn wait(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        while self.is_alive() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(SHUTDOWN_POLL_INTERVAL);
        }
        true
    }

    /// Wait for all reader threads.
    pub fn join(&mut self) {
        for reader in self.readers.values_mut() {
            reader.join();
        }
    }

    /// Current state of each device reader.
    pub fn readers(&self) -> impl Iterator<Item = (&str, ReaderState)> {
        self.readers.iter().map(|(d, r)| (d.as_str(), r.state()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn serial(bytesize: u8, stopbits: u8, parity: ParityConfig) -> SerialConfig {
        SerialConfig {
            port: "/dev/null".to_string(),
            baudrate: 9600,
            bytesize,
            stopbits,
            parity,
            timeout_ms: 100,
        }
    }

    #[test_case(5, 1, ParityConfig::None, DataBits::Five, StopBits::One, Parity::None)]
    #[test_case(7, 2, ParityConfig::Even, DataBits::Seven, StopBits::Two, Parity::Even)]
    #[test_case(8, 1, ParityConfig::Odd, DataBits::Eight, StopBits::One, Parity::Odd)]
    fn settings(
        bytesize: u8,
        stopbits: u8,
        parity: ParityConfig,
        data_bits: DataBits,
        stop_bits: StopBits,
        expected_parity: Parity,
    ) {
        assert_eq!(
            port_settings(&serial(bytesize, stopbits, parity)).unwrap(),
            (data_bits, stop_bits, expected_parity)
        );
    }

    #[test_case(9, 1, ParityConfig::None; "bytesize")]
    #[test_case(8, 15, ParityConfig::None; "one and a half stop bits")]
    #[test_case(8, 1, ParityConfig::Mark; "mark parity")]
    #[test_case(8, 1, ParityConfig::Space; "space parity")]
    fn unsupported_settings(bytesize: u8, stopbits: u8, parity: ParityConfig) {
        assert!(matches!(
            port_settings(&serial(bytesize, stopbits, parity)),
            Err(Error::Config(_))
        ));
    }
}
