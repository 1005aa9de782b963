use std::fs::{File, OpenOptions};
use std::io::{BufWriter, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, info, warn};

use super::mail::{Attachment, MailMessage, Mailer};
use super::pcapng::{udp_packet, PcapngWriter, LINKTYPE_ETHERNET};
use crate::config::{validate_naming, CaptureHandlerConfig, Rotation};
use crate::framing::Frame;
use crate::{Error, Result};

const CONTENT_TYPE: &str = "application/vnd.tcpdump.pcap";

/// Numbered alternatives tried when a capture file name is taken.
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Records a sample of raw telegrams into a pcapng file and mails it.
///
/// Every `samplerate`-th telegram is written, wrapped in a UDP datagram on the port
/// Wireshark decodes as SML.
pub struct CaptureReportHandler {
    identifier: String,
    config: CaptureHandlerConfig,
    mailer: Arc<dyn Mailer>,
    state: Mutex<CaptureState>,
}

struct CaptureFile {
    path: PathBuf,
    writer: PcapngWriter<BufWriter<File>>,
    interface: u32,
}

struct CaptureState {
    file: Option<CaptureFile>,
    counter: u32,
    packets: u64,
}

impl CaptureReportHandler {
    /// Create the handler and its first capture file.
    ///
    /// # Errors
    /// [Error::Config] for an unusable naming template or sample rate, [Error::Io] if
    /// the capture file cannot be created.
    pub fn new(
        identifier: &str,
        config: CaptureHandlerConfig,
        mailer: Arc<dyn Mailer>,
    ) -> Result<Self> {
        if config.samplerate == 0 {
            return Err(Error::Config("samplerate must be at least 1".to_string()));
        }
        validate_naming(&config.naming).map_err(Error::Config)?;
        let file = open(&config, identifier, Utc::now())?;
        Ok(CaptureReportHandler {
            identifier: identifier.to_string(),
            config,
            mailer,
            state: Mutex::new(CaptureState {
                file: Some(file),
                counter: 0,
                packets: 0,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, CaptureState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count a telegram and record it if it is due.
    ///
    /// # Errors
    /// [Error::Io] if writing the capture fails.
    pub fn log(&self, timestamp: DateTime<Utc>, frame: &Frame) -> Result<()> {
        let mut state = self.state();
        state.counter += 1;
        if state.counter < self.config.samplerate {
            return Ok(());
        }
        state.counter = 0;
        let Some(file) = state.file.as_mut() else {
            debug!(identifier = %self.identifier, "capture closed; dropping telegram");
            return Ok(());
        };
        file.writer
            .packet(file.interface, &timestamp, &udp_packet(frame.as_bytes()))?;
        state.packets += 1;
        Ok(())
    }

    /// Path of the current capture file, `None` once closed.
    #[must_use]
    pub fn path(&self) -> Option<PathBuf> {
        self.state().file.as_ref().map(|f| f.path.clone())
    }

    /// Telegrams recorded since the handler was created.
    #[must_use]
    pub fn packets(&self) -> u64 {
        self.state().packets
    }

    /// Mail the current capture file.
    ///
    /// With [Rotation::PerDelivery] the next capture file is opened before the mail
    /// goes out, so telegrams arriving during the send land in the new file. The
    /// mailed file stays on disk either way.
    ///
    /// # Errors
    /// If the capture cannot be read, the next file cannot be opened or the mail
    /// cannot be delivered.
    pub fn deliver(&self) -> Result<bool> {
        let (path, data) = {
            let mut state = self.state();
            let Some(file) = state.file.as_mut() else {
                debug!(identifier = %self.identifier, "capture closed; nothing to deliver");
                return Ok(false);
            };
            file.writer.flush()?;
            let delivered = (file.path.clone(), std::fs::read(&file.path)?);
            if self.config.rotation == Rotation::PerDelivery {
                let next = open(&self.config, &self.identifier, Utc::now())?;
                info!(identifier = %self.identifier, path = %next.path.display(), "rotated capture");
                state.file = Some(next);
                state.counter = 0;
            }
            delivered
        };

        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let message = MailMessage::new(&self.config.mail, &self.identifier, "---".to_string())
            .with_attachment(Attachment {
                filename,
                content_type: CONTENT_TYPE.to_string(),
                data,
            });
        if let Err(err) = self.mailer.send(&message) {
            warn!(identifier = %self.identifier, path = %path.display(), %err, "capture not mailed");
            return Err(err);
        }
        Ok(true)
    }

    /// Flush and release the capture file. Later calls do nothing.
    ///
    /// # Errors
    /// [Error::Io] if the final flush fails.
    pub fn close(&self) -> Result<()> {
        if let Some(mut file) = self.state().file.take() {
            debug!(path = %file.path.display(), "closing capture");
            file.writer.flush()?;
        }
        Ok(())
    }
}

impl Drop for CaptureReportHandler {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(identifier = %self.identifier, %err, "failed to close capture");
        }
    }
}

/// Capture file path for `identifier` created at `now`.
///
/// `%N` in the template is replaced by the identifier with runs of non-word
/// characters turned into `_`, the rest is a strftime template.
///
/// # Errors
/// [Error::Config] if the template is not a valid strftime template.
pub fn capture_path(
    location: &Path,
    naming: &str,
    identifier: &str,
    now: DateTime<Utc>,
) -> Result<PathBuf> {
    validate_naming(naming).map_err(Error::Config)?;
    let non_word = Regex::new(r"\W+").map_err(|err| Error::Runtime(err.to_string()))?;
    let template = naming.replace("%N", &non_word.replace_all(identifier, "_"));
    Ok(location.join(now.format(&template).to_string()))
}

/// Create `path`, or the first free `stem-N.ext` next to it.
fn create_new(path: PathBuf) -> Result<(PathBuf, File)> {
    let mut candidate = path.clone();
    for n in 1..=MAX_NAME_ATTEMPTS {
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(file) => return Ok((candidate, file)),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                candidate = numbered(&path, n);
            }
            Err(err) => return Err(err.into()),
        }
    }
    Err(Error::Runtime(format!(
        "no free capture file name for {}",
        path.display()
    )))
}

fn numbered(path: &Path, n: u32) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}-{n}.{}", ext.to_string_lossy()),
        None => format!("{stem}-{n}"),
    };
    path.with_file_name(name)
}

fn open(config: &CaptureHandlerConfig, identifier: &str, now: DateTime<Utc>) -> Result<CaptureFile> {
    let (path, file) = create_new(capture_path(&config.location, &config.naming, identifier, now)?)?;
    let mut writer = PcapngWriter::new(BufWriter::new(file));
    writer.section_header()?;
    let interface = writer.interface(LINKTYPE_ETHERNET, identifier)?;
    writer.interface_statistics(interface, &now)?;
    writer.flush()?;
    info!(identifier, path = %path.display(), "opened capture");
    Ok(CaptureFile {
        path,
        writer,
        interface,
    })
}
