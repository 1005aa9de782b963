//! Minimal pcapng writer.
//!
//! References:
//! * draft-ietf-opsawg-pcapng, PCAP Next Generation Dump File Format
use std::io::Write;

use chrono::{DateTime, Utc};

use crate::Result;

const SECTION_HEADER: u32 = 0x0A0D_0D0A;
const INTERFACE_DESCRIPTION: u32 = 0x0000_0001;
const INTERFACE_STATISTICS: u32 = 0x0000_0005;
const ENHANCED_PACKET: u32 = 0x0000_0006;
const BYTE_ORDER_MAGIC: u32 = 0x1A2B_3C4D;

const OPT_END: u16 = 0;
const IF_NAME: u16 = 2;
const IF_TSRESOL: u16 = 9;
const ISB_STARTTIME: u16 = 2;

/// Ethernet link type.
pub const LINKTYPE_ETHERNET: u16 = 1;

/// UDP port Wireshark dissects as SML.
pub const SML_UDP_PORT: u16 = 7259;

/// Writes pcapng blocks in little-endian byte order with nanosecond timestamps.
pub struct PcapngWriter<W: Write> {
    inner: W,
    interfaces: u32,
}

impl<W: Write> PcapngWriter<W> {
    pub fn new(inner: W) -> Self {
        PcapngWriter {
            inner,
            interfaces: 0,
        }
    }

    /// Start a new section of unspecified length.
    ///
    /// # Errors
    /// On write failure.
    pub fn section_header(&mut self) -> Result<()> {
        let mut body = Vec::with_capacity(16);
        body.extend(BYTE_ORDER_MAGIC.to_le_bytes());
        body.extend(1u16.to_le_bytes());
        body.extend(0u16.to_le_bytes());
        body.extend((-1i64).to_le_bytes());
        self.interfaces = 0;
        self.block(SECTION_HEADER, &body)
    }

    /// Describe a new interface and return its id.
    ///
    /// # Errors
    /// On write failure.
    pub fn interface(&mut self, link_type: u16, name: &str) -> Result<u32> {
        let mut body = Vec::with_capacity(32 + name.len());
        body.extend(link_type.to_le_bytes());
        body.extend(0u16.to_le_bytes());
        // no snap length limit
        body.extend(0u32.to_le_bytes());
        option(&mut body, IF_NAME, name.as_bytes());
        option(&mut body, IF_TSRESOL, &[9]);
        option(&mut body, OPT_END, &[]);
        self.block(INTERFACE_DESCRIPTION, &body)?;
        let id = self.interfaces;
        self.interfaces += 1;
        Ok(id)
    }

    /// Interface statistics carrying only the capture start time.
    ///
    /// # Errors
    /// On write failure.
    pub fn interface_statistics(&mut self, interface: u32, start: &DateTime<Utc>) -> Result<()> {
        let ts = timestamp(start);
        let mut body = Vec::with_capacity(32);
        body.extend(interface.to_le_bytes());
        body.extend(ts);
        option(&mut body, ISB_STARTTIME, &ts);
        option(&mut body, OPT_END, &[]);
        self.block(INTERFACE_STATISTICS, &body)
    }

    /// Append `data` as an enhanced packet.
    ///
    /// # Errors
    /// On write failure.
    pub fn packet(&mut self, interface: u32, ts: &DateTime<Utc>, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len()).unwrap_or(u32::MAX);
        let mut body = Vec::with_capacity(20 + data.len() + 3);
        body.extend(interface.to_le_bytes());
        body.extend(timestamp(ts));
        body.extend(len.to_le_bytes());
        body.extend(len.to_le_bytes());
        body.extend_from_slice(data);
        pad(&mut body);
        self.block(ENHANCED_PACKET, &body)
    }

    /// # Errors
    /// On write failure.
    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    /// The underlying writer, without flushing it.
    pub fn into_inner(self) -> W {
        self.inner
    }

    fn block(&mut self, kind: u32, body: &[u8]) -> Result<()> {
        let total = u32::try_from(body.len() + 12).unwrap_or(u32::MAX);
        self.inner.write_all(&kind.to_le_bytes())?;
        self.inner.write_all(&total.to_le_bytes())?;
        self.inner.write_all(body)?;
        self.inner.write_all(&total.to_le_bytes())?;
        Ok(())
    }
}

/// Nanoseconds since the epoch as high and low 32 bit words.
fn timestamp(ts: &DateTime<Utc>) -> [u8; 8] {
    let nanos = u64::try_from(ts.timestamp_nanos_opt().unwrap_or_default()).unwrap_or_default();
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&((nanos >> 32) as u32).to_le_bytes());
    out[4..].copy_from_slice(&(nanos as u32).to_le_bytes());
    out
}

fn option(body: &mut Vec<u8>, code: u16, value: &[u8]) {
    body.extend(code.to_le_bytes());
    body.extend(u16::try_from(value.len()).unwrap_or(u16::MAX).to_le_bytes());
    body.extend_from_slice(value);
    pad(body);
}

fn pad(body: &mut Vec<u8>) {
    body.resize(body.len().next_multiple_of(4), 0);
}

/// Wrap `payload` in Ethernet, IPv4 and UDP headers between loopback addresses using
/// the SML port on both ends.
#[must_use]
pub fn udp_packet(payload: &[u8]) -> Vec<u8> {
    let udp_len = u16::try_from(8 + payload.len()).unwrap_or(u16::MAX);
    let ip_len = udp_len.saturating_add(20);

    let mut pkt = Vec::with_capacity(14 + 28 + payload.len());
    // ethernet: zero addresses, IPv4 ethertype
    pkt.extend([0u8; 12]);
    pkt.extend(0x0800u16.to_be_bytes());

    let mut ip = [0u8; 20];
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&ip_len.to_be_bytes());
    ip[6] = 0x40; // don't fragment
    ip[8] = 64;
    ip[9] = 17;
    ip[12..16].copy_from_slice(&[127, 0, 0, 1]);
    ip[16..20].copy_from_slice(&[127, 0, 0, 1]);
    let checksum = ipv4_checksum(&ip);
    ip[10..12].copy_from_slice(&checksum.to_be_bytes());
    pkt.extend(ip);

    pkt.extend(SML_UDP_PORT.to_be_bytes());
    pkt.extend(SML_UDP_PORT.to_be_bytes());
    pkt.extend(udp_len.to_be_bytes());
    // checksum is optional for UDP over IPv4
    pkt.extend(0u16.to_be_bytes());
    pkt.extend_from_slice(payload);
    pkt
}

fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = header
        .chunks(2)
        .map(|w| u32::from(u16::from_be_bytes([w[0], w[1]])))
        .sum();
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
