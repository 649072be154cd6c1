#![forbid(unsafe_code)]

//! Classic libpcap capture of the frames crossing the tap.
//!
//! The header builders are pure and return fixed-size byte arrays; [`PcapWriter`] streams them
//! to any [`Write`] and implements [`Capture`] so the bridge can hand it every frame.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tapbridge_tcp::Capture;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{info, warn};

pub const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
pub const PCAP_VERSION_MAJOR: u16 = 2;
pub const PCAP_VERSION_MINOR: u16 = 4;
/// Largest Ethernet frame we ever capture.
pub const DEFAULT_SNAPLEN: u32 = 65535;

const FILE_PREFIX: &str = "tapbridge_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    Raw,
}

impl LinkType {
    fn to_pcap(self) -> u32 {
        match self {
            LinkType::Ethernet => 1,
            // LINKTYPE_RAW: bare IPv4/IPv6 packets.
            LinkType::Raw => 101,
        }
    }
}

/// Global file header, written once at the start of the capture.
pub fn file_header(link_type: LinkType, snaplen: u32) -> [u8; 24] {
    let mut out = [0u8; 24];
    out[0..4].copy_from_slice(&PCAP_MAGIC.to_le_bytes());
    out[4..6].copy_from_slice(&PCAP_VERSION_MAJOR.to_le_bytes());
    out[6..8].copy_from_slice(&PCAP_VERSION_MINOR.to_le_bytes());
    // thiszone and sigfigs stay zero.
    out[16..20].copy_from_slice(&snaplen.to_le_bytes());
    out[20..24].copy_from_slice(&link_type.to_pcap().to_le_bytes());
    out
}

/// Per-record header for a frame of `len` bytes, of which `caplen` are stored.
pub fn record_header(ts: Duration, caplen: u32, len: u32) -> [u8; 16] {
    let secs = u32::try_from(ts.as_secs()).unwrap_or(u32::MAX);
    let mut out = [0u8; 16];
    out[0..4].copy_from_slice(&secs.to_le_bytes());
    out[4..8].copy_from_slice(&ts.subsec_micros().to_le_bytes());
    out[8..12].copy_from_slice(&caplen.to_le_bytes());
    out[12..16].copy_from_slice(&len.to_le_bytes());
    out
}

/// Name of the capture file for tap connection `index`, started at `started`.
pub fn capture_file_name(started: OffsetDateTime, index: u32) -> String {
    let stamp = started
        .to_offset(time::UtcOffset::UTC)
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second]Z"
        ))
        .unwrap_or_else(|_| started.unix_timestamp().to_string());
    format!("{FILE_PREFIX}{stamp}_{index}.pcap")
}

/// Where to write the capture: `path` itself, or a timestamped file inside it when it is a
/// directory.
pub fn capture_path(path: &Path, index: u32) -> PathBuf {
    if path.is_dir() {
        path.join(capture_file_name(OffsetDateTime::now_utc(), index))
    } else {
        path.to_path_buf()
    }
}

/// Streams records to `W`. After the first write error the writer goes quiet; capture is a
/// diagnostic and must not disturb the data path.
#[derive(Debug)]
pub struct PcapWriter<W: Write> {
    inner: W,
    snaplen: u32,
    records: u64,
    failed: bool,
}

impl PcapWriter<File> {
    /// Open (or append to) a capture file and write the file header.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o644)
            .open(path)?;
        info!(path = %path.display(), "saving packet capture");
        Self::new(file, LinkType::Ethernet, DEFAULT_SNAPLEN)
    }
}

impl<W: Write> PcapWriter<W> {
    pub fn new(mut inner: W, link_type: LinkType, snaplen: u32) -> io::Result<Self> {
        inner.write_all(&file_header(link_type, snaplen))?;
        Ok(Self {
            inner,
            snaplen,
            records: 0,
            failed: false,
        })
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Append one frame with an explicit timestamp, truncated to the snapshot length.
    pub fn record_at(&mut self, frame: &[u8], ts: Duration) -> io::Result<()> {
        if self.failed {
            return Ok(());
        }
        let len = u32::try_from(frame.len()).unwrap_or(u32::MAX);
        let caplen = len.min(self.snaplen);
        let res = self
            .inner
            .write_all(&record_header(ts, caplen, len))
            .and_then(|()| self.inner.write_all(&frame[..caplen as usize]));
        match res {
            Ok(()) => {
                self.records += 1;
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "packet capture failed, disabling");
                self.failed = true;
                Err(err)
            }
        }
    }
}

impl<W: Write> Capture for PcapWriter<W> {
    fn record(&mut self, frame: &[u8]) -> io::Result<()> {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        self.record_at(frame, ts)
    }
}
