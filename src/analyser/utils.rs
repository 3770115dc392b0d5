//! Capture readers and trace-level helpers.
//!
//! Captures are read either through tshark (pcap/pcapng, via rtshark) or from a tshark
//! field export in CSV form. Both produce the same ordered [PacketRecord]s.
use rtshark::Packet;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use crate::error::CaptureError;
use super::containers::{PacketRecord, TraceScale};

/// Display filter applied when reading captures with tshark.
pub const DISPLAY_FILTER: &str = "tcp";

/// File extensions accepted as traces in a corpus directory.
pub const TRACE_EXTENSIONS: [&str; 4] = ["pcap", "pcapng", "cap", "csv"];

/// Loads a capture file, picking the reader from its extension.
pub fn load_file(path: &Path) -> Result<Vec<PacketRecord>, CaptureError> {
    match extension(path).as_deref() {
        Some("csv") => load_csv(path),
        Some("pcap") | Some("pcapng") | Some("cap") => load_capture(path),
        _ => Err(CaptureError::UnsupportedFormat(path.display().to_string())),
    }
}

/// Loads PCAP/PCAPNG file via rtshark, keeping TCP packets only.
pub fn load_capture(path: &Path) -> Result<Vec<PacketRecord>, CaptureError> {
    log::info!("Loading capture file {}", path.display());
    let filepath = path.display().to_string();

    let builder = rtshark::RTSharkBuilder::builder()
        .input_path(&filepath)
        .display_filter(DISPLAY_FILTER);

    let mut rtshark = builder.spawn().map_err(|source| CaptureError::Spawn {
        path: filepath.clone(),
        source,
    })?;

    let mut records = Vec::new();
    while let Some(packet) = rtshark.read().unwrap_or_else(|e| {
        log::error!("Error parsing TShark output for {filepath}: {e}");
        None
    }) {
        records.push(packet_to_record(&packet));
    }
    rtshark.kill();

    log::info!("Read {} TCP packets from {filepath}", records.len());
    Ok(records)
}

/// Peels the frame, IP and TCP layers of an rtshark [Packet] into a [PacketRecord].
///
/// Fields that are absent or fail to parse are left as `None`.
pub fn packet_to_record(packet: &Packet) -> PacketRecord {
    let field = |layer: &str, name: &str| -> Option<String> {
        packet
            .layer_name(layer)
            .and_then(|l| l.metadata(name))
            .map(|m| m.value().to_string())
    };
    let addr = |name: &str| -> Option<IpAddr> {
        field("ip", &format!("ip.{name}"))
            .or_else(|| field("ipv6", &format!("ipv6.{name}")))
            .and_then(|v| v.parse().ok())
    };

    PacketRecord {
        timestamp: field("frame", "frame.time_relative").and_then(|v| v.parse().ok()),
        src: addr("src"),
        dst: addr("dst"),
        src_port: field("tcp", "tcp.srcport").and_then(|v| v.parse().ok()),
        dst_port: field("tcp", "tcp.dstport").and_then(|v| v.parse().ok()),
        seq: field("tcp", "tcp.seq").and_then(|v| v.parse().ok()),
        ack: field("tcp", "tcp.ack").and_then(|v| v.parse().ok()),
        len: field("tcp", "tcp.len").and_then(|v| v.parse().ok()).unwrap_or(0),
    }
}

/// One row of `tshark -T fields -E header=y -E separator=,` output.
#[derive(Debug, Deserialize)]
struct CsvRow {
    #[serde(rename = "frame.time_relative", default, deserialize_with = "csv::invalid_option")]
    time: Option<f64>,
    #[serde(rename = "ip.src", default, deserialize_with = "csv::invalid_option")]
    src: Option<IpAddr>,
    #[serde(rename = "ip.dst", default, deserialize_with = "csv::invalid_option")]
    dst: Option<IpAddr>,
    #[serde(rename = "tcp.srcport", default, deserialize_with = "csv::invalid_option")]
    src_port: Option<u16>,
    #[serde(rename = "tcp.dstport", default, deserialize_with = "csv::invalid_option")]
    dst_port: Option<u16>,
    #[serde(rename = "tcp.seq", default, deserialize_with = "csv::invalid_option")]
    seq: Option<i64>,
    #[serde(rename = "tcp.ack", default, deserialize_with = "csv::invalid_option")]
    ack: Option<i64>,
    #[serde(rename = "tcp.len", default, deserialize_with = "csv::invalid_option")]
    len: Option<u32>,
}

impl From<CsvRow> for PacketRecord {
    fn from(row: CsvRow) -> Self {
        PacketRecord {
            timestamp: row.time,
            src: row.src,
            dst: row.dst,
            src_port: row.src_port,
            dst_port: row.dst_port,
            seq: row.seq,
            ack: row.ack,
            len: row.len.unwrap_or(0),
        }
    }
}

/// Loads a tshark CSV field export. Rows that cannot be decoded are skipped.
pub fn load_csv(path: &Path) -> Result<Vec<PacketRecord>, CaptureError> {
    log::info!("Loading CSV export {}", path.display());
    let file = std::fs::File::open(path).map_err(|source| CaptureError::Read {
        path: path.display().to_string(),
        source,
    })?;
    read_csv(file).map_err(|source| CaptureError::Csv {
        path: path.display().to_string(),
        source,
    })
}

pub fn read_csv<R: std::io::Read>(reader: R) -> Result<Vec<PacketRecord>, csv::Error> {
    let mut csv = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    // Fail early on an unreadable header rather than skipping every row.
    csv.headers()?;

    let mut records = Vec::new();
    for (line, row) in csv.deserialize::<CsvRow>().enumerate() {
        match row {
            Ok(row) => records.push(PacketRecord::from(row)),
            Err(e) => log::warn!("Skipping CSV row {}: {e}", line + 2),
        }
    }
    Ok(records)
}

/// Parsed trace file name following `cca-version-d1-d2-bandwidth-multiplier`.
#[derive(Clone, Debug, PartialEq)]
pub struct TraceName {
    pub cca: String,
    pub version: String,
    pub scale: TraceScale,
}

impl TraceName {
    /// Parses a file stem such as `cubic-v1-5-50-200-2` (a trailing `-tcp` is ignored).
    ///
    /// The RTT is twice the sum of the two one-way delays (ms), the BDP is
    /// `rtt * bandwidth * multiplier / 8` bytes.
    pub fn parse(stem: &str) -> Option<Self> {
        let stem = stem.strip_suffix("-tcp").unwrap_or(stem);
        let parts: Vec<&str> = stem.split('-').collect();
        if parts.len() < 6 || parts[0].is_empty() {
            return None;
        }
        let numbers: Vec<f64> = parts[2..6]
            .iter()
            .map(|p| p.parse::<u64>().ok().map(|n| n as f64))
            .collect::<Option<Vec<f64>>>()?;

        let rtt = (numbers[0] + numbers[1]) * 2.0 / 1000.0;
        let bdp = rtt * 1000.0 * numbers[2] * numbers[3] / 8.0;
        if rtt <= 0.0 || bdp <= 0.0 {
            return None;
        }
        Some(Self {
            cca: parts[0].to_string(),
            version: parts[1].to_string(),
            scale: TraceScale { rtt, bdp },
        })
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(Self::parse)
    }
}

/// Lists trace files directly inside `dir`, sorted by name.
pub fn trace_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && is_trace_file(path))
        .collect();
    files.sort();
    Ok(files)
}

pub fn is_trace_file(path: &Path) -> bool {
    extension(path).map_or(false, |ext| TRACE_EXTENSIONS.contains(&ext.as_str()))
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}
