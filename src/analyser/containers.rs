use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// One TCP packet as handed over by a capture reader.
///
/// Every field but the payload length may be missing; which ones are required depends on
/// whether the tracker treats the record as an acknowledgment or as data.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PacketRecord {
    pub timestamp: Option<f64>,
    pub src: Option<IpAddr>,
    pub dst: Option<IpAddr>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub seq: Option<i64>,
    pub ack: Option<i64>,
    pub len: u32,
}

/// How the tracker classified an acknowledgment record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum AckKind {
    InOrder,
    Duplicate,
    OutOfOrder,
}

/// How the tracker classified a data record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum DataKind {
    InOrder,
    Retransmission,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RecordEvent {
    Ack(AckKind),
    Data(DataKind),
}

impl fmt::Display for RecordEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RecordEvent::Ack(AckKind::InOrder) => write!(f, "Inorder Ack"),
            RecordEvent::Ack(AckKind::Duplicate) => write!(f, "Duplicate Ack"),
            RecordEvent::Ack(AckKind::OutOfOrder) => write!(f, "Out of Order Ack"),
            RecordEvent::Data(DataKind::InOrder) => write!(f, "Inorder Packet"),
            RecordEvent::Data(DataKind::Retransmission) => write!(f, "Retransmitted Packet"),
        }
    }
}

/// Per-connection reconstruction state, keyed by the local port.
#[derive(Clone, Debug, Serialize)]
pub struct FlowState {
    pub port: u16,
    pub remote_addr: Option<IpAddr>,
    pub remote_port: Option<u16>,
    pub max_seq: i64,
    pub max_ack: i64,
    pub last_ack_seen: Option<i64>,
    pub bif_series: Vec<i64>,
    pub time_series: Vec<f64>,
    pub retransmission_times: Vec<f64>,
    pub out_of_order_ack_times: Vec<f64>,
    pub duplicate_ack_times: Vec<f64>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub retransmitted_bytes: u64,
}

impl FlowState {
    pub fn new(port: u16, remote_addr: Option<IpAddr>, remote_port: Option<u16>) -> Self {
        Self {
            port,
            remote_addr,
            remote_port,
            max_seq: 0,
            max_ack: 0,
            last_ack_seen: None,
            bif_series: Vec::new(),
            time_series: Vec::new(),
            retransmission_times: Vec::new(),
            out_of_order_ack_times: Vec::new(),
            duplicate_ack_times: Vec::new(),
            bytes_sent: 0,
            bytes_received: 0,
            retransmitted_bytes: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.bif_series.len()
    }

    /// Flows with fewer than two samples carry no shape and are skipped downstream.
    pub fn is_usable(&self) -> bool {
        self.bif_series.len() >= 2
    }

    /// The BiF series as a curve over the flow's timestamps.
    pub fn curve(&self) -> Curve {
        Curve {
            time: self.time_series.clone(),
            value: self.bif_series.iter().map(|&bif| bif as f64).collect(),
        }
    }

    pub fn summary(&self) -> FlowSummary {
        let start = self.time_series.first().copied().unwrap_or(0.0);
        let end = self.time_series.last().copied().unwrap_or(0.0);
        FlowSummary {
            port: self.port,
            remote_addr: self.remote_addr,
            remote_port: self.remote_port,
            duration: end - start,
            start,
            end,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            samples: self.bif_series.len(),
            retransmissions: self.retransmission_times.len(),
            retransmitted_bytes: self.retransmitted_bytes,
            duplicate_acks: self.duplicate_ack_times.len(),
            out_of_order_acks: self.out_of_order_ack_times.len(),
        }
    }
}

/// Diagnostics row for one flow.
#[derive(Clone, Debug, Serialize)]
pub struct FlowSummary {
    pub port: u16,
    pub remote_addr: Option<IpAddr>,
    pub remote_port: Option<u16>,
    pub duration: f64,
    pub start: f64,
    pub end: f64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub samples: usize,
    pub retransmissions: usize,
    pub retransmitted_bytes: u64,
    pub duplicate_acks: usize,
    pub out_of_order_acks: usize,
}

/// Inclusive index window `[start, end]` into one flow's series.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub start: usize,
    pub end: usize,
}

impl Segment {
    pub fn len(&self) -> usize {
        self.end - self.start + 1
    }
}

/// Ordered (time, value) samples, kept as two parallel vectors.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Curve {
    pub time: Vec<f64>,
    pub value: Vec<f64>,
}

impl Curve {
    pub fn new(time: Vec<f64>, value: Vec<f64>) -> Self {
        Self { time, value }
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn slice(&self, segment: &Segment) -> Curve {
        Curve {
            time: self.time[segment.start..=segment.end].to_vec(),
            value: self.value[segment.start..=segment.end].to_vec(),
        }
    }

    /// `max - min` of the values, 0 for an empty curve.
    pub fn value_range(&self) -> f64 {
        let min = self.value.iter().copied().fold(f64::INFINITY, f64::min);
        let max = self.value.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if self.value.is_empty() {
            0.0
        } else {
            max - min
        }
    }
}

/// Connection scale a trace's curves are normalized by.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceScale {
    /// Round-trip time in seconds
    pub rtt: f64,
    /// Bandwidth-delay product in bytes
    pub bdp: f64,
}

/// Polynomial shape descriptor of one normalized segment.
///
/// Coefficients are highest order first. The constant fallback carries a single coefficient.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub degree: usize,
    pub coefficients: Vec<f64>,
    pub errors: Vec<f64>,
}

impl Fingerprint {
    pub fn constant(value: f64) -> Self {
        Self {
            degree: 1,
            coefficients: vec![value],
            errors: vec![0.0],
        }
    }

    /// Returned for inputs that cannot be fitted at all.
    pub fn invalid() -> Self {
        Self {
            degree: 1,
            coefficients: vec![0.0, 0.0],
            errors: vec![1.0],
        }
    }
}

/// The fingerprint of one feature of one flow, tagged with where it came from.
#[derive(Clone, Debug, Serialize)]
pub struct FeatureFingerprint {
    pub port: u16,
    /// 1-based feature index within the flow
    pub feature: usize,
    pub segment: Segment,
    pub fingerprint: Fingerprint,
}

/// One ranked candidate.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Candidate {
    pub cca: String,
    pub score: f64,
    pub log_density: f64,
}
