//! Bytes-in-flight reconstruction from the local endpoint's point of view.
//!
//! Every record is dispatched to the flow of its local port. Acknowledgments leaving the local
//! host advance `max_ack`, data arriving at it advances `max_seq`, and each accepted record
//! appends `max_seq - max_ack + packet_size` to the flow's series. Duplicate acks past the
//! warm-up additionally write one packet off as lost.
use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::config::{LocalNetwork, TrackerConfig};
use crate::error::{PipelineError, Result};
use super::containers::{AckKind, DataKind, FlowState, FlowSummary, PacketRecord, RecordEvent};

pub struct FlowTracker {
    packet_size: i64,
    dup_ack_warmup: usize,
    networks: Vec<LocalNetwork>,
    local_addr: Option<IpAddr>,
    flows: BTreeMap<u16, FlowState>,
    skipped: usize,
}

/// Finalized output of one tracker run.
#[derive(Debug)]
pub struct TrackedCapture {
    pub local_addr: Option<IpAddr>,
    pub flows: BTreeMap<u16, FlowState>,
    pub skipped: usize,
}

impl TrackedCapture {
    /// Flows with enough samples to be segmented.
    pub fn usable_flows(&self) -> impl Iterator<Item = &FlowState> {
        self.flows.values().filter(|flow| flow.is_usable())
    }

    pub fn summaries(&self) -> Vec<FlowSummary> {
        self.flows.values().map(FlowState::summary).collect()
    }
}

impl FlowTracker {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            packet_size: config.packet_size,
            dup_ack_warmup: config.dup_ack_warmup,
            networks: config.networks(),
            local_addr: None,
            flows: BTreeMap::new(),
            skipped: 0,
        }
    }

    /// Feeds one record. Returns the classification of the record, `None` when it does not
    /// concern the local endpoint, or [PipelineError::MalformedRecord] when a field required by
    /// its branch is missing. Malformed records leave every flow untouched.
    pub fn process(&mut self, record: &PacketRecord) -> Result<Option<RecordEvent>> {
        let local = match self.local_addr {
            Some(local) => local,
            None => match self.detect_local(record) {
                Some(local) => local,
                None => return Ok(None),
            },
        };

        if record.src == Some(local) {
            let (port, time, ack) = match (record.src_port, record.timestamp, record.ack) {
                (Some(port), Some(time), Some(ack)) => (port, time, ack),
                (None, _, _) => return Err(PipelineError::MalformedRecord("tcp.srcport")),
                (_, None, _) => return Err(PipelineError::MalformedRecord("timestamp")),
                (_, _, None) => return Err(PipelineError::MalformedRecord("tcp.ack")),
            };
            let kind = self.on_ack(record, port, time, ack);
            Ok(Some(RecordEvent::Ack(kind)))
        } else if record.dst == Some(local) {
            let (port, time, seq) = match (record.dst_port, record.timestamp, record.seq) {
                (Some(port), Some(time), Some(seq)) => (port, time, seq),
                (None, _, _) => return Err(PipelineError::MalformedRecord("tcp.dstport")),
                (_, None, _) => return Err(PipelineError::MalformedRecord("timestamp")),
                (_, _, None) => return Err(PipelineError::MalformedRecord("tcp.seq")),
            };
            let kind = self.on_data(record, port, time, seq);
            Ok(Some(RecordEvent::Data(kind)))
        } else {
            Ok(None)
        }
    }

    pub fn finish(self) -> TrackedCapture {
        log::info!(
            "Tracked {} flows ({} records skipped).",
            self.flows.len(),
            self.skipped
        );
        TrackedCapture {
            local_addr: self.local_addr,
            flows: self.flows,
            skipped: self.skipped,
        }
    }

    fn detect_local(&mut self, record: &PacketRecord) -> Option<IpAddr> {
        let in_range = |addr: &Option<IpAddr>| {
            addr.filter(|addr| self.networks.iter().any(|net| net.contains(*addr)))
        };
        let local = in_range(&record.src).or_else(|| in_range(&record.dst))?;
        log::info!("Detected local endpoint {local}");
        self.local_addr = Some(local);
        Some(local)
    }

    fn on_ack(&mut self, record: &PacketRecord, port: u16, time: f64, ack: i64) -> AckKind {
        let is_new = !self.flows.contains_key(&port);
        let flow = self
            .flows
            .entry(port)
            .or_insert_with(|| FlowState::new(port, record.dst, record.dst_port));

        let kind = if is_new {
            flow.max_ack = ack;
            AckKind::InOrder
        } else if ack <= flow.max_ack {
            if flow.last_ack_seen == Some(ack) {
                flow.duplicate_ack_times.push(time);
                AckKind::Duplicate
            } else {
                flow.out_of_order_ack_times.push(time);
                AckKind::OutOfOrder
            }
        } else {
            AckKind::InOrder
        };

        flow.max_ack = flow.max_ack.max(ack);
        flow.last_ack_seen = Some(ack);
        flow.bytes_sent += u64::from(record.len);

        let normal = flow.max_seq - flow.max_ack + self.packet_size;
        let bif = match flow.bif_series.last() {
            Some(&last) if kind == AckKind::Duplicate && flow.bif_series.len() > self.dup_ack_warmup => {
                // The sender has written one more packet off; the cumulative ack that covers it
                // arrives later, so account for it now.
                let loss = last - self.packet_size;
                flow.max_ack += self.packet_size;
                normal.min(loss)
            }
            _ => normal,
        };

        log::debug!(
            "{} {ack} Max Ack {} BIF {bif}",
            RecordEvent::Ack(kind),
            flow.max_ack
        );
        flow.bif_series.push(bif);
        flow.time_series.push(time);
        kind
    }

    fn on_data(&mut self, record: &PacketRecord, port: u16, time: f64, seq: i64) -> DataKind {
        let is_new = !self.flows.contains_key(&port);
        let flow = self
            .flows
            .entry(port)
            .or_insert_with(|| FlowState::new(port, record.src, record.src_port));

        let kind = if is_new {
            flow.max_seq = seq;
            DataKind::InOrder
        } else if seq < flow.max_seq {
            if let Some(&prior) = flow.time_series.last() {
                flow.retransmission_times.push(prior);
            }
            flow.retransmitted_bytes += u64::from(record.len);
            DataKind::Retransmission
        } else {
            flow.max_seq = seq;
            DataKind::InOrder
        };
        flow.bytes_received += u64::from(record.len);

        let bif = flow.max_seq - flow.max_ack + self.packet_size;
        log::debug!(
            "{} {seq} Next {} BIF {bif}",
            RecordEvent::Data(kind),
            flow.max_seq + self.packet_size
        );
        flow.bif_series.push(bif);
        flow.time_series.push(time);
        kind
    }
}

/// Runs a fresh tracker over an ordered record stream.
pub fn track<'a, I>(records: I, config: &TrackerConfig) -> TrackedCapture
where
    I: IntoIterator<Item = &'a PacketRecord>,
{
    let mut tracker = FlowTracker::new(config);
    for record in records {
        if let Err(e) = tracker.process(record) {
            log::debug!("Skipping record: {e}");
            tracker.skipped += 1;
        }
    }
    tracker.finish()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    const LOCAL: &str = "10.0.0.2";
    const REMOTE: &str = "93.184.216.34";

    pub(crate) fn data(time: f64, seq: i64) -> PacketRecord {
        PacketRecord {
            timestamp: Some(time),
            src: Some(REMOTE.parse().unwrap()),
            dst: Some(LOCAL.parse().unwrap()),
            src_port: Some(443),
            dst_port: Some(50000),
            seq: Some(seq),
            ack: Some(1),
            len: 1448,
        }
    }

    pub(crate) fn ack(time: f64, ack: i64) -> PacketRecord {
        PacketRecord {
            timestamp: Some(time),
            src: Some(LOCAL.parse().unwrap()),
            dst: Some(REMOTE.parse().unwrap()),
            src_port: Some(50000),
            dst_port: Some(443),
            seq: Some(1),
            ack: Some(ack),
            len: 0,
        }
    }

    fn tracker() -> FlowTracker {
        FlowTracker::new(&TrackerConfig::default())
    }

    #[test]
    fn test_local_endpoint_detection() {
        let mut tracker = tracker();
        let mut foreign = data(0.0, 1);
        foreign.dst = Some("8.8.8.8".parse().unwrap());
        assert_eq!(tracker.process(&foreign).unwrap(), None);
        assert!(tracker.local_addr.is_none());

        tracker.process(&data(0.1, 1)).unwrap();
        assert_eq!(tracker.local_addr, Some(LOCAL.parse().unwrap()));
        assert!(tracker.flows.get(&50000).is_some());
    }

    #[test]
    fn test_bif_estimates() {
        let mut tracker = tracker();
        tracker.process(&data(0.0, 1000)).unwrap();
        tracker.process(&data(0.1, 3000)).unwrap();
        tracker.process(&ack(0.2, 2000)).unwrap();

        let flow = tracker.flows.get(&50000).unwrap();
        assert_eq!(flow.bif_series, vec![1088, 3088, 1088]);
        assert_eq!(flow.time_series, vec![0.0, 0.1, 0.2]);
        assert_eq!(flow.remote_port, Some(443));
        assert_eq!(flow.bytes_received, 2 * 1448);
    }

    #[test]
    fn test_duplicate_and_out_of_order_acks() {
        let mut tracker = tracker();
        tracker.process(&data(0.0, 5000)).unwrap();
        let events: Vec<_> = [ack(0.1, 3000), ack(0.2, 3000), ack(0.3, 2000), ack(0.4, 4000)]
            .iter()
            .map(|record| tracker.process(record).unwrap())
            .collect();

        assert_eq!(
            events,
            vec![
                Some(RecordEvent::Ack(AckKind::InOrder)),
                Some(RecordEvent::Ack(AckKind::Duplicate)),
                Some(RecordEvent::Ack(AckKind::OutOfOrder)),
                Some(RecordEvent::Ack(AckKind::InOrder)),
            ]
        );
        let flow = tracker.flows.get(&50000).unwrap();
        assert_eq!(flow.duplicate_ack_times, vec![0.2]);
        assert_eq!(flow.out_of_order_ack_times, vec![0.3]);
        assert_eq!(flow.max_ack, 4000);
    }

    #[test]
    fn test_duplicate_ack_before_warmup_uses_normal_estimate() {
        let mut tracker = tracker();
        tracker.process(&data(0.0, 5000)).unwrap();
        tracker.process(&ack(0.1, 3000)).unwrap();
        tracker.process(&ack(0.2, 3000)).unwrap();

        let flow = tracker.flows.get(&50000).unwrap();
        assert_eq!(flow.max_ack, 3000);
        assert_eq!(*flow.bif_series.last().unwrap(), 5000 - 3000 + 88);
    }

    #[test]
    fn test_duplicate_ack_loss_correction() {
        let mut tracker = tracker();
        for i in 1..=11 {
            tracker.process(&data(i as f64 * 0.01, i * 100)).unwrap();
        }
        tracker.process(&ack(0.2, 200)).unwrap();
        assert_eq!(*tracker.flows.get(&50000).unwrap().bif_series.last().unwrap(), 988);

        let event = tracker.process(&ack(0.3, 200)).unwrap();
        assert_eq!(event, Some(RecordEvent::Ack(AckKind::Duplicate)));

        let flow = tracker.flows.get(&50000).unwrap();
        assert_eq!(flow.max_ack, 288);
        assert_eq!(*flow.bif_series.last().unwrap(), 900);
    }

    #[test]
    fn test_retransmission_marks_prior_sample() {
        let mut tracker = tracker();
        tracker.process(&data(0.0, 1000)).unwrap();
        tracker.process(&data(0.1, 2000)).unwrap();
        let event = tracker.process(&data(0.2, 1500)).unwrap();

        assert_eq!(event, Some(RecordEvent::Data(DataKind::Retransmission)));
        let flow = tracker.flows.get(&50000).unwrap();
        assert_eq!(flow.retransmission_times, vec![0.1]);
        assert_eq!(flow.max_seq, 2000);
        assert_eq!(flow.retransmitted_bytes, 1448);

        let summary = flow.summary();
        assert_eq!(summary.retransmissions, 1);
        assert_eq!(summary.retransmitted_bytes, 1448);
        assert_eq!(summary.bytes_received, 3 * 1448);
    }

    #[test]
    fn test_malformed_record_leaves_state_untouched() {
        let mut tracker = tracker();
        tracker.process(&data(0.0, 1000)).unwrap();
        let before = tracker.flows.get(&50000).unwrap().clone();

        let mut broken = ack(0.1, 500);
        broken.ack = None;
        assert_eq!(
            tracker.process(&broken),
            Err(PipelineError::MalformedRecord("tcp.ack"))
        );
        let mut untimed = data(0.2, 2000);
        untimed.timestamp = None;
        assert!(tracker.process(&untimed).is_err());

        let after = tracker.flows.get(&50000).unwrap();
        assert_eq!(after.bif_series, before.bif_series);
        assert_eq!(after.max_seq, before.max_seq);
        assert_eq!(after.max_ack, before.max_ack);
    }

    #[test]
    fn test_max_seq_and_max_ack_never_decrease() {
        let mut tracker = tracker();
        let mut records = Vec::new();
        let mut seq = 0;
        for i in 0..60 {
            let time = i as f64 * 0.01;
            match i % 5 {
                0 | 1 => {
                    seq += 1448;
                    records.push(data(time, seq));
                }
                2 => records.push(data(time, seq - 2896)),
                3 => records.push(ack(time, seq - 1448 * 3)),
                _ => records.push(ack(time, seq - 1448 * 3)),
            }
        }

        let (mut last_seq, mut last_ack) = (i64::MIN, i64::MIN);
        for record in &records {
            tracker.process(record).unwrap();
            let flow = tracker.flows.get(&50000).unwrap();
            assert!(flow.max_seq >= last_seq);
            assert!(flow.max_ack >= last_ack);
            last_seq = flow.max_seq;
            last_ack = flow.max_ack;
        }
        let flow = tracker.flows.get(&50000).unwrap();
        assert!(!flow.duplicate_ack_times.is_empty());
        assert_eq!(flow.bif_series.len(), records.len());
    }

    #[test]
    fn test_short_flows_are_not_usable() {
        let mut other = data(0.5, 1);
        other.dst_port = Some(50001);
        let records = vec![data(0.0, 1000), data(0.1, 2000), other];
        let capture = track(&records, &TrackerConfig::default());

        assert_eq!(capture.flows.len(), 2);
        let usable: Vec<u16> = capture.usable_flows().map(|flow| flow.port).collect();
        assert_eq!(usable, vec![50000]);
        assert_eq!(capture.summaries()[0].bytes_received, 2 * 1448);
    }
}
