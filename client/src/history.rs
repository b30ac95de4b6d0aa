use haze_shared::utils::get_timestamp;
use haze_shared::Packet;

/// One packet sent or received, with the local time it happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub timestamp_ms: u64,
    pub packet: Packet,
}

/// Append-only timeline of packets
#[derive(Debug, Default)]
pub struct History {
    records: Vec<Record>,
}

impl History {
    pub fn push(&mut self, packet: Packet) {
        self.records.push(Record {
            timestamp_ms: get_timestamp(),
            packet,
        });
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last(&self) -> Option<&Record> {
        self.records.last()
    }

    pub fn to_vec(&self) -> Vec<Record> {
        self.records.clone()
    }
}
