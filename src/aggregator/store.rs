use std::sync::Arc;

use parking_lot::RwLock;

use super::record::{TpsRecord, CSV_HEADER};

/// Append-only, shareable sequence of emitted records.
///
/// Cloning the store clones the handle; all clones see the same records.
#[derive(Debug, Clone, Default)]
pub struct RecordStore {
    records: Arc<RwLock<Vec<TpsRecord>>>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record.
    pub fn push(&self, record: TpsRecord) {
        self.records.write().push(record);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Returns a copy of every record in emission order.
    pub fn snapshot(&self) -> Vec<TpsRecord> {
        self.records.read().clone()
    }

    /// Returns the most recent record.
    pub fn last(&self) -> Option<TpsRecord> {
        self.records.read().last().cloned()
    }

    /// Renders header plus one row per record.
    pub fn to_csv(&self) -> String {
        let records = self.records.read();
        let mut out = String::with_capacity(CSV_HEADER.len() + 1 + records.len() * 48);
        out.push_str(CSV_HEADER);
        out.push('\n');
        for record in records.iter() {
            out.push_str(&record.csv_row());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::time::UNIX_EPOCH;

    use super::*;

    fn record(n: u64) -> TpsRecord {
        TpsRecord {
            local_time: format!("t{n}"),
            ref_time: format!("r{n}"),
            tps: n as u32,
            transactions: n * 10,
            blocks: n,
            timestamp: UNIX_EPOCH,
        }
    }

    #[test]
    fn test_empty_store_renders_header_only() {
        let store = RecordStore::new();
        assert!(store.is_empty());
        assert_eq!(store.to_csv(), "localTime,refTime,TPS,TxnCount,BlockCount\n");
        assert!(store.last().is_none());
    }

    #[test]
    fn test_clones_share_records() {
        let store = RecordStore::new();
        let reader = store.clone();

        store.push(record(1));
        store.push(record(2));

        assert_eq!(reader.len(), 2);
        assert_eq!(reader.last(), Some(record(2)));
        assert_eq!(
            reader.to_csv(),
            "localTime,refTime,TPS,TxnCount,BlockCount\nt1,r1,1,10,1\nt2,r2,2,20,2\n"
        );
    }

    #[test]
    fn test_concurrent_reads_during_appends() {
        let store = RecordStore::new();
        let writer = store.clone();

        let handle = std::thread::spawn(move || {
            for n in 0..1_000 {
                writer.push(record(n));
            }
        });

        let mut last_len = 0;
        while last_len < 1_000 {
            let snapshot = store.snapshot();
            assert!(snapshot.len() >= last_len);
            for (i, r) in snapshot.iter().enumerate() {
                assert_eq!(r.blocks, i as u64);
            }
            last_len = snapshot.len();
            if handle.is_finished() {
                last_len = store.len();
            }
        }

        handle.join().expect("writer thread");
        assert_eq!(store.len(), 1_000);
    }
}
