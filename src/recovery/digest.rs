use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use crate::types::{Epoch, Esn, NodeId, Record};

/// One version of the record at a position, with the nodes holding it and
/// the recovery tag of each node's copy. `record.recovered_in` is the
/// highest of those tags.
#[derive(Debug, Clone)]
pub struct DigestEntry {
    pub record: Record,
    pub holders: BTreeMap<NodeId, Epoch>,
}

impl DigestEntry {
    /// Holders whose copy was already written by a recovery tagged `epoch`
    /// or later.
    pub fn stamped(&self, epoch: Epoch) -> BTreeSet<NodeId> {
        self.holders
            .iter()
            .filter(|(_, tag)| **tag >= epoch)
            .map(|(node, _)| node.clone())
            .collect()
    }
}

/// What the answering nodes hold for one epoch, keyed by ESN.
#[derive(Debug, Default)]
pub struct RecoveryDigest {
    entries: BTreeMap<Esn, Vec<DigestEntry>>,
    answered: BTreeSet<NodeId>,
}

impl RecoveryDigest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a node's reply. A node that answers with nothing still counts as
    /// answered.
    pub fn add(&mut self, node: &NodeId, records: Vec<Record>) {
        self.answered.insert(node.clone());
        for record in records {
            let variants = self.entries.entry(record.lsn.esn).or_default();
            // 同一位置内容不同（残留副本与 bridge 并存）时分别计数
            match variants
                .iter_mut()
                .find(|v| v.record.same_content(&record))
            {
                Some(variant) => {
                    variant.holders.insert(node.clone(), record.recovered_in);
                    if record.recovered_in > variant.record.recovered_in {
                        variant.record = record;
                    }
                }
                None => {
                    if !variants.is_empty() {
                        warn!(
                            "{}: {} holds a conflicting copy of {}",
                            record.log, node, record.lsn
                        );
                    }
                    variants.push(DigestEntry {
                        holders: BTreeMap::from([(node.clone(), record.recovered_in)]),
                        record,
                    });
                }
            }
        }
    }

    pub fn answered(&self) -> &BTreeSet<NodeId> {
        &self.answered
    }

    /// Highest ESN any answering node holds; `Esn(0)` for an empty epoch.
    pub fn tail(&self) -> Esn {
        self.entries
            .keys()
            .next_back()
            .copied()
            .unwrap_or(Esn::INVALID)
    }

    /// The version that survives at `esn`: the one written by the latest
    /// recovery, then most holders, then data over a bridge.
    pub fn resolve(&self, esn: Esn) -> Option<&DigestEntry> {
        self.entries.get(&esn)?.iter().max_by(|a, b| {
            a.record
                .recovered_in
                .cmp(&b.record.recovered_in)
                .then_with(|| a.holders.len().cmp(&b.holders.len()))
                .then_with(|| b.record.is_bridge().cmp(&a.record.is_bridge()))
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Copyset, LogId, Lsn};

    fn data(esn: u64, payload: &str) -> Record {
        Record::data(
            LogId(1),
            Lsn::new(2, esn),
            payload.as_bytes().to_vec(),
            Copyset::default(),
        )
    }

    #[test]
    fn test_digest_counts_holders_per_position() {
        let mut digest = RecoveryDigest::new();
        digest.add(&"a".into(), vec![data(1, "x"), data(2, "y")]);
        digest.add(&"b".into(), vec![data(1, "x")]);
        digest.add(&"c".into(), vec![]);

        assert_eq!(digest.answered().len(), 3);
        assert_eq!(digest.tail(), Esn(2));
        assert_eq!(digest.resolve(Esn(1)).unwrap().holders.len(), 2);
        assert_eq!(digest.resolve(Esn(2)).unwrap().holders.len(), 1);
        assert!(digest.resolve(Esn(3)).is_none());
    }

    #[test]
    fn test_conflicting_copies_resolve_to_majority_then_data() {
        let mut digest = RecoveryDigest::new();
        let bridge = Record::bridge(LogId(1), Lsn::new(2, 1), Copyset::default());
        digest.add(&"a".into(), vec![bridge.clone()]);
        digest.add(&"b".into(), vec![data(1, "late")]);
        // 平票时保留数据记录
        assert!(!digest.resolve(Esn(1)).unwrap().record.is_bridge());

        digest.add(&"c".into(), vec![bridge]);
        assert!(digest.resolve(Esn(1)).unwrap().record.is_bridge());
    }

    #[test]
    fn test_latest_recovery_wins_over_holder_count() {
        let mut digest = RecoveryDigest::new();
        digest.add(&"a".into(), vec![data(1, "x")]);
        digest.add(&"b".into(), vec![data(1, "x")]);
        let bridge =
            Record::bridge(LogId(1), Lsn::new(2, 1), Copyset::default()).recovered_by(Epoch(4));
        digest.add(&"c".into(), vec![bridge]);
        digest.add(&"d".into(), vec![data(1, "x").recovered_by(Epoch(3))]);

        let entry = digest.resolve(Esn(1)).unwrap();
        assert!(entry.record.is_bridge());
        assert_eq!(entry.record.recovered_in, Epoch(4));

        // 同一内容取各副本中最高的标记
        let data_entry = digest.entries[&Esn(1)]
            .iter()
            .find(|v| !v.record.is_bridge())
            .unwrap();
        assert_eq!(data_entry.holders.len(), 3);
        assert_eq!(data_entry.record.recovered_in, Epoch(3));
        assert_eq!(
            data_entry.stamped(Epoch(3)),
            BTreeSet::from([NodeId::new("d")])
        );
    }

    #[test]
    fn test_empty_digest() {
        let digest = RecoveryDigest::new();
        assert!(digest.is_empty());
        assert_eq!(digest.tail(), Esn::INVALID);
    }
}
