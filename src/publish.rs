//! Versions made visible to an a-priori-unknown set of future fetchers.
use std::collections::HashMap;

use crate::core::{FlowId, Hash32, UseId};
use crate::error::PublicationMismatch;
use crate::key::Key;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicationState {
    /// Accepting fetches.
    Open,
    /// Every declared fetch happened, the record is retired.
    Drained,
}

/// One published `(key, version)` pair.
#[derive(Debug, Clone)]
pub struct PublicationRecord {
    pub key: Key,
    pub version: Key,
    pub n_fetchers: usize,
    pub fetched: usize,
    /// The published version of the data.
    pub flow: FlowId,
    /// Read use keeping the version alive until the record drains.
    pub holder: UseId,
    /// Digest of the bytes stored at `flow` when published, if any.
    pub digest: Option<Hash32>,
    pub state: PublicationState,
}

/// What a successful fetch hands back to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    pub flow: FlowId,
    pub digest: Option<Hash32>,
    /// Set when this fetch drained the record; the holder must be released.
    pub drained: Option<UseId>,
}

#[derive(Debug, Default)]
pub struct PublicationRegistry {
    records: HashMap<(Key, Key), PublicationRecord>,
}

impl PublicationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails when the same `(key, version)` is still open.
    pub fn check_publish(&self, key: &Key, version: &Key) -> Result<(), PublicationMismatch> {
        match self.records.get(&(key.clone(), version.clone())) {
            Some(record) if record.state == PublicationState::Open => {
                Err(PublicationMismatch::DuplicatePublish {
                    key: key.clone(),
                    version: version.clone(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Records a publication. A drained record with the same key and version
    /// is replaced.
    ///
    /// Returns the holder when `n_fetchers` is zero: such a publication is
    /// drained on arrival and must not keep the data alive.
    pub fn publish(
        &mut self,
        key: Key,
        version: Key,
        n_fetchers: usize,
        flow: FlowId,
        holder: UseId,
        digest: Option<Hash32>,
    ) -> Result<Option<UseId>, PublicationMismatch> {
        self.check_publish(&key, &version)?;

        let state = match n_fetchers {
            0 => PublicationState::Drained,
            _ => PublicationState::Open,
        };

        tracing::info!(
            "published {} at version {} for {} fetcher(s)",
            key,
            version,
            n_fetchers
        );

        self.records.insert(
            (key.clone(), version.clone()),
            PublicationRecord {
                key,
                version,
                n_fetchers,
                fetched: 0,
                flow,
                holder,
                digest,
                state,
            },
        );

        Ok((state == PublicationState::Drained).then_some(holder))
    }

    /// Consumes one unit of the declared capacity.
    pub fn fetch(&mut self, key: &Key, version: &Key) -> Result<FetchTicket, PublicationMismatch> {
        let record = self
            .records
            .get_mut(&(key.clone(), version.clone()))
            .ok_or_else(|| PublicationMismatch::NotFound {
                key: key.clone(),
                version: version.clone(),
            })?;

        if record.state == PublicationState::Drained {
            return Err(PublicationMismatch::Drained {
                key: key.clone(),
                version: version.clone(),
                n_fetchers: record.n_fetchers,
            });
        }

        record.fetched += 1;

        let drained = match record.fetched == record.n_fetchers {
            true => {
                record.state = PublicationState::Drained;
                tracing::info!("publication of {} at version {} drained", key, version);
                Some(record.holder)
            }
            false => None,
        };

        Ok(FetchTicket {
            flow: record.flow,
            digest: record.digest,
            drained,
        })
    }

    pub fn get(&self, key: &Key, version: &Key) -> Option<&PublicationRecord> {
        self.records.get(&(key.clone(), version.clone()))
    }

    /// Records still waiting for fetches.
    pub fn open(&self) -> impl Iterator<Item = &PublicationRecord> {
        self.records
            .values()
            .filter(|record| record.state == PublicationState::Open)
    }

    /// Under-fetch report for every record still open.
    pub fn under_fetched(&self) -> Vec<PublicationMismatch> {
        let mut open: Vec<_> = self.open().collect();
        open.sort_by(|a, b| (&a.key, &a.version).cmp(&(&b.key, &b.version)));

        open.into_iter()
            .map(|record| PublicationMismatch::UnderFetched {
                key: record.key.clone(),
                version: record.version.clone(),
                fetched: record.fetched,
                declared: record.n_fetchers,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key;

    fn publish(registry: &mut PublicationRegistry, n: usize) -> Option<UseId> {
        registry
            .publish(key!("x"), key!("v", 1), n, FlowId(3), UseId(9), None)
            .unwrap()
    }

    #[test]
    fn test_drains_after_declared_fetches() {
        let mut registry = PublicationRegistry::new();
        assert_eq!(publish(&mut registry, 2), None);

        let first = registry.fetch(&key!("x"), &key!("v", 1)).unwrap();
        assert_eq!(first.flow, FlowId(3));
        assert_eq!(first.drained, None);

        let second = registry.fetch(&key!("x"), &key!("v", 1)).unwrap();
        assert_eq!(second.drained, Some(UseId(9)));

        let third = registry.fetch(&key!("x"), &key!("v", 1)).unwrap_err();
        assert_eq!(
            third,
            PublicationMismatch::Drained {
                key: key!("x"),
                version: key!("v", 1),
                n_fetchers: 2
            }
        );
    }

    #[test]
    fn test_zero_fetchers_is_drained_on_arrival() {
        let mut registry = PublicationRegistry::new();
        assert_eq!(publish(&mut registry, 0), Some(UseId(9)));
        assert_eq!(registry.open().count(), 0);
        assert!(registry.fetch(&key!("x"), &key!("v", 1)).is_err());
    }

    #[test]
    fn test_duplicate_open_publish() {
        let mut registry = PublicationRegistry::new();
        publish(&mut registry, 1);

        let err = registry
            .publish(key!("x"), key!("v", 1), 1, FlowId(4), UseId(10), None)
            .unwrap_err();
        assert!(matches!(err, PublicationMismatch::DuplicatePublish { .. }));

        // Another version of the same handle is independent.
        assert!(
            registry
                .publish(key!("x"), key!("v", 2), 1, FlowId(4), UseId(10), None)
                .is_ok()
        );

        // Once drained, the label can be reused.
        registry.fetch(&key!("x"), &key!("v", 1)).unwrap();
        assert!(
            registry
                .publish(key!("x"), key!("v", 1), 1, FlowId(5), UseId(11), None)
                .is_ok()
        );
    }

    #[test]
    fn test_missing_record() {
        let mut registry = PublicationRegistry::new();
        let err = registry.fetch(&key!("y"), &key!("v")).unwrap_err();
        assert!(matches!(err, PublicationMismatch::NotFound { .. }));
    }

    #[test]
    fn test_under_fetched_report() {
        let mut registry = PublicationRegistry::new();
        publish(&mut registry, 3);
        registry.fetch(&key!("x"), &key!("v", 1)).unwrap();

        assert_eq!(
            registry.under_fetched(),
            vec![PublicationMismatch::UnderFetched {
                key: key!("x"),
                version: key!("v", 1),
                fetched: 1,
                declared: 3,
            }]
        );
    }
}
