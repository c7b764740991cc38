use epoch_prover_types::{EpochNumber, ProvingJobFilter, ProvingJobId, ProvingRequestType};
use std::collections::{BTreeMap, HashMap};

/// Position of a job in its type's queue: lower epochs first, then enqueue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct QueueKey {
    epoch: EpochNumber,
    seq: u64,
}

#[derive(Debug, Default)]
pub(crate) struct JobQueue {
    by_type: HashMap<ProvingRequestType, BTreeMap<QueueKey, ProvingJobId>>,
    next_seq: u64,
    len: usize,
}

impl JobQueue {
    pub fn push(
        &mut self,
        ty: ProvingRequestType,
        epoch: EpochNumber,
        id: ProvingJobId,
    ) -> QueueKey {
        let key = QueueKey {
            epoch,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.by_type.entry(ty).or_default().insert(key, id);
        self.len += 1;
        key
    }

    pub fn remove(&mut self, ty: ProvingRequestType, key: QueueKey) -> bool {
        let removed = self
            .by_type
            .get_mut(&ty)
            .and_then(|queue| queue.remove(&key))
            .is_some();
        if removed {
            self.len -= 1;
        }
        removed
    }

    /// Removes and returns the most urgent job the filter accepts.
    pub fn pop(&mut self, filter: &ProvingJobFilter) -> Option<ProvingJobId> {
        let (ty, key) = self
            .by_type
            .iter()
            .filter(|(ty, _)| filter.accepts(**ty))
            .filter_map(|(ty, queue)| queue.first_key_value().map(|(key, _)| (*ty, *key)))
            .min_by_key(|(_, key)| *key)?;
        let id = self.by_type.get_mut(&ty)?.remove(&key)?;
        self.len -= 1;
        Some(id)
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use epoch_prover_types::AgentId;

    #[test]
    fn pops_lowest_epoch_then_fifo() {
        let mut queue = JobQueue::default();
        queue.push(ProvingRequestType::Tube, 2, "a".into());
        queue.push(ProvingRequestType::Avm, 1, "b".into());
        queue.push(ProvingRequestType::Tube, 1, "c".into());
        let any = ProvingJobFilter::any(AgentId::new("agent"));

        assert_eq!(queue.pop(&any), Some("b".into()));
        assert_eq!(queue.pop(&any), Some("c".into()));
        assert_eq!(queue.pop(&any), Some("a".into()));
        assert_eq!(queue.pop(&any), None);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn respects_allow_list_and_removal() {
        let mut queue = JobQueue::default();
        let key = queue.push(ProvingRequestType::Tube, 1, "a".into());
        queue.push(ProvingRequestType::Avm, 2, "b".into());
        let tube_only = ProvingJobFilter::only(AgentId::new("agent"), [ProvingRequestType::Tube]);

        assert!(queue.remove(ProvingRequestType::Tube, key));
        assert!(!queue.remove(ProvingRequestType::Tube, key));
        assert_eq!(queue.pop(&tube_only), None);
        assert_eq!(queue.len(), 1);
    }
}
