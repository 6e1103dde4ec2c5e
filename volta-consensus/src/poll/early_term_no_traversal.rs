//! Poll that stops as soon as its outcome can no longer change.

use std::fmt;

use volta_common::{Bag, Id, NodeId};

use super::{fmt_poll, record_vote, Factory, Poll};
use crate::error::ConsensusError;

#[derive(Debug, Clone, Copy)]
pub struct EarlyTermNoTraversalFactory {
    alpha: usize,
}

impl EarlyTermNoTraversalFactory {
    pub fn new(alpha: usize) -> Result<Self, ConsensusError> {
        if alpha == 0 {
            return Err(ConsensusError::Config("alpha must be at least 1".into()));
        }
        Ok(Self { alpha })
    }

    pub fn alpha(&self) -> usize {
        self.alpha
    }
}

impl Factory for EarlyTermNoTraversalFactory {
    fn new_poll(&self, vdrs: Bag<NodeId>) -> Box<dyn Poll> {
        Box::new(EarlyTermNoTraversalPoll { votes: Bag::new(), polled: vdrs, alpha: self.alpha })
    }
}

/// Finishes once every validator has answered, once `alpha` can no longer
/// be reached, or once a single vote has reached `alpha`. Needs no
/// knowledge of how the voted ids relate to one another.
#[derive(Debug)]
pub struct EarlyTermNoTraversalPoll {
    votes: Bag<Id>,
    polled: Bag<NodeId>,
    alpha: usize,
}

impl Poll for EarlyTermNoTraversalPoll {
    fn vote(&mut self, vdr: &NodeId, vote: Id) {
        record_vote(&mut self.polled, &mut self.votes, vdr, vote);
    }

    fn drop_vdr(&mut self, vdr: &NodeId) {
        self.polled.remove(vdr);
    }

    fn finished(&self) -> bool {
        let remaining = self.polled.len();
        if remaining == 0 {
            return true;
        }

        let received = self.votes.len();
        if received + remaining < self.alpha {
            return true;
        }

        matches!(self.votes.mode(), Some((_, freq)) if freq >= self.alpha)
    }

    fn result(&self) -> &Bag<Id> {
        &self.votes
    }
}

impl fmt::Display for EarlyTermNoTraversalPoll {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_poll(f, &self.polled, &self.votes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vdrs(n: usize) -> Vec<NodeId> {
        (1..=n).map(|i| NodeId::new(format!("node{i}"))).collect()
    }

    fn poll(alpha: usize, vdrs: &[NodeId]) -> Box<dyn Poll> {
        let factory = EarlyTermNoTraversalFactory::new(alpha).unwrap();
        factory.new_poll(vdrs.iter().cloned().collect())
    }

    #[test]
    fn test_finishes_on_alpha_majority() {
        let vdrs = vdrs(5);
        let mut poll = poll(3, &vdrs);
        let vtx = Id::from_u64(1);

        for vdr in &vdrs[..2] {
            poll.vote(vdr, vtx);
            assert!(!poll.finished());
        }
        poll.vote(&vdrs[2], vtx);

        assert!(poll.finished());
        assert_eq!(poll.result().count(&vtx), 3);
    }

    #[test]
    fn test_finishes_when_alpha_unreachable() {
        let vdrs = vdrs(5);
        let mut poll = poll(3, &vdrs);

        poll.drop_vdr(&vdrs[0]);
        poll.drop_vdr(&vdrs[1]);
        assert!(!poll.finished());
        poll.drop_vdr(&vdrs[2]);

        assert!(poll.finished());
        assert!(poll.result().is_empty());
    }

    #[test]
    fn test_split_votes_finish_early() {
        let vdrs = vdrs(5);
        let mut poll = poll(4, &vdrs);

        poll.vote(&vdrs[0], Id::from_u64(1));
        poll.vote(&vdrs[1], Id::from_u64(2));
        assert!(!poll.finished());
        // best case is now 1 + 2 remaining
        poll.drop_vdr(&vdrs[2]);
        assert!(poll.finished());
    }

    #[test]
    fn test_second_vote_ignored() {
        let vdrs = vdrs(2);
        let mut poll = poll(2, &vdrs);
        let (vtx1, vtx2) = (Id::from_u64(1), Id::from_u64(2));

        poll.vote(&vdrs[0], vtx1);
        poll.vote(&vdrs[0], vtx2);
        poll.drop_vdr(&vdrs[0]);

        assert_eq!(poll.result().count(&vtx1), 1);
        assert_eq!(poll.result().count(&vtx2), 0);
        assert_eq!(poll.result().len(), 1);
        assert!(!poll.finished());
    }

    #[test]
    fn test_weighted_sample() {
        let vdr = NodeId::from("node1");
        let other = NodeId::from("node2");
        let mut sample = Bag::new();
        sample.add_count(vdr.clone(), 3);
        sample.add(other.clone());

        let mut poll = EarlyTermNoTraversalFactory::new(3).unwrap().new_poll(sample);
        poll.vote(&vdr, Id::from_u64(7));

        assert!(poll.finished());
        assert_eq!(poll.result().count(&Id::from_u64(7)), 3);
    }

    #[test]
    fn test_all_responded() {
        let vdrs = vdrs(3);
        let mut poll = poll(3, &vdrs);
        poll.vote(&vdrs[0], Id::from_u64(1));
        poll.vote(&vdrs[1], Id::from_u64(1));
        assert!(!poll.finished());
        poll.vote(&vdrs[2], Id::from_u64(2));
        assert!(poll.finished());
    }

    #[test]
    fn test_zero_alpha_rejected() {
        assert!(EarlyTermNoTraversalFactory::new(0).is_err());
    }

    #[test]
    fn test_display() {
        let vdrs = vdrs(1);
        let mut poll = poll(1, &vdrs);
        assert!(poll.to_string().starts_with("waiting on Bag: (Size = 1)"));
        poll.vote(&vdrs[0], Id::from_u64(1));
        assert!(poll.to_string().contains("received Bag: (Size = 1)"));
    }
}
