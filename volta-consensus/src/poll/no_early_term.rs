//! Poll that always waits for every sampled validator.

use std::fmt;

use volta_common::{Bag, Id, NodeId};

use super::{fmt_poll, record_vote, Factory, Poll};

#[derive(Debug, Default, Clone, Copy)]
pub struct NoEarlyTermFactory;

impl Factory for NoEarlyTermFactory {
    fn new_poll(&self, vdrs: Bag<NodeId>) -> Box<dyn Poll> {
        Box::new(NoEarlyTermPoll { votes: Bag::new(), polled: vdrs })
    }
}

#[derive(Debug)]
pub struct NoEarlyTermPoll {
    votes: Bag<Id>,
    polled: Bag<NodeId>,
}

impl Poll for NoEarlyTermPoll {
    fn vote(&mut self, vdr: &NodeId, vote: Id) {
        record_vote(&mut self.polled, &mut self.votes, vdr, vote);
    }

    fn drop_vdr(&mut self, vdr: &NodeId) {
        self.polled.remove(vdr);
    }

    fn finished(&self) -> bool {
        self.polled.is_empty()
    }

    fn result(&self) -> &Bag<Id> {
        &self.votes
    }
}

impl fmt::Display for NoEarlyTermPoll {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_poll(f, &self.polled, &self.votes)
    }
}
