//! Quorum polls.
//!
//! A poll starts with the sampled validators, each weighted by how many
//! times it was drawn, and moves weight from `polled` into `votes` as chits
//! arrive. A poll is owned by one context at a time and is never locked.

use std::fmt;

use volta_common::{Bag, Id, NodeId};

mod early_term_no_traversal;
mod no_early_term;
mod set;

pub use early_term_no_traversal::{EarlyTermNoTraversalFactory, EarlyTermNoTraversalPoll};
pub use no_early_term::{NoEarlyTermFactory, NoEarlyTermPoll};
pub use set::Set;

pub trait Poll: fmt::Display + Send {
    /// Records `vdr`'s preference. Only the first response from a validator
    /// counts; anything after that is ignored.
    fn vote(&mut self, vdr: &NodeId, vote: Id);

    /// Gives up on `vdr` without counting a vote.
    fn drop_vdr(&mut self, vdr: &NodeId);

    fn finished(&self) -> bool;

    /// Votes tallied so far, weighted by sample count.
    fn result(&self) -> &Bag<Id>;
}

/// Creates polls over a drawn sample.
pub trait Factory: Send + Sync {
    fn new_poll(&self, vdrs: Bag<NodeId>) -> Box<dyn Poll>;
}

/// Moves `vdr`'s whole weight from `polled` to `votes[vote]`, if it is
/// still outstanding.
fn record_vote(polled: &mut Bag<NodeId>, votes: &mut Bag<Id>, vdr: &NodeId, vote: Id) {
    let weight = polled.count(vdr);
    if weight == 0 {
        return;
    }
    polled.remove(vdr);
    votes.add_count(vote, weight);
}

fn fmt_poll(f: &mut fmt::Formatter<'_>, polled: &Bag<NodeId>, votes: &Bag<Id>) -> fmt::Result {
    write!(f, "waiting on {polled}\nreceived {votes}")
}
