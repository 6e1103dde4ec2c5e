//! Message operation kinds, as far as timeouts and metrics care about them.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Op {
    GetAcceptedFrontier,
    AcceptedFrontier,
    GetAccepted,
    Accepted,
    GetAncestors,
    Ancestors,
    Get,
    Put,
    PushQuery,
    PullQuery,
    Chits,
    AppRequest,
    AppResponse,
}

impl Op {
    /// Metric label for this op.
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::GetAcceptedFrontier => "get_accepted_frontier",
            Op::AcceptedFrontier => "accepted_frontier",
            Op::GetAccepted => "get_accepted",
            Op::Accepted => "accepted",
            Op::GetAncestors => "get_ancestors",
            Op::Ancestors => "ancestors",
            Op::Get => "get",
            Op::Put => "put",
            Op::PushQuery => "push_query",
            Op::PullQuery => "pull_query",
            Op::Chits => "chits",
            Op::AppRequest => "app_request",
            Op::AppResponse => "app_response",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_metric_label() {
        assert_eq!(Op::Chits.to_string(), "chits");
        assert_eq!(Op::GetAcceptedFrontier.to_string(), "get_accepted_frontier");
    }
}
