//! Share-or-new decisions for handles inside a transaction scope

use xapool_core::{ConnectionSharing, ConnectionState, ResolvedRequest};

use crate::pool::McKey;

/// An in-use connection a new handle might share
#[derive(Debug, Clone)]
pub struct ShareCandidate {
    pub key: McKey,
    /// The request the connection was first acquired for
    pub original: ResolvedRequest,
    /// Its live state, which handles may have changed since
    pub state: ConnectionState,
}

/// Decides whether a request may reuse a connection already in use in its scope.
///
/// Unshareable requests never reach the coordinator.
#[derive(Debug, Clone, Copy)]
pub struct SharingCoordinator {
    mode: ConnectionSharing,
}

impl SharingCoordinator {
    pub fn new(mode: ConnectionSharing) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> ConnectionSharing {
        self.mode
    }

    pub fn can_share(&self, request: &ResolvedRequest, candidate: &ShareCandidate) -> bool {
        match self.mode {
            ConnectionSharing::MatchOriginalRequest => candidate.original == *request,
            ConnectionSharing::MatchCurrentState => candidate.state.satisfies(request),
        }
    }

    /// The first candidate the request may share, if any
    pub fn select(&self, request: &ResolvedRequest, candidates: &[ShareCandidate]) -> Option<McKey> {
        candidates
            .iter()
            .find(|candidate| self.can_share(request, candidate))
            .map(|candidate| candidate.key)
    }
}
