//! Transaction branch identifiers and XA result codes

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Format identifier stamped on every xid created by this transaction manager.
///
/// Recovery only touches prepared branches carrying this format id.
pub const XAPOOL_FORMAT_ID: u32 = 0x5841_504c;

/// Identifier of one branch of a distributed transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Xid {
    format_id: u32,
    global_id: Uuid,
    branch: u16,
}

impl Xid {
    /// Create an xid for the given global transaction and branch qualifier
    pub fn new(global_id: Uuid, branch: u16) -> Self {
        Self {
            format_id: XAPOOL_FORMAT_ID,
            global_id,
            branch,
        }
    }

    /// Create an xid with an explicit format id (foreign transaction managers)
    pub fn with_format(format_id: u32, global_id: Uuid, branch: u16) -> Self {
        Self {
            format_id,
            global_id,
            branch,
        }
    }

    pub fn format_id(&self) -> u32 {
        self.format_id
    }

    pub fn global_id(&self) -> Uuid {
        self.global_id
    }

    pub fn branch(&self) -> u16 {
        self.branch
    }

    /// Whether this xid was created by this transaction manager
    pub fn is_ours(&self) -> bool {
        self.format_id == XAPOOL_FORMAT_ID
    }
}

impl std::fmt::Display for Xid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}:{}:{}", self.format_id, self.global_id, self.branch)
    }
}

/// Error codes a resource manager reports for XA calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum XaErrorCode {
    /// The branch was rolled back by the resource manager (XA_RB*)
    RolledBack,
    /// The xid is not known to the resource manager (XAER_NOTA)
    UnknownXid,
    /// The resource manager is unavailable (XAER_RMFAIL)
    ResourceFailed,
    /// A resource manager error occurred (XAER_RMERR)
    ResourceError,
    /// The call was made in an invalid state (XAER_PROTO)
    Protocol,
    /// The branch was heuristically committed
    HeuristicCommit,
    /// The branch was heuristically rolled back
    HeuristicRollback,
    /// The branch was partly committed and partly rolled back
    HeuristicMixed,
    /// The operation should be retried later (XA_RETRY)
    Retry,
}

/// Vote returned from the prepare phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vote {
    /// The branch is prepared and must be committed or rolled back
    Ok,
    /// The branch did no updates and is already complete
    ReadOnly,
}

/// Commit protocol capability of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Supports prepare and the full two-phase protocol
    TwoPhase,
    /// Can only commit in one phase (a local transaction)
    OnePhaseOnly,
}
