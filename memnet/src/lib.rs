//! In-memory implementations of the `shard-raft` and `shard-kv` transport
//! and persistence seams, plus a cluster harness.
//!
//! [`MemPersistence`] keeps a replica's two blobs in memory.
//! [`Router`] is an in-memory network that routes service RPCs by server
//! name and Raft RPCs inside each group, with fault injection: nodes can be
//! isolated, crashed, and restarted from their retained persistence, and
//! messages can be randomly dropped or delayed. The integration test suites
//! of both crates are built on it.

mod persist;
mod router;

pub use crate::persist::MemPersistence;
pub use crate::router::KvRaftNet;
pub use crate::router::MasterRaftNet;
pub use crate::router::MemMaster;
pub use crate::router::MemShardKv;
pub use crate::router::Router;
pub use crate::router::ServiceHandle;
