pub mod node;
pub mod rpc;
pub mod state;
pub mod timer;

pub use node::{PeerStatus, RaftMessage, RaftNode, RoleView};
pub use state::{RaftRole, RaftState};
