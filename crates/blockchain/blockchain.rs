pub mod authority;
pub mod error;
pub mod finality;
pub mod gossip;
pub mod mempool;
pub mod production;
pub mod tree;

pub use authority::{AuthorityFinalizationObserver, AuthorityManager, ScheduleNode};
pub use error::{AuthorityError, ChainError, FinalityError, PoolError, ProductionError};
pub use finality::{Environment, Finality, VoterSet, VotingRound};
pub use gossip::{BroadcastGossiper, GossipMessage, Gossiper, MessageKind};
pub use mempool::{
    PoolLimits, PoolModerator, PoolStatus, PoolTransaction, StructuralValidator, TransactionPool,
    TransactionValidator,
};
pub use production::{Epoch, Production, ProductionConfig, ProductionState, SyncRequester};
pub use tree::{AncestryProvider, BlockTree, FinalizationObserver};
