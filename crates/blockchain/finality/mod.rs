pub mod environment;
pub mod round;
pub mod types;

pub use environment::Environment;
pub use round::{Finality, RoundState, VotingRound};
pub use types::{
    authority_id_of, FinalityJustification, RoundNumber, SetId, SignedVote, Vote, VoteStage,
    VoterSet,
};
