//! Connection strategies and the orchestrator that runs them.

pub mod orchestrator;
pub mod pairs;
pub mod relay;
pub mod table;

pub use orchestrator::{
    ID_LINE_LEN, Incoming, Orchestrator, OrchestratorBuilder, OrchestratorConfig, StrategyHandler, id_line,
    parse_id_line,
};
pub use pairs::{Candidate, candidates, pair_order, reply_candidate, same_machine, select_dest_ip};
pub use relay::{RelayAllocator, TurnOffer};
pub use table::{StrategyKind, StrategySpec, default_table};
