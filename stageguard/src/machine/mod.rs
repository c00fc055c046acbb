//! Pipeline state machine.
//!
//! A small validated primary state plus an append-only stack of
//! `(state, context)` entries recording what each stage produced.

mod fsm;
mod stack;
mod transitions;

pub use fsm::{PersistenceStatus, StateMachine, TransitionRecord};
pub use stack::{
    StateStack, StateStackEntry, DURATION_KEY, ERROR_KIND_KEY, ERROR_MESSAGE_KEY, RESTORED_KEY,
    RESULT_KEY, RETRY_COUNT_KEY, STAGE_NAME_KEY,
};
pub use transitions::TransitionTable;
