pub mod atomic_state;
pub mod handoff;

pub use atomic_state::{AtomicState, StateRepr};
pub use handoff::HandoffQueue;
