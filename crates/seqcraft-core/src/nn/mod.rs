pub mod cell;
pub mod loss;
pub mod optim;

pub use cell::{Cell, CellKind, CellState, RecurrentCell, StackedCell, StackedState, unroll};
pub use loss::{perplexity, sequence_log_likelihood, sequence_loss};
pub use optim::{OptimizerKind, SeqOptimizer, clip_by_global_norm};
