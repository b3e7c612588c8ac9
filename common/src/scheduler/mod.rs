// Alert scheduling: cadence, sweep engine, and one-shot timers

pub mod cadence;
pub mod engine;
pub mod timers;

pub use engine::{AlertEngine, DispatchOutcome, EngineConfig, Scheduler, SweepReport};
pub use timers::TimerSet;
