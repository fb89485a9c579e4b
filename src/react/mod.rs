//! 推理层：调用提取（CallExtractor）、循环状态、过程事件与 TurnLoop 主循环

pub mod events;
pub mod extractor;
pub mod loop_;
pub mod state;

pub use events::{EventSender, LoopEvent, LoopEventEnvelope};
pub use extractor::{dedup_invocations, CallExtractor, PatternStrategy, TextCallStrategy};
pub use loop_::{LoopConfig, LoopResult, RespondArgs, TurnLoop};
pub use state::{IterationState, LoopOutcome, LoopState};
