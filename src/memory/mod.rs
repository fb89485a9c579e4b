//! 对话记忆：单次请求内的只追加对话历史

pub mod conversation;

pub use conversation::{Conversation, Message, Role};
