pub mod animator;
pub mod chat;
