pub mod chat;
pub mod video;
