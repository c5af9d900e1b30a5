pub mod job;
pub mod poller;
