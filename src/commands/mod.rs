pub mod needset;
pub mod pack;
pub mod replay_events;
pub mod status;
