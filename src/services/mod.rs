pub mod event_manager;
pub mod invite_tracker;
