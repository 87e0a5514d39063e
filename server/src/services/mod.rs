pub mod channel_feed;
pub mod geometry_loader;
pub mod session_worker;
