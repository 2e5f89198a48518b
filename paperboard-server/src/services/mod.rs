pub mod access;
pub mod display;
pub mod mirror;
pub mod notifications;
pub mod refresh;
pub mod render_queue;
pub mod render_worker;
pub mod renderer;
pub mod schedule_matcher;
pub mod sleep_window;
pub mod time_window;
