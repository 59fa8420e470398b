pub mod discovery;
pub mod path_guard;
pub mod projects;
pub mod registry;
pub mod watch_manager;
