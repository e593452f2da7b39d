pub mod history;
pub mod log;
pub mod presence;
