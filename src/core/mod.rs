pub mod command;
pub mod duration;
pub mod memory;
pub mod record;
