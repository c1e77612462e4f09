pub mod cancel;
pub mod job;
