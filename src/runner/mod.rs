pub mod channel;
pub mod coverage;
pub mod harness;
