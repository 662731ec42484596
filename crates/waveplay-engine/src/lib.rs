pub mod config;
pub mod decode;
pub mod engine;
pub mod midi;
pub mod notify;
pub mod player;
pub mod resample;
pub mod ring;
pub mod transport;

mod process;
mod worker;
