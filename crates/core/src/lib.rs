pub mod capture;
pub mod config;
pub mod emotion;
pub mod media;
pub mod present;
pub mod session;
