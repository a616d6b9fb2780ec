pub mod config;
pub mod doctor;
pub mod provision;
pub mod worker;
