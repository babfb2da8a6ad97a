//! The infrastructure needed to configure and run a batch of simulations.

pub mod configuration;
pub mod controller;
pub mod logger;
pub mod main;
pub mod sim_config;
