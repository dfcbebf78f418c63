#![deny(dead_code)]
#![deny(unused_imports)]

pub mod config;
pub mod minimizer;
pub mod model;
pub mod params;
pub mod policy;
pub mod teststat;
pub mod toys;
pub mod transforms;
