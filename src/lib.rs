pub mod aggregate;
pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod driver;
pub mod geo;
pub mod normalize;
pub mod report;
pub mod search;
