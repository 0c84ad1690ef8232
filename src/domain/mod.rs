pub mod accumulator;
pub mod day_boundary;
pub mod models;
