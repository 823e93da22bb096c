pub mod alias;
pub mod brand;
pub mod clean;
pub mod units;
