pub mod baskets;
pub mod catalog;
pub mod db;
pub mod interventions;
pub mod prices;
pub mod products;
