pub mod anomalies;
pub mod dashboards;
pub mod fields;
pub mod health;
pub mod indexes;
pub mod query;
pub mod searches;
