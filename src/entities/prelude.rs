//! `SeaORM` Entity prelude

pub use super::epochs::Entity as Epochs;
pub use super::rewards::Entity as Rewards;
pub use super::send_records::Entity as SendRecords;
