pub use sea_orm_migration::prelude::*;

mod m20260301_000001_create_epochs;
mod m20260301_000002_create_rewards;
mod m20260301_000003_create_send_records;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20260301_000001_create_epochs::Migration),
            Box::new(m20260301_000002_create_rewards::Migration),
            Box::new(m20260301_000003_create_send_records::Migration),
        ]
    }
}
