//! Schema for the SeaORM billing store.
//!
//! ```rust,ignore
//! use sea_orm_migration::MigratorTrait;
//! use tollgate::billing::migration::Migrator;
//!
//! Migrator::up(&db, None).await?;
//! ```

use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(CreateBillingTables)]
    }
}

#[derive(DeriveMigrationName)]
pub struct CreateBillingTables;

#[derive(DeriveIden)]
enum PaymentPlans {
    Table,
    Id,
    Name,
    Description,
    PlanType,
    Price,
    Currency,
    BillingCycle,
    Features,
    Limits,
    IsActive,
    IsDefault,
    SortOrder,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum BillingPolicies {
    Table,
    Id,
    Version,
    Settings,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum UserSubscriptions {
    Table,
    Id,
    UserId,
    PlanId,
    Status,
    StartsAt,
    ExpiresAt,
    CancelledAt,
    TransactionKey,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum PaymentTransactions {
    Table,
    Id,
    IdempotencyKey,
    UserId,
    PlanId,
    TransactionType,
    Amount,
    Currency,
    Status,
    GatewayReference,
    PaymentChannel,
    PhoneNumber,
    ReferenceId,
    Description,
    Metadata,
    CreatedAt,
    UpdatedAt,
    PaidAt,
    CompletedAt,
}

#[async_trait::async_trait]
impl MigrationTrait for CreateBillingTables {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(PaymentPlans::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(PaymentPlans::Id).string().not_null().primary_key())
                    .col(ColumnDef::new(PaymentPlans::Name).string().not_null())
                    .col(ColumnDef::new(PaymentPlans::Description).text())
                    .col(ColumnDef::new(PaymentPlans::PlanType).string().not_null())
                    .col(ColumnDef::new(PaymentPlans::Price).big_integer().not_null())
                    .col(ColumnDef::new(PaymentPlans::Currency).string_len(3).not_null())
                    .col(ColumnDef::new(PaymentPlans::BillingCycle).string())
                    .col(ColumnDef::new(PaymentPlans::Features).json_binary().not_null())
                    .col(ColumnDef::new(PaymentPlans::Limits).json_binary().not_null())
                    .col(ColumnDef::new(PaymentPlans::IsActive).boolean().not_null().default(true))
                    .col(ColumnDef::new(PaymentPlans::IsDefault).boolean().not_null().default(false))
                    .col(ColumnDef::new(PaymentPlans::SortOrder).integer().not_null().default(0))
                    .col(ColumnDef::new(PaymentPlans::CreatedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(PaymentPlans::UpdatedAt).timestamp_with_time_zone().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(BillingPolicies::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(BillingPolicies::Id).integer().not_null().primary_key())
                    .col(ColumnDef::new(BillingPolicies::Version).big_integer().not_null())
                    .col(ColumnDef::new(BillingPolicies::Settings).json_binary().not_null())
                    .col(ColumnDef::new(BillingPolicies::UpdatedAt).timestamp_with_time_zone().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(UserSubscriptions::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(UserSubscriptions::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(UserSubscriptions::UserId).string().not_null())
                    .col(ColumnDef::new(UserSubscriptions::PlanId).string().not_null())
                    .col(ColumnDef::new(UserSubscriptions::Status).string().not_null())
                    .col(ColumnDef::new(UserSubscriptions::StartsAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(UserSubscriptions::ExpiresAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(UserSubscriptions::CancelledAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(UserSubscriptions::TransactionKey).string())
                    .col(ColumnDef::new(UserSubscriptions::CreatedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(UserSubscriptions::UpdatedAt).timestamp_with_time_zone().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .from(UserSubscriptions::Table, UserSubscriptions::PlanId)
                            .to(PaymentPlans::Table, PaymentPlans::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_user_subscriptions_user_status")
                    .table(UserSubscriptions::Table)
                    .col(UserSubscriptions::UserId)
                    .col(UserSubscriptions::Status)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(PaymentTransactions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PaymentTransactions::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(PaymentTransactions::IdempotencyKey)
                            .string_len(128)
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(PaymentTransactions::UserId).string().not_null())
                    .col(ColumnDef::new(PaymentTransactions::PlanId).string())
                    .col(ColumnDef::new(PaymentTransactions::TransactionType).string().not_null())
                    .col(ColumnDef::new(PaymentTransactions::Amount).big_integer().not_null())
                    .col(ColumnDef::new(PaymentTransactions::Currency).string_len(3).not_null())
                    .col(ColumnDef::new(PaymentTransactions::Status).string().not_null())
                    .col(ColumnDef::new(PaymentTransactions::GatewayReference).string())
                    .col(ColumnDef::new(PaymentTransactions::PaymentChannel).string())
                    .col(ColumnDef::new(PaymentTransactions::PhoneNumber).string())
                    .col(ColumnDef::new(PaymentTransactions::ReferenceId).string())
                    .col(ColumnDef::new(PaymentTransactions::Description).text())
                    .col(ColumnDef::new(PaymentTransactions::Metadata).json_binary().not_null())
                    .col(ColumnDef::new(PaymentTransactions::CreatedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(PaymentTransactions::UpdatedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(PaymentTransactions::PaidAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(PaymentTransactions::CompletedAt).timestamp_with_time_zone())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_payment_transactions_status_created")
                    .table(PaymentTransactions::Table)
                    .col(PaymentTransactions::Status)
                    .col(PaymentTransactions::CreatedAt)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_payment_transactions_user")
                    .table(PaymentTransactions::Table)
                    .col(PaymentTransactions::UserId)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        // One active subscription per user, enforced by the database as well
        if manager.get_database_backend() == sea_orm::DatabaseBackend::Postgres {
            manager
                .get_connection()
                .execute_unprepared(
                    "CREATE UNIQUE INDEX IF NOT EXISTS idx_user_subscriptions_one_active \
                     ON user_subscriptions (user_id) WHERE status = 'active'",
                )
                .await?;
        }

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(PaymentTransactions::Table).if_exists().to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(UserSubscriptions::Table).if_exists().to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(BillingPolicies::Table).if_exists().to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(PaymentPlans::Table).if_exists().to_owned())
            .await?;
        Ok(())
    }
}
