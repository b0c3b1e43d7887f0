use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240601_000001_create_party_tables::Migration),
            Box::new(m20240601_000002_create_orders_tables::Migration),
            Box::new(m20240601_000003_create_bookings_table::Migration),
            Box::new(m20240601_000004_create_escrow_and_credit_tables::Migration),
            Box::new(m20240601_000005_create_fulfillment_claims_table::Migration),
            Box::new(m20240601_000006_create_notification_tables::Migration),
        ]
    }
}

mod m20240601_000001_create_party_tables {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000001_create_party_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Accounts::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Accounts::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Accounts::Email).string().not_null().unique_key())
                        .col(ColumnDef::new(Accounts::DisplayName).string().not_null())
                        .col(ColumnDef::new(Accounts::CreatedAt).timestamp_with_time_zone().not_null())
                        .col(ColumnDef::new(Accounts::UpdatedAt).timestamp_with_time_zone().not_null())
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Guardians::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Guardians::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Guardians::AccountId).uuid().not_null())
                        .col(ColumnDef::new(Guardians::FirstName).string().not_null())
                        .col(ColumnDef::new(Guardians::LastName).string().not_null())
                        .col(ColumnDef::new(Guardians::Email).string().not_null().unique_key())
                        .col(ColumnDef::new(Guardians::Phone).string().null())
                        .col(ColumnDef::new(Guardians::EmergencyContactName).string().null())
                        .col(ColumnDef::new(Guardians::EmergencyContactPhone).string().null())
                        .col(
                            ColumnDef::new(Guardians::EmergencyContactRelationship)
                                .string()
                                .null(),
                        )
                        .col(ColumnDef::new(Guardians::MedicalNotes).text().null())
                        .col(ColumnDef::new(Guardians::CreatedAt).timestamp_with_time_zone().not_null())
                        .col(ColumnDef::new(Guardians::UpdatedAt).timestamp_with_time_zone().not_null())
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Minors::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Minors::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Minors::GuardianId).uuid().not_null())
                        .col(ColumnDef::new(Minors::FirstName).string().not_null())
                        .col(ColumnDef::new(Minors::LastName).string().not_null())
                        .col(ColumnDef::new(Minors::DateOfBirth).date().null())
                        .col(ColumnDef::new(Minors::ShirtSize).string().null())
                        .col(ColumnDef::new(Minors::Team).string().null())
                        .col(ColumnDef::new(Minors::Position).string().null())
                        .col(ColumnDef::new(Minors::CreatedAt).timestamp_with_time_zone().not_null())
                        .col(ColumnDef::new(Minors::UpdatedAt).timestamp_with_time_zone().not_null())
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_minors_guardian_name")
                        .table(Minors::Table)
                        .col(Minors::GuardianId)
                        .col(Minors::FirstName)
                        .col(Minors::LastName)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Providers::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Providers::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Providers::DisplayName).string().not_null())
                        .col(ColumnDef::new(Providers::Email).string().not_null())
                        .col(ColumnDef::new(Providers::Active).boolean().not_null().default(true))
                        .col(ColumnDef::new(Providers::CreatedAt).timestamp_with_time_zone().not_null())
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Providers::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Minors::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Guardians::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Accounts::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Accounts {
        Table,
        Id,
        Email,
        DisplayName,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum Guardians {
        Table,
        Id,
        AccountId,
        FirstName,
        LastName,
        Email,
        Phone,
        EmergencyContactName,
        EmergencyContactPhone,
        EmergencyContactRelationship,
        MedicalNotes,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum Minors {
        Table,
        Id,
        GuardianId,
        FirstName,
        LastName,
        DateOfBirth,
        ShirtSize,
        Team,
        Position,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum Providers {
        Table,
        Id,
        DisplayName,
        Email,
        Active,
        CreatedAt,
    }
}

mod m20240601_000002_create_orders_tables {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000002_create_orders_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Orders::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Orders::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Orders::OrderNumber).string().not_null().unique_key())
                        .col(ColumnDef::new(Orders::GuardianId).uuid().not_null())
                        .col(
                            ColumnDef::new(Orders::PaymentReference)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Orders::Status).string().not_null())
                        .col(ColumnDef::new(Orders::PaymentStatus).string().not_null())
                        .col(
                            ColumnDef::new(Orders::SubtotalCents)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Orders::FeesCents)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Orders::TotalCents)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Orders::Currency).string().not_null())
                        .col(ColumnDef::new(Orders::BuyerEmail).string().not_null())
                        .col(ColumnDef::new(Orders::Notes).text().null())
                        .col(ColumnDef::new(Orders::CreatedAt).timestamp_with_time_zone().not_null())
                        .col(ColumnDef::new(Orders::UpdatedAt).timestamp_with_time_zone().not_null())
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_guardian_id")
                        .table(Orders::Table)
                        .col(Orders::GuardianId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(OrderItems::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(OrderItems::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(OrderItems::OrderId).uuid().not_null())
                        .col(ColumnDef::new(OrderItems::Kind).string().not_null())
                        .col(ColumnDef::new(OrderItems::Sku).string().null())
                        .col(ColumnDef::new(OrderItems::Name).string().not_null())
                        .col(ColumnDef::new(OrderItems::Quantity).integer().not_null())
                        .col(ColumnDef::new(OrderItems::UnitPriceCents).big_integer().not_null())
                        .col(ColumnDef::new(OrderItems::LineTotalCents).big_integer().not_null())
                        .col(ColumnDef::new(OrderItems::CreatedAt).timestamp_with_time_zone().not_null())
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_order_items_order_id")
                                .from(OrderItems::Table, OrderItems::OrderId)
                                .to(Orders::Table, Orders::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_order_items_order_id")
                        .table(OrderItems::Table)
                        .col(OrderItems::OrderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(OrderItems::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Orders::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Orders {
        Table,
        Id,
        OrderNumber,
        GuardianId,
        PaymentReference,
        Status,
        PaymentStatus,
        SubtotalCents,
        FeesCents,
        TotalCents,
        Currency,
        BuyerEmail,
        Notes,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum OrderItems {
        Table,
        Id,
        OrderId,
        Kind,
        Sku,
        Name,
        Quantity,
        UnitPriceCents,
        LineTotalCents,
        CreatedAt,
    }
}

/// Current booking layout. Older deployments keep the legacy column names; the
/// booking writer detects which set is present.
mod m20240601_000003_create_bookings_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000003_create_bookings_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Bookings::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Bookings::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Bookings::BookingNumber).string().not_null().unique_key())
                        .col(ColumnDef::new(Bookings::ProviderId).uuid().not_null())
                        .col(ColumnDef::new(Bookings::GuardianId).uuid().not_null())
                        .col(ColumnDef::new(Bookings::MinorIds).text().not_null())
                        .col(ColumnDef::new(Bookings::PackageType).string().not_null())
                        .col(ColumnDef::new(Bookings::TotalSessions).integer().not_null())
                        .col(ColumnDef::new(Bookings::SessionsRemaining).integer().not_null())
                        .col(ColumnDef::new(Bookings::AmountPaidCents).big_integer().not_null())
                        .col(ColumnDef::new(Bookings::PlatformFeeCents).big_integer().not_null())
                        .col(ColumnDef::new(Bookings::ProviderPayoutCents).big_integer().not_null())
                        .col(ColumnDef::new(Bookings::FeeRateBps).integer().not_null())
                        .col(ColumnDef::new(Bookings::Currency).string().not_null())
                        .col(
                            ColumnDef::new(Bookings::PaymentIntentId)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Bookings::Status).string().not_null())
                        .col(ColumnDef::new(Bookings::SessionStart).timestamp_with_time_zone().null())
                        .col(
                            ColumnDef::new(Bookings::EscrowFailed)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(Bookings::CreditsFailed)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(ColumnDef::new(Bookings::CreatedAt).timestamp_with_time_zone().not_null())
                        .col(ColumnDef::new(Bookings::UpdatedAt).timestamp_with_time_zone().not_null())
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_bookings_provider_id")
                        .table(Bookings::Table)
                        .col(Bookings::ProviderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Bookings::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Bookings {
        Table,
        Id,
        BookingNumber,
        ProviderId,
        GuardianId,
        MinorIds,
        PackageType,
        TotalSessions,
        SessionsRemaining,
        AmountPaidCents,
        PlatformFeeCents,
        ProviderPayoutCents,
        FeeRateBps,
        Currency,
        PaymentIntentId,
        Status,
        SessionStart,
        EscrowFailed,
        CreditsFailed,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240601_000004_create_escrow_and_credit_tables {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000004_create_escrow_and_credit_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(EscrowHolds::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(EscrowHolds::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(EscrowHolds::BookingId).uuid().not_null().unique_key())
                        .col(ColumnDef::new(EscrowHolds::PaymentIntentId).string().not_null())
                        .col(ColumnDef::new(EscrowHolds::AmountCents).big_integer().not_null())
                        .col(ColumnDef::new(EscrowHolds::Currency).string().not_null())
                        .col(ColumnDef::new(EscrowHolds::State).string().not_null())
                        .col(ColumnDef::new(EscrowHolds::CreatedAt).timestamp_with_time_zone().not_null())
                        .col(ColumnDef::new(EscrowHolds::ReleasedAt).timestamp_with_time_zone().null())
                        .col(ColumnDef::new(EscrowHolds::RefundedAt).timestamp_with_time_zone().null())
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(PackageCredits::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(PackageCredits::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(PackageCredits::GuardianId).uuid().not_null())
                        .col(ColumnDef::new(PackageCredits::ProviderId).uuid().not_null())
                        .col(ColumnDef::new(PackageCredits::BookingId).uuid().null())
                        .col(ColumnDef::new(PackageCredits::PackageType).string().not_null())
                        .col(ColumnDef::new(PackageCredits::TotalCredits).integer().not_null())
                        .col(ColumnDef::new(PackageCredits::Remaining).integer().not_null())
                        .col(
                            ColumnDef::new(PackageCredits::PricePerSessionCents)
                                .big_integer()
                                .not_null(),
                        )
                        .col(ColumnDef::new(PackageCredits::AmountPaidCents).big_integer().not_null())
                        .col(
                            ColumnDef::new(PackageCredits::PaymentIntentId)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(PackageCredits::ExpiresAt).timestamp_with_time_zone().not_null())
                        .col(ColumnDef::new(PackageCredits::CreatedAt).timestamp_with_time_zone().not_null())
                        .col(ColumnDef::new(PackageCredits::UpdatedAt).timestamp_with_time_zone().not_null())
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_package_credits_guardian_provider")
                        .table(PackageCredits::Table)
                        .col(PackageCredits::GuardianId)
                        .col(PackageCredits::ProviderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(PackageCredits::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(EscrowHolds::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum EscrowHolds {
        Table,
        Id,
        BookingId,
        PaymentIntentId,
        AmountCents,
        Currency,
        State,
        CreatedAt,
        ReleasedAt,
        RefundedAt,
    }

    #[derive(DeriveIden)]
    enum PackageCredits {
        Table,
        Id,
        GuardianId,
        ProviderId,
        BookingId,
        PackageType,
        TotalCredits,
        Remaining,
        PricePerSessionCents,
        AmountPaidCents,
        PaymentIntentId,
        ExpiresAt,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240601_000005_create_fulfillment_claims_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000005_create_fulfillment_claims_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(FulfillmentClaims::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(FulfillmentClaims::ClaimKey)
                                .string()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(FulfillmentClaims::State).string().not_null())
                        .col(ColumnDef::new(FulfillmentClaims::ClaimToken).string().not_null())
                        .col(
                            ColumnDef::new(FulfillmentClaims::ExpiresAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(ColumnDef::new(FulfillmentClaims::OrderId).uuid().null())
                        .col(ColumnDef::new(FulfillmentClaims::BookingId).uuid().null())
                        .col(ColumnDef::new(FulfillmentClaims::BookingNumber).string().null())
                        .col(ColumnDef::new(FulfillmentClaims::SessionToken).string().null())
                        .col(ColumnDef::new(FulfillmentClaims::ClientSecretHash).string().null())
                        .col(
                            ColumnDef::new(FulfillmentClaims::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(FulfillmentClaims::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(FulfillmentClaims::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum FulfillmentClaims {
        Table,
        ClaimKey,
        State,
        ClaimToken,
        ExpiresAt,
        OrderId,
        BookingId,
        BookingNumber,
        SessionToken,
        ClientSecretHash,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240601_000006_create_notification_tables {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000006_create_notification_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(NotificationLog::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(NotificationLog::Id).uuid().primary_key().not_null())
                        .col(
                            ColumnDef::new(NotificationLog::DedupeKey)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(NotificationLog::TemplateKey).string().not_null())
                        .col(ColumnDef::new(NotificationLog::RecipientRole).string().not_null())
                        .col(ColumnDef::new(NotificationLog::Recipient).string().not_null())
                        .col(
                            ColumnDef::new(NotificationLog::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(ScheduledJobs::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(ScheduledJobs::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(ScheduledJobs::JobKey).string().not_null().unique_key())
                        .col(ColumnDef::new(ScheduledJobs::Kind).string().not_null())
                        .col(ColumnDef::new(ScheduledJobs::Payload).text().not_null())
                        .col(ColumnDef::new(ScheduledJobs::RunAt).timestamp_with_time_zone().not_null())
                        .col(ColumnDef::new(ScheduledJobs::Status).string().not_null())
                        .col(
                            ColumnDef::new(ScheduledJobs::Attempts)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(ScheduledJobs::LastError).text().null())
                        .col(ColumnDef::new(ScheduledJobs::CreatedAt).timestamp_with_time_zone().not_null())
                        .col(ColumnDef::new(ScheduledJobs::UpdatedAt).timestamp_with_time_zone().not_null())
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_scheduled_jobs_status_run_at")
                        .table(ScheduledJobs::Table)
                        .col(ScheduledJobs::Status)
                        .col(ScheduledJobs::RunAt)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(ScheduledJobs::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(NotificationLog::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum NotificationLog {
        Table,
        Id,
        DedupeKey,
        TemplateKey,
        RecipientRole,
        Recipient,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum ScheduledJobs {
        Table,
        Id,
        JobKey,
        Kind,
        Payload,
        RunAt,
        Status,
        Attempts,
        LastError,
        CreatedAt,
        UpdatedAt,
    }
}
