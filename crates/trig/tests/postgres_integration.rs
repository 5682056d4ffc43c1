//! Postgres-backed tests.
//!
//! Run with `cargo test -p trig --features test-postgres` (needs docker).

#![cfg(feature = "test-postgres")]

use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio_postgres::{Client, NoTls};
use trig::migrate::{MigrationState, SqlMigration};
use trig::{
    Action, Actor, Caller, Catalog, DriftState, Error, Event, Gate, KillSwitch, Migration,
    MigrationRunner, Registry, Role, RoleChecker, SampleRow, Sandbox, TriggerDefinition,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trig=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

async fn start() -> (ContainerAsync<Postgres>, Client) {
    init_tracing();
    let node = Postgres::default().start().await.unwrap();
    let port = node.get_host_port_ipv4(5432).await.unwrap();
    let (client, connection) = tokio_postgres::connect(
        &format!("host=127.0.0.1 port={port} user=postgres password=postgres dbname=postgres"),
        NoTls,
    )
    .await
    .unwrap();
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("connection error: {e}");
        }
    });
    (node, client)
}

fn admin() -> Caller {
    Caller::new(Actor::new("user").id("ops").role(Role::Admin))
}

async fn count(client: &Client, sql: &str) -> i64 {
    client.query_one(sql, &[]).await.unwrap().get(0)
}

async fn user_triggers(client: &Client) -> i64 {
    count(
        client,
        "SELECT count(*) FROM pg_trigger WHERE NOT tgisinternal AND tgrelid = 'users'::regclass",
    )
    .await
}

const USERS_TABLE: &str = "CREATE TABLE IF NOT EXISTS users (id BIGSERIAL PRIMARY KEY, email TEXT NOT NULL)";

const AUDIT_FUNCTION: &str = "CREATE OR REPLACE FUNCTION log_user_change() RETURNS trigger AS $$
BEGIN
  INSERT INTO audit_log (table_name, row_id) VALUES (TG_TABLE_NAME, NEW.id);
  RETURN NEW;
END;
$$ LANGUAGE plpgsql";

fn three_migrations() -> Vec<Migration> {
    vec![
        Migration::sql(
            20231215120001,
            "create_users",
            &format!("{USERS_TABLE};"),
            "DROP TABLE IF EXISTS users;",
        ),
        Migration::sql(
            20231215120002,
            "create_audit_log",
            "CREATE TABLE IF NOT EXISTS audit_log (id BIGSERIAL PRIMARY KEY, table_name TEXT NOT NULL, row_id BIGINT);",
            "DROP TABLE IF EXISTS audit_log;",
        ),
        Migration::sql(
            20231215120003,
            "add_audit_trigger",
            &format!(
                "{AUDIT_FUNCTION};\nCREATE OR REPLACE TRIGGER audit_users AFTER INSERT ON users FOR EACH ROW EXECUTE FUNCTION log_user_change();"
            ),
            "DROP TRIGGER IF EXISTS audit_users ON users;\nDROP FUNCTION IF EXISTS log_user_change();",
        ),
    ]
}

fn audit_users() -> TriggerDefinition {
    TriggerDefinition::builder("audit_users")
        .table("users")
        .after()
        .on(Event::Insert)
        .function("log_user_change")
        .function_body(AUDIT_FUNCTION)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_three_migrations_pending_apply_rollback() {
    let (_node, client) = start().await;
    let gate = Gate::allow_all();
    let runner = MigrationRunner::new(&client, &gate, three_migrations());

    assert_eq!(runner.current_version().await.unwrap(), 0);
    let pending: Vec<i64> = runner
        .pending(None)
        .await
        .unwrap()
        .iter()
        .map(|m| m.version)
        .collect();
    assert_eq!(pending, [20231215120001, 20231215120002, 20231215120003]);

    let bounded = runner.pending(Some(20231215120002)).await.unwrap();
    assert_eq!(bounded.len(), 2);

    let applied = runner.apply(&admin(), Some(20231215120002)).await.unwrap();
    assert_eq!(applied.len(), 2);
    assert_eq!(runner.current_version().await.unwrap(), 20231215120002);

    let applied = runner.apply(&admin(), None).await.unwrap();
    assert_eq!(applied.len(), 1);
    assert_eq!(runner.current_version().await.unwrap(), 20231215120003);
    assert_eq!(user_triggers(&client).await, 1);
    assert!(runner.pending(None).await.unwrap().is_empty());

    let status = runner.status().await.unwrap();
    assert!(status.iter().all(|s| s.state == MigrationState::Applied));
    assert!(status.iter().all(|s| s.applied_at.is_some()));

    // Roll back to an explicit target: only the migration above it goes.
    let rolled: Vec<i64> = runner
        .rollback(&admin(), Some(20231215120002))
        .await
        .unwrap()
        .iter()
        .map(|m| m.version)
        .collect();
    assert_eq!(rolled, [20231215120003]);
    let markers: Vec<i64> = runner
        .applied()
        .await
        .unwrap()
        .iter()
        .map(|a| a.version)
        .collect();
    assert_eq!(markers, [20231215120001, 20231215120002]);
    assert_eq!(user_triggers(&client).await, 0);
    assert_eq!(runner.current_version().await.unwrap(), 20231215120002);

    // Re-apply, then roll back just the current migration.
    runner.apply(&admin(), None).await.unwrap();
    assert_eq!(user_triggers(&client).await, 1);
    let rolled: Vec<i64> = runner
        .rollback(&admin(), None)
        .await
        .unwrap()
        .iter()
        .map(|m| m.version)
        .collect();
    assert_eq!(rolled, [20231215120003]);
    assert_eq!(user_triggers(&client).await, 0);
    assert_eq!(runner.current_version().await.unwrap(), 20231215120002);

    // Everything else, newest first.
    let rolled: Vec<i64> = runner
        .rollback(&admin(), Some(0))
        .await
        .unwrap()
        .iter()
        .map(|m| m.version)
        .collect();
    assert_eq!(rolled, [20231215120002, 20231215120001]);
    assert_eq!(runner.current_version().await.unwrap(), 0);
    assert!(!Catalog::new(&client, "public").table_exists("users").await.unwrap());
}

#[tokio::test]
async fn test_apply_then_rollback_restores_state() {
    let (_node, client) = start().await;
    let gate = Gate::allow_all();
    let runner = MigrationRunner::new(&client, &gate, three_migrations());

    runner.apply(&admin(), Some(20231215120001)).await.unwrap();
    let before = runner.applied().await.unwrap();

    runner.apply(&admin(), None).await.unwrap();
    runner.rollback(&admin(), Some(20231215120001)).await.unwrap();

    assert_eq!(runner.applied().await.unwrap(), before);
    let catalog = Catalog::new(&client, "public");
    assert!(catalog.table_exists("users").await.unwrap());
    assert!(!catalog.table_exists("audit_log").await.unwrap());
    assert!(!catalog.function_exists("log_user_change").await.unwrap());
}

#[tokio::test]
async fn test_apply_errors_leave_version_table_unchanged() {
    let (_node, client) = start().await;
    let gate = Gate::allow_all();
    let runner = MigrationRunner::new(&client, &gate, three_migrations());
    runner.apply(&admin(), Some(20231215120001)).await.unwrap();
    let before = runner.applied().await.unwrap();

    let err = runner.apply(&admin(), Some(99)).await.unwrap_err();
    assert!(matches!(err, Error::MigrationNotFound { version: 99 }));

    let err = runner.apply(&admin(), Some(20231215120001)).await.unwrap_err();
    assert!(matches!(
        err,
        Error::AlreadyApplied {
            version: 20231215120001
        }
    ));

    assert_eq!(runner.applied().await.unwrap(), before);
}

#[tokio::test]
async fn test_failed_migration_rolls_back_its_statements() {
    let (_node, client) = start().await;
    let gate = Gate::allow_all();
    let broken = vec![Migration::new(
        1,
        "half_done",
        SqlMigration::parse(
            "CREATE TABLE IF NOT EXISTS half_done (id INT);\nINSERT INTO missing_table VALUES (1);",
        ),
    )];
    let runner = MigrationRunner::new(&client, &gate, broken);

    let err = runner.apply(&admin(), None).await.unwrap_err();
    assert!(matches!(err, Error::Execution { .. }), "{err}");
    assert_eq!(runner.current_version().await.unwrap(), 0);
    assert!(
        !Catalog::new(&client, "public")
            .table_exists("half_done")
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_unsafe_migration_is_refused() {
    let (_node, client) = start().await;
    let gate = Gate::allow_all();
    let migrations = vec![Migration::sql(1, "bare_drop", "DROP TABLE users;", "")];

    let runner = MigrationRunner::new(&client, &gate, migrations);
    let err = runner.apply(&admin(), None).await.unwrap_err();
    assert!(matches!(err, Error::Safety { .. }), "{err}");
    assert_eq!(runner.current_version().await.unwrap(), 0);
}

#[tokio::test]
async fn test_unsafe_down_is_refused() {
    let (_node, client) = start().await;
    let gate = Gate::allow_all();
    let migrations = vec![Migration::sql(
        1,
        "add_function",
        AUDIT_FUNCTION,
        "DROP FUNCTION log_user_change();",
    )];
    let runner = MigrationRunner::new(&client, &gate, migrations.clone());
    runner.apply(&admin(), None).await.unwrap();

    let err = runner.rollback(&admin(), None).await.unwrap_err();
    assert!(matches!(err, Error::Safety { .. }), "{err}");
    assert_eq!(runner.current_version().await.unwrap(), 1);
    assert!(
        Catalog::new(&client, "public")
            .function_exists("log_user_change")
            .await
            .unwrap()
    );

    let runner = MigrationRunner::new(&client, &gate, migrations).allow_unsafe(true);
    runner.rollback(&admin(), None).await.unwrap();
    assert_eq!(runner.current_version().await.unwrap(), 0);
}

#[tokio::test]
async fn test_registry_reads_on_fresh_database() {
    let (_node, client) = start().await;
    let gate = Gate::allow_all();
    let registry = Registry::new(&client, &gate);

    assert!(registry.list().await.unwrap().is_empty());
    assert!(registry.detector().detect_all().await.unwrap().is_empty());

    let runner = MigrationRunner::new(&client, &gate, Vec::<Migration>::new());
    assert!(
        runner
            .cleanup_orphaned_registry_entries(&admin())
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_audit_users_drift() {
    let (_node, client) = start().await;
    let gate = Gate::allow_all();
    client
        .batch_execute(&format!(
            "{USERS_TABLE}; CREATE TABLE audit_log (id BIGSERIAL PRIMARY KEY, table_name TEXT, row_id BIGINT);"
        ))
        .await
        .unwrap();

    let registry = Registry::new(&client, &gate);
    registry.ensure_table().await.unwrap();
    let def = audit_users();
    let entry = registry.register(&admin(), &def).await.unwrap();
    assert_eq!(entry.checksum, trig::checksum(&def));

    // Registered but never created.
    let dropped = registry.dropped().await.unwrap();
    assert_eq!(dropped.len(), 1);
    assert_eq!(dropped[0].trigger_name, "audit_users");

    client.batch_execute(AUDIT_FUNCTION).await.unwrap();
    client.batch_execute(&def.create_trigger_sql()).await.unwrap();
    let in_sync = registry.in_sync().await.unwrap();
    assert_eq!(in_sync.len(), 1);
    registry.validate().await.unwrap();

    // Someone edits the function by hand.
    client
        .batch_execute(
            "CREATE OR REPLACE FUNCTION log_user_change() RETURNS trigger AS $$
BEGIN
  RETURN NEW;
END;
$$ LANGUAGE plpgsql",
        )
        .await
        .unwrap();
    let drifted = registry.drifted().await.unwrap();
    assert_eq!(drifted.len(), 1);
    assert!(drifted[0].differences.iter().any(|d| d.field == "function_body"));
    let report = registry.diff(Some("audit_users")).await.unwrap();
    assert!(report.contains("function_body"), "{report}");

    // A trigger nobody registered.
    client
        .batch_execute(
            "CREATE TRIGGER stray_users BEFORE UPDATE ON users FOR EACH ROW EXECUTE FUNCTION log_user_change()",
        )
        .await
        .unwrap();
    let unknown = registry.unknown_triggers().await.unwrap();
    assert_eq!(unknown.len(), 1);
    assert_eq!(unknown[0].trigger_name, "stray_users");

    // Each trigger lands in exactly one state.
    let all = registry.detector().detect_all().await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(
        all.iter()
            .all(|e| matches!(e.state, DriftState::Drifted | DriftState::Unknown))
    );

    client
        .batch_execute("DROP TRIGGER audit_users ON users")
        .await
        .unwrap();
    assert_eq!(registry.dropped().await.unwrap().len(), 1);
    let runner = MigrationRunner::new(&client, &gate, Vec::<Migration>::new());
    assert_eq!(
        runner
            .cleanup_orphaned_registry_entries(&admin())
            .await
            .unwrap(),
        ["audit_users"]
    );
    assert!(registry.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sandbox_leaves_database_unchanged() {
    let (_node, client) = start().await;
    client
        .batch_execute(&format!(
            "{USERS_TABLE}; CREATE TABLE audit_log (id BIGSERIAL PRIMARY KEY, table_name TEXT, row_id BIGINT);"
        ))
        .await
        .unwrap();
    let functions = "SELECT count(*) FROM pg_proc WHERE proname = 'log_user_change'";

    let sandbox = Sandbox::new(&client);
    let sample = SampleRow::new().set("email", "a@example.com");
    let report = sandbox.test_execute(&audit_users(), Some(&sample)).await;
    assert!(report.success(), "{report}");
    assert!(report.rolled_back);
    assert_eq!(report.output.len(), 4);

    assert_eq!(user_triggers(&client).await, 0);
    assert_eq!(count(&client, functions).await, 0);
    assert_eq!(count(&client, "SELECT count(*) FROM users").await, 0);
    assert_eq!(count(&client, "SELECT count(*) FROM audit_log").await, 0);

    // Malformed sample data is reported, not raised, and still rolled back.
    let bad = SampleRow::new().set("no_such_column", "x");
    let report = sandbox.test_execute(&audit_users(), Some(&bad)).await;
    assert!(!report.success());
    assert!(report.trigger_created);
    assert!(report.errors[0].starts_with("Error executing test insert"));
    assert_eq!(user_triggers(&client).await, 0);

    let syntax = sandbox.syntax_validate(&audit_users()).await;
    assert!(syntax.valid(), "{syntax:?}");
    let function = sandbox.function_test(&audit_users()).await;
    assert!(function.success(), "{function:?}");
    assert_eq!(count(&client, functions).await, 0);

    // The connection is still usable after all of that.
    assert_eq!(count(&client, "SELECT 1::int8").await, 1);
}

#[tokio::test]
async fn test_sandbox_refuses_to_commit() {
    let (_node, client) = start().await;
    client
        .batch_execute(&format!(
            "{USERS_TABLE}; CREATE TABLE audit_log (id BIGSERIAL PRIMARY KEY, table_name TEXT, row_id BIGINT);"
        ))
        .await
        .unwrap();
    let leaked = "SELECT count(*) FROM pg_class WHERE relname = 'leaked'";

    let smuggling = TriggerDefinition::builder("audit_users")
        .table("users")
        .after()
        .on(Event::Insert)
        .function("log_user_change")
        .function_body(format!(
            "{AUDIT_FUNCTION}; COMMIT; CREATE TABLE leaked (x int); INSERT INTO users (email) VALUES ('persisted')"
        ))
        .build()
        .unwrap();

    let sandbox = Sandbox::new(&client);
    let report = sandbox.test_execute(&smuggling, None).await;
    assert!(!report.success());
    assert!(!report.function_created);
    assert!(report.errors[0].contains("expected one statement"), "{report}");
    let function = sandbox.function_test(&smuggling).await;
    assert!(!function.success());
    let syntax = sandbox.syntax_validate(&smuggling).await;
    assert!(!syntax.valid());

    assert_eq!(count(&client, leaked).await, 0);
    assert_eq!(count(&client, "SELECT count(*) FROM users").await, 0);
    assert_eq!(user_triggers(&client).await, 0);

    // Work that ends the transaction itself is reported, not passed off as
    // rolled back.
    let result = trig::tx::rolled_back(&client, async |conn: &Client| {
        conn.batch_execute("COMMIT; CREATE TABLE leaked (x int)")
            .await
            .unwrap();
    })
    .await;
    assert!(
        matches!(result, Err(Error::TransactionClosed { .. })),
        "{result:?}"
    );
    assert_eq!(count(&client, leaked).await, 1);
    assert_eq!(count(&client, "SELECT 1::int8").await, 1);
}

#[tokio::test]
async fn test_registry_toggle_and_drop() {
    let (_node, client) = start().await;
    client.batch_execute(USERS_TABLE).await.unwrap();
    client
        .batch_execute(
            "CREATE TABLE audit_log (id BIGSERIAL PRIMARY KEY, table_name TEXT, row_id BIGINT)",
        )
        .await
        .unwrap();
    client.batch_execute(AUDIT_FUNCTION).await.unwrap();
    client
        .batch_execute(&audit_users().create_trigger_sql())
        .await
        .unwrap();

    let gate = Gate::new(RoleChecker).with_kill_switch(KillSwitch::armed());
    let registry = Registry::new(&client, &gate);
    registry.ensure_table().await.unwrap();
    registry.register(&admin(), &audit_users()).await.unwrap();

    let operator = Caller::new(Actor::new("user").id("dev").role(Role::Operator));
    let entry = registry
        .set_enabled(&operator, "audit_users", false)
        .await
        .unwrap();
    assert!(!entry.enabled);
    let live = Catalog::new(&client, "public")
        .trigger("audit_users")
        .await
        .unwrap()
        .unwrap();
    assert!(!live.enabled);

    let viewer = Caller::new(Actor::new("user").id("guest").role(Role::Viewer));
    let err = registry
        .set_enabled(&viewer, "audit_users", true)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Permission { .. }));
    let err = registry
        .register(&viewer, &audit_users())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Permission { .. }));

    let err = registry
        .drop_trigger(&admin(), "audit_users", "replaced by v2")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::KillSwitch { .. }), "{err}");

    let confirmed = admin().confirm(Action::DropTrigger.confirmation_token());
    let err = registry
        .drop_trigger(&confirmed, "audit_users", "  ")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation { .. }));

    registry
        .drop_trigger(&confirmed, "audit_users", "replaced by v2")
        .await
        .unwrap();
    assert_eq!(user_triggers(&client).await, 0);
    assert!(registry.get("audit_users").await.unwrap().is_none());

    let err = registry
        .drop_trigger(&confirmed, "audit_users", "again")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_cleanup_orphaned_registry_entries() {
    let (_node, client) = start().await;
    client.batch_execute(USERS_TABLE).await.unwrap();
    let gate = Gate::allow_all();
    let registry = Registry::new(&client, &gate);
    registry.ensure_table().await.unwrap();
    registry.register(&admin(), &audit_users()).await.unwrap();

    let runner = MigrationRunner::new(&client, &gate, Vec::<Migration>::new());
    let removed = runner
        .cleanup_orphaned_registry_entries(&admin())
        .await
        .unwrap();
    assert_eq!(removed, ["audit_users"]);
    assert!(registry.list().await.unwrap().is_empty());
}
