#[path = "../common/mod.rs"]
mod common;

use std::sync::Arc;

use anyhow::Result;
use tempfile::TempDir;

use bayun_ddl::model::{ErrorClass, JobState, JobType};
use bayun_ddl::storage::codec::{prefix_end, table_prefix};
use bayun_ddl::{
    AlterOp, ColumnDef, ColumnPosition, DataType, DataValue, Ddl, DdlError, DdlRequest, Expr, MemStore, SchemaState,
    Storage,
};

use common::{Cluster, Recorder, alter, column_names, select_all, setup_t1, test_config};

fn drop_table(name: &str) -> DdlRequest {
    DdlRequest::DropTable { schema: "test".to_string(), table: name.to_string() }
}

fn table_keys(ddl: &Ddl, table_id: i64) -> Result<usize> {
    let prefix = table_prefix(table_id);
    let mut txn = ddl.store().begin()?;
    let keys = txn.scan(&prefix, &prefix_end(&prefix), usize::MAX)?.len();
    txn.rollback();
    Ok(keys)
}

#[test]
fn test_create_and_drop_table() -> Result<()> {
    let cluster = Cluster::start(2)?;
    let recorder = Recorder::new();
    cluster.set_callback(recorder.clone());
    let ddl = cluster.node(1);
    setup_t1(ddl, 6)?;

    let t1 = ddl.table("test", "t1")?;
    assert_eq!(t1.info().state, SchemaState::Public);
    assert!(table_keys(ddl, t1.id())? > 0);

    let job = ddl.execute(drop_table("t1"))?;
    assert_eq!(job.job_type(), JobType::DropTable);
    assert_eq!(
        recorder.states_of(job.id),
        vec![
            SchemaState::WriteOnly,
            SchemaState::DeleteOnly,
            SchemaState::DeleteReorganization,
            SchemaState::None
        ]
    );
    assert!(matches!(ddl.table("test", "t1"), Err(DdlError::TableNotFound(_))));
    assert_eq!(table_keys(ddl, t1.id())?, 0);

    // the name can be reused right away
    setup_t1_again(ddl)?;
    assert!(select_all(ddl, "test", "t1")?.is_empty());
    Ok(())
}

fn setup_t1_again(ddl: &Ddl) -> Result<()> {
    ddl.execute(DdlRequest::CreateTable {
        schema: "test".to_string(),
        table: "t1".to_string(),
        columns: vec![ColumnDef::new("id", DataType::Integer).not_null()],
    })?;
    Ok(())
}

#[test]
fn test_create_table_errors() -> Result<()> {
    let cluster = Cluster::start(1)?;
    let ddl = cluster.node(0);
    setup_t1(ddl, 0)?;

    assert!(matches!(
        ddl.submit(DdlRequest::CreateSchema { name: "test".to_string() }),
        Err(DdlError::SchemaExists(_))
    ));
    assert!(matches!(
        ddl.submit(DdlRequest::CreateTable { schema: "nope".to_string(), table: "t".to_string(), columns: vec![] }),
        Err(DdlError::SchemaNotFound(_))
    ));

    let cases = vec![
        ("t1", vec![ColumnDef::new("a", DataType::Integer)]),
        ("t2", vec![]),
        ("t3", vec![ColumnDef::new("a", DataType::Integer), ColumnDef::new("a", DataType::Text)]),
        ("t4", vec![ColumnDef::new("a", DataType::Integer).default_value(Expr::literal("x"))]),
    ];
    for (name, columns) in cases {
        let request = DdlRequest::CreateTable { schema: "test".to_string(), table: name.to_string(), columns };
        match ddl.execute(request) {
            Err(DdlError::JobCancelled { error, .. }) => assert_eq!(error.class, ErrorClass::Structural),
            other => panic!("expected {} to be rejected, got {:?}", name, other),
        }
    }
    let is = ddl.info_schema()?;
    let db = is.schema_by_name("test").expect("schema test");
    assert_eq!(is.tables_in(db.id).len(), 1);
    Ok(())
}

#[test]
fn test_drop_schema_requires_empty() -> Result<()> {
    let cluster = Cluster::start(1)?;
    let recorder = Recorder::new();
    cluster.set_callback(recorder.clone());
    let ddl = cluster.node(0);
    setup_t1(ddl, 2)?;

    match ddl.execute(DdlRequest::DropSchema { name: "test".to_string() }) {
        Err(DdlError::JobCancelled { error, .. }) => assert!(error.message.contains("still contains tables")),
        other => panic!("expected the drop to be rejected, got {:?}", other),
    }
    assert!(ddl.info_schema()?.schema_by_name("test").is_some());

    ddl.execute(drop_table("t1"))?;
    let job = ddl.execute(DdlRequest::DropSchema { name: "test".to_string() })?;
    assert_eq!(job.state, JobState::Done);
    assert_eq!(recorder.states_of(job.id), vec![SchemaState::WriteOnly, SchemaState::DeleteOnly, SchemaState::None]);
    assert!(ddl.info_schema()?.schema_by_name("test").is_none());
    assert!(matches!(ddl.submit(drop_table("t1")), Err(DdlError::TableNotFound(_) | DdlError::SchemaNotFound(_))));
    Ok(())
}

#[test]
fn test_schema_version_advances_per_step() -> Result<()> {
    let cluster = Cluster::start(1)?;
    let ddl = cluster.node(0);
    setup_t1(ddl, 1)?;

    let before = ddl.schema_version()?;
    let job = ddl.execute(alter(
        "t1",
        AlterOp::AddColumn { column: ColumnDef::new("c4", DataType::Integer), position: ColumnPosition::None },
    ))?;
    // DeleteOnly, WriteOnly, WriteReorganization and Public each publish one version
    assert_eq!(ddl.schema_version()?, before + 4);
    assert_eq!(job.schema_version, before + 4);
    assert_eq!(ddl.info_schema()?.version(), before + 4);
    Ok(())
}

#[test]
fn test_snapshot_survives_restart() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("store.bin");

    let store = MemStore::new();
    {
        let ddl = Ddl::new("node-1", Arc::new(store.clone()), test_config())?;
        ddl.start()?;
        setup_t1(&ddl, 5)?;
        let column = ColumnDef::new("c4", DataType::Integer).default_value(Expr::literal(DataValue::Integer(7)));
        ddl.execute(alter("t1", AlterOp::AddColumn { column, position: ColumnPosition::None }))?;
        ddl.close();
    }
    store.save_to(&path)?;

    let restored = MemStore::load_from(&path)?;
    assert_eq!(restored.len(), store.len());
    let ddl = Ddl::new("node-1", Arc::new(restored), test_config())?;
    ddl.start()?;

    assert_eq!(column_names(&ddl, "test", "t1")?, vec!["c1", "c2", "c3", "c4"]);
    let rows = select_all(&ddl, "test", "t1")?;
    assert_eq!(rows.len(), 5);
    assert!(rows.iter().all(|(_, row)| row[3] == DataValue::Integer(7)));
    assert_eq!(ddl.history()?.len(), 3);
    assert!(ddl.jobs()?.is_empty());

    // the restored node takes the lease again and keeps working
    ddl.execute(alter("t1", AlterOp::DropColumn { name: "c4".to_string() }))?;
    assert_eq!(column_names(&ddl, "test", "t1")?, vec!["c1", "c2", "c3"]);
    ddl.close();
    Ok(())
}
