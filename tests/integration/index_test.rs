#[path = "../common/mod.rs"]
mod common;

use anyhow::Result;

use bayun_ddl::model::{ErrorClass, JobState};
use bayun_ddl::storage::codec::{index_prefix, prefix_end};
use bayun_ddl::{AlterOp, DataValue, Ddl, DdlError, SchemaState, Storage};

use common::{Cluster, Recorder, alter, insert, setup_t1};

fn add_index(name: &str, column: &str, unique: bool) -> AlterOp {
    AlterOp::AddIndex { name: name.to_string(), columns: vec![column.to_string()], unique }
}

fn lookup(ddl: &Ddl, index: &str, value: i64) -> Result<Vec<i64>> {
    let t1 = ddl.table("test", "t1")?;
    let mut txn = ddl.store().begin()?;
    let handles = t1.index_lookup(txn.as_mut(), index, &[DataValue::Integer(value)]);
    txn.rollback();
    Ok(handles?)
}

#[test]
fn test_add_index_backfills_existing_rows() -> Result<()> {
    let cluster = Cluster::start(2)?;
    let recorder = Recorder::new();
    cluster.set_callback(recorder.clone());
    let ddl = cluster.node(1);
    setup_t1(ddl, 10)?;

    let job = ddl.execute(alter("t1", add_index("c2_idx", "c2", false)))?;
    assert_eq!(
        recorder.states_of(job.id),
        vec![
            SchemaState::DeleteOnly,
            SchemaState::WriteOnly,
            SchemaState::WriteReorganization,
            SchemaState::Public
        ]
    );
    assert_eq!(job.row_count, 10);

    // rows (i, 10i, 100i) live at handle i + 1
    assert_eq!(lookup(ddl, "c2_idx", 20)?, vec![3]);
    assert!(lookup(ddl, "c2_idx", 25)?.is_empty());

    let t1 = ddl.table("test", "t1")?;
    let handle = insert(ddl, &t1, &[DataValue::Integer(7), DataValue::Integer(20), DataValue::Integer(0)])?;
    assert_eq!(lookup(ddl, "c2_idx", 20)?, vec![3, handle]);
    Ok(())
}

#[test]
fn test_unique_index_with_duplicates_rolls_back() -> Result<()> {
    let cluster = Cluster::start(1)?;
    let recorder = Recorder::new();
    cluster.set_callback(recorder.clone());
    let ddl = cluster.node(0);
    setup_t1(ddl, 10)?;
    let t1 = ddl.table("test", "t1")?;
    insert(ddl, &t1, &[DataValue::Integer(99), DataValue::Integer(10), DataValue::Integer(0)])?;

    let job_id = ddl.submit(alter("t1", add_index("c2_uniq", "c2", true)))?;
    match ddl.wait(job_id) {
        Err(DdlError::JobRolledBack { error, .. }) => {
            assert_eq!(error.class, ErrorClass::Data);
            assert!(error.message.contains("c2_uniq"));
        }
        other => panic!("expected a rollback, got {:?}", other),
    }

    let job = ddl.get_job(job_id)?.expect("job in history");
    assert_eq!(job.state, JobState::RollbackDone);
    let states = recorder.states_of(job_id);
    assert_eq!(states.first(), Some(&SchemaState::DeleteOnly));
    assert!(states.contains(&SchemaState::DeleteReorganization));
    assert_eq!(states.last(), Some(&SchemaState::None));

    // the index is gone from the schema and from storage
    let t1 = ddl.table("test", "t1")?;
    assert!(t1.info().index("c2_uniq").is_none());
    let prefix = index_prefix(t1.id(), 1);
    let mut txn = ddl.store().begin()?;
    assert!(txn.scan(&prefix, &prefix_end(&prefix), 1)?.is_empty());
    txn.rollback();
    Ok(())
}

#[test]
fn test_unique_index_rejects_duplicate_insert() -> Result<()> {
    let cluster = Cluster::start(1)?;
    let ddl = cluster.node(0);
    setup_t1(ddl, 5)?;
    ddl.execute(alter("t1", add_index("c1_uniq", "c1", true)))?;

    let t1 = ddl.table("test", "t1")?;
    let dup = insert(ddl, &t1, &[DataValue::Integer(3), DataValue::Integer(0), DataValue::Integer(0)]);
    let err = dup.expect_err("duplicate key must be rejected");
    match err.downcast_ref::<DdlError>() {
        Some(DdlError::DuplicateEntry { index, .. }) => assert_eq!(index, "c1_uniq"),
        other => panic!("expected a duplicate entry error, got {:?}", other),
    }
    insert(ddl, &t1, &[DataValue::Integer(5), DataValue::Integer(0), DataValue::Integer(0)])?;
    Ok(())
}

#[test]
fn test_drop_index() -> Result<()> {
    let cluster = Cluster::start(1)?;
    let recorder = Recorder::new();
    cluster.set_callback(recorder.clone());
    let ddl = cluster.node(0);
    setup_t1(ddl, 4)?;
    ddl.execute(alter("t1", add_index("c2_idx", "c2", false)))?;
    let index_id = ddl.table("test", "t1")?.info().index("c2_idx").map(|i| i.id).expect("index exists");

    let job = ddl.execute(alter("t1", AlterOp::DropIndex { name: "c2_idx".to_string() }))?;
    assert_eq!(
        recorder.states_of(job.id),
        vec![
            SchemaState::WriteOnly,
            SchemaState::DeleteOnly,
            SchemaState::DeleteReorganization,
            SchemaState::None
        ]
    );
    assert!(matches!(lookup(ddl, "c2_idx", 10), Err(e) if e.to_string().contains("not found")));

    let t1 = ddl.table("test", "t1")?;
    let prefix = index_prefix(t1.id(), index_id);
    let mut txn = ddl.store().begin()?;
    assert!(txn.scan(&prefix, &prefix_end(&prefix), 1)?.is_empty());
    txn.rollback();

    match ddl.execute(alter("t1", AlterOp::DropIndex { name: "c2_idx".to_string() })) {
        Err(DdlError::JobCancelled { error, .. }) => assert_eq!(error.class, ErrorClass::Structural),
        other => panic!("expected cancellation, got {:?}", other),
    }
    Ok(())
}
