#[path = "../common/mod.rs"]
mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::Mutex;
use rand::Rng;

use bayun_ddl::catalog::Domain;
use bayun_ddl::common::Handle;
use bayun_ddl::ddl::Callback;
use bayun_ddl::evaluator::BinaryOp;
use bayun_ddl::model::{ErrorClass, Job, JobState, JobType};
use bayun_ddl::storage::codec::row_marker_prefix;
use bayun_ddl::{
    AlterOp, ColumnDef, ColumnPosition, ConstEvaluator, DataType, DataValue, Ddl, DdlError, Expr, MemStore,
    SchemaState, Storage, Table, run_in_new_txn,
};

use common::{Cluster, Recorder, alter, column_names, select_all, setup_t1, stored_values};

fn int(v: i64) -> DataValue {
    DataValue::Integer(v)
}

fn add_column(name: &str, default: Option<i64>, position: ColumnPosition) -> AlterOp {
    let mut column = ColumnDef::new(name, DataType::Integer);
    if let Some(v) = default {
        column = column.default_value(Expr::literal(DataValue::Integer(v)));
    }
    AlterOp::AddColumn { column, position }
}

fn drop_column(name: &str) -> AlterOp {
    AlterOp::DropColumn { name: name.to_string() }
}

fn stored_count(ddl: &Ddl, handle: Handle) -> Result<usize> {
    let t1 = ddl.table("test", "t1")?;
    let mut txn = ddl.store().begin()?;
    let count = t1.stored_column_count(txn.as_mut(), handle)?;
    txn.rollback();
    Ok(count)
}

/// Inserts one row through the owner's own snapshot while the first
/// backfill batch of an add-column job is committed
struct InsertDuringBackfill {
    domain: Arc<Domain>,
    store: MemStore,
    row: Vec<DataValue>,
    fired: AtomicBool,
    handle: Mutex<Option<Handle>>,
    recorder: Arc<Recorder>,
}

impl Callback for InsertDuringBackfill {
    fn on_job_updated(&self, job: &Job, old_state: SchemaState) {
        self.recorder.on_job_updated(job, old_state);
    }

    fn on_reorg_batch(&self, job: &Job, _range: usize, _processed: u64) {
        if job.job_type() != JobType::AddColumn || self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let info = self
            .domain
            .info_schema()
            .ok()
            .and_then(|is| is.table_by_id(job.table_id))
            .expect("table visible to the owner");
        let table = Table::new(info, Arc::new(ConstEvaluator));
        let handle = run_in_new_txn(&self.store, Default::default(), |txn| table.add_record(txn, &self.row))
            .expect("insert during backfill");
        *self.handle.lock() = Some(handle);
    }
}

#[test]
fn test_add_column_with_default() -> Result<()> {
    let cluster = Cluster::start(2)?;
    let owner = cluster.wait_for_owner(std::time::Duration::from_secs(5))?;
    let recorder = Recorder::new();
    let inserter = Arc::new(InsertDuringBackfill {
        domain: owner.domain().clone(),
        store: cluster.store.clone(),
        row: vec![int(11), int(12), int(13), int(14)],
        fired: AtomicBool::new(false),
        handle: Mutex::new(None),
        recorder: recorder.clone(),
    });
    owner.set_callback(inserter.clone());

    // submitted from the node that is not the owner
    let node = cluster.node(1);
    setup_t1(node, 10)?;
    let job = node.execute(alter("t1", add_column("c4", Some(100), ColumnPosition::After("c3".to_string()))))?;

    assert_eq!(job.state, JobState::Done);
    assert_eq!(job.schema_state, SchemaState::Public);
    assert_eq!(
        recorder.states_of(job.id),
        vec![
            SchemaState::DeleteOnly,
            SchemaState::WriteOnly,
            SchemaState::WriteReorganization,
            SchemaState::Public
        ]
    );
    assert_eq!(column_names(node, "test", "t1")?, vec!["c1", "c2", "c3", "c4"]);

    let inserted = inserter.handle.lock().expect("row inserted during backfill");
    let rows = select_all(node, "test", "t1")?;
    assert_eq!(rows.len(), 11);
    for (handle, row) in rows {
        if handle == inserted {
            assert_eq!(row, vec![int(11), int(12), int(13), int(14)]);
        } else {
            let i = handle - 1;
            assert_eq!(row, vec![int(i), int(10 * i), int(100 * i), int(100)]);
        }
    }

    let t1 = node.table("test", "t1")?;
    assert_eq!(node.current_schema_version(t1.id())?, job.schema_version);
    assert_eq!(job.row_count, 11);
    Ok(())
}

#[test]
fn test_default_expression_is_evaluated() -> Result<()> {
    let cluster = Cluster::start(1)?;
    let ddl = cluster.node(0);
    setup_t1(ddl, 3)?;

    let default = Expr::binary(BinaryOp::Add, Expr::literal(40), Expr::literal(60));
    let column = ColumnDef::new("c4", DataType::Integer).default_value(default).not_null();
    ddl.execute(alter("t1", AlterOp::AddColumn { column, position: ColumnPosition::None }))?;

    for (_, row) in select_all(ddl, "test", "t1")? {
        assert_eq!(row[3], int(100));
    }
    Ok(())
}

#[test]
fn test_drop_column_removes_stored_values() -> Result<()> {
    let cluster = Cluster::start(1)?;
    let ddl = cluster.node(0);
    let recorder = Recorder::new();
    cluster.set_callback(recorder.clone());
    setup_t1(ddl, 10)?;

    ddl.execute(alter("t1", add_column("c4", Some(100), ColumnPosition::None)))?;
    assert_eq!(stored_count(ddl, 1)?, 4);

    let job = ddl.execute(alter("t1", drop_column("c4")))?;
    assert_eq!(
        recorder.states_of(job.id),
        vec![
            SchemaState::WriteOnly,
            SchemaState::DeleteOnly,
            SchemaState::DeleteReorganization,
            SchemaState::None
        ]
    );
    assert_eq!(stored_count(ddl, 1)?, 3);
    assert_eq!(column_names(ddl, "test", "t1")?, vec!["c1", "c2", "c3"]);
    assert!(ddl.table("test", "t1")?.info().column("c4").is_none());
    Ok(())
}

#[test]
fn test_column_lifecycle() -> Result<()> {
    let cluster = Cluster::start(2)?;
    let ddl = cluster.node(1);
    setup_t1(ddl, 5)?;

    ddl.execute(alter("t1", add_column("c4", None, ColumnPosition::First)))?;
    ddl.execute(alter("t1", add_column("c5", Some(5), ColumnPosition::First)))?;
    ddl.execute(alter("t1", add_column("c6", Some(6), ColumnPosition::First)))?;
    assert_eq!(column_names(ddl, "test", "t1")?, vec!["c6", "c5", "c4", "c1", "c2", "c3"]);

    for name in ["c2", "c1", "c3", "c4"] {
        ddl.execute(alter("t1", drop_column(name)))?;
    }
    assert_eq!(column_names(ddl, "test", "t1")?, vec!["c6", "c5"]);
    for (_, row) in select_all(ddl, "test", "t1")? {
        assert_eq!(row, vec![int(6), int(5)]);
    }

    ddl.execute(alter(
        "t1",
        AlterOp::AddIndex { name: "c5_idx".to_string(), columns: vec!["c5".to_string()], unique: false },
    ))?;
    match ddl.execute(alter("t1", drop_column("c5"))) {
        Err(DdlError::JobCancelled { error, .. }) => {
            assert_eq!(error.class, ErrorClass::Structural);
            assert!(error.message.contains("c5_idx"));
        }
        other => panic!("expected the drop to be cancelled, got {:?}", other),
    }

    ddl.execute(alter("t1", AlterOp::DropIndex { name: "c5_idx".to_string() }))?;
    ddl.execute(alter("t1", drop_column("c5")))?;
    assert_eq!(column_names(ddl, "test", "t1")?, vec!["c6"]);

    match ddl.execute(alter("t1", drop_column("c6"))) {
        Err(DdlError::JobCancelled { error, .. }) => assert!(error.message.contains("c6")),
        other => panic!("expected the last column to stay, got {:?}", other),
    }
    assert_eq!(column_names(ddl, "test", "t1")?, vec!["c6"]);
    Ok(())
}

#[test]
fn test_invalid_add_column_is_cancelled() -> Result<()> {
    let cluster = Cluster::start(1)?;
    let ddl = cluster.node(0);
    setup_t1(ddl, 2)?;
    let version = ddl.schema_version()?;

    let rejected = [
        add_column("c1", None, ColumnPosition::None),
        add_column("c4", None, ColumnPosition::After("missing".to_string())),
        AlterOp::AddColumn { column: ColumnDef::new("c4", DataType::Integer).not_null(), position: ColumnPosition::None },
        AlterOp::AddColumn {
            column: ColumnDef::new("c4", DataType::Integer).default_value(Expr::literal("abc")),
            position: ColumnPosition::None,
        },
    ];
    for op in rejected {
        match ddl.execute(alter("t1", op)) {
            Err(DdlError::JobCancelled { error, .. }) => assert_eq!(error.class, ErrorClass::Structural),
            other => panic!("expected cancellation, got {:?}", other),
        }
    }

    // nothing was published for the rejected jobs
    assert_eq!(ddl.schema_version()?, version);
    assert_eq!(column_names(ddl, "test", "t1")?, vec!["c1", "c2", "c3"]);
    assert!(ddl.history()?.iter().rev().take(4).all(|j| j.state == JobState::Cancelled));
    Ok(())
}

#[test]
fn test_add_column_under_concurrent_dml() -> Result<()> {
    let cluster = Cluster::start(2)?;
    let ddl = cluster.node(0);
    setup_t1(ddl, 200)?;

    let stop = Arc::new(AtomicBool::new(false));
    let writer = {
        let node = cluster.nodes[1].clone();
        let stop = stop.clone();
        thread::spawn(move || -> Result<usize> {
            let mut rng = rand::thread_rng();
            let mut ops = 0;
            while !stop.load(Ordering::SeqCst) {
                // statements use whatever schema this node currently holds
                let t1 = node.table("test", "t1")?;
                let row: Vec<DataValue> = (0..t1.cols().len()).map(|_| int(rng.gen_range(0..1000))).collect();
                let handle = rng.gen_range(1..=200);
                let result = run_in_new_txn(node.store().as_ref(), node.config().retry_policy(), |txn| match ops % 3 {
                    0 => t1.add_record(txn, &row).map(|_| ()),
                    1 => t1.update_record(txn, handle, &row),
                    _ => t1.remove_record(txn, handle),
                });
                match result {
                    Ok(()) | Err(DdlError::RowNotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                ops += 1;
            }
            Ok(ops)
        })
    };

    let job = ddl.execute(alter("t1", add_column("c4", Some(100), ColumnPosition::None)))?;
    stop.store(true, Ordering::SeqCst);
    let ops = writer.join().expect("dml thread")?;
    assert!(ops > 0);
    assert_eq!(job.state, JobState::Done);

    let t1 = ddl.table("test", "t1")?;
    let c4 = t1.info().column("c4").map(|c| c.id).expect("c4 is public");
    let mut txn = ddl.store().begin()?;
    for (handle, row) in t1.rows(txn.as_mut())? {
        assert_eq!(row.len(), 4);
        assert!(!row[3].is_null(), "row {} has no c4", handle);
        assert!(t1.stored_value(txn.as_mut(), handle, c4)?.is_some(), "row {} was not backfilled", handle);
    }
    txn.rollback();

    // deleted rows keep no values, including ones written by the backfill
    let orphans: Vec<_> = stored_values(ddl, t1.id())?.into_iter().filter(|(_, _, live)| !live).collect();
    assert!(orphans.is_empty(), "values of deleted rows: {:?}", orphans);

    ddl.execute(alter("t1", drop_column("c4")))?;
    for (handle, column, live) in stored_values(ddl, t1.id())? {
        assert!(live, "row {} was deleted but column {} is stored", handle, column);
        assert_ne!(column, c4, "row {} still stores the dropped column", handle);
    }
    Ok(())
}

#[test]
fn test_failed_drop_column_keeps_moving_forward() -> Result<()> {
    let cluster = Cluster::start(1)?;
    let ddl = cluster.node(0);
    setup_t1(ddl, 10)?;
    let t1 = ddl.table("test", "t1")?;

    // a key under the row marker prefix that does not decode to a handle
    let mut bad = row_marker_prefix(t1.id());
    bad.push(0xFF);
    run_in_new_txn(ddl.store().as_ref(), Default::default(), |txn| txn.set(&bad, b"x"))?;

    let job_id = ddl.submit(alter("t1", drop_column("c3")))?;
    let deadline = Instant::now() + Duration::from_secs(5);
    let failed = loop {
        let job = ddl.get_job(job_id)?.expect("job exists");
        if job.error.is_some() {
            break job;
        }
        assert!(Instant::now() < deadline, "backfill never failed: {}", job);
        thread::sleep(Duration::from_millis(5));
    };
    assert_eq!(failed.state, JobState::Running);
    assert_eq!(failed.schema_state, SchemaState::DeleteReorganization);

    // the job retries instead of rolling back
    thread::sleep(Duration::from_millis(100));
    let job = ddl.get_job(job_id)?.expect("job exists");
    assert_eq!(job.state, JobState::Running);
    assert_eq!(job.schema_state, SchemaState::DeleteReorganization);

    run_in_new_txn(ddl.store().as_ref(), Default::default(), |txn| txn.delete(&bad))?;
    let job = ddl.wait(job_id)?;
    assert_eq!(job.state, JobState::Done);
    assert!(job.error.is_none());
    assert_eq!(column_names(ddl, "test", "t1")?, vec!["c1", "c2"]);
    assert_eq!(stored_count(ddl, 1)?, 2);

    // later jobs are not stuck behind it
    ddl.execute(alter("t1", add_column("c4", Some(7), ColumnPosition::None)))?;
    assert_eq!(column_names(ddl, "test", "t1")?, vec!["c1", "c2", "c4"]);
    Ok(())
}
