#[path = "../common/mod.rs"]
mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::Result;

use bayun_ddl::ddl::Callback;
use bayun_ddl::model::{ErrorClass, Job, JobState, JobType};
use bayun_ddl::{AlterOp, ColumnDef, ColumnPosition, DataType, Ddl, DdlError, SchemaState};

use common::{Cluster, Recorder, alter, column_names, setup_t1};

fn add_column(name: &str) -> AlterOp {
    AlterOp::AddColumn { column: ColumnDef::new(name, DataType::Integer), position: ColumnPosition::None }
}

#[test]
fn test_concurrent_submits_run_in_order() -> Result<()> {
    let cluster = Cluster::start(3)?;
    let recorder = Recorder::new();
    cluster.set_callback(recorder.clone());
    setup_t1(cluster.node(0), 8)?;

    let job_ids: Vec<i64> = thread::scope(|s| {
        let handles: Vec<_> = (0..6)
            .map(|i| {
                let node = cluster.node(i % 3);
                s.spawn(move || node.submit(alter("t1", add_column(&format!("x{}", i)))))
            })
            .collect();
        handles.into_iter().map(|h| h.join().expect("submit thread")).collect::<Result<Vec<_>, _>>()
    })?;

    for (i, id) in job_ids.iter().enumerate() {
        cluster.node(i % 3).wait(*id)?;
    }

    // one job at a time, lowest id first
    let order: Vec<i64> = recorder.transitions.lock().iter().map(|t| t.job_id).collect();
    assert!(order.windows(2).all(|w| w[0] <= w[1]), "jobs interleaved: {:?}", order);
    let runs = recorder.runs.lock().clone();
    assert!(runs.windows(2).all(|w| w[0] <= w[1]), "runs interleaved: {:?}", runs);

    let mut sorted = job_ids.clone();
    sorted.sort();
    let history: Vec<i64> = cluster.node(0).history()?.iter().map(|j| j.id).filter(|id| sorted.contains(id)).collect();
    assert_eq!(history, sorted);
    assert_eq!(column_names(cluster.node(0), "test", "t1")?.len(), 9);
    Ok(())
}

#[test]
fn test_cancel_pending_job() -> Result<()> {
    let mut cluster = Cluster::start(1)?;
    setup_t1(cluster.node(0), 3)?;
    let version = cluster.node(0).schema_version()?;

    // with the only started node gone the job stays queued
    cluster.node(0).close();
    let idle = cluster.new_node()?;
    let job_id = idle.submit(alter("t1", add_column("c4")))?;
    assert_eq!(idle.jobs()?.len(), 1);
    idle.cancel(job_id)?;
    assert!(idle.get_job(job_id)?.is_some_and(|j| j.cancel_requested && j.state == JobState::Pending));

    idle.start()?;
    cluster.nodes.push(idle.clone());
    match idle.wait(job_id) {
        Err(DdlError::JobCancelled { error, .. }) => assert_eq!(error.class, ErrorClass::Cancelled),
        other => panic!("expected cancellation, got {:?}", other),
    }
    assert_eq!(idle.schema_version()?, version);
    assert_eq!(column_names(&idle, "test", "t1")?, vec!["c1", "c2", "c3"]);
    assert!(idle.jobs()?.is_empty());
    Ok(())
}

/// Requests cancellation through another node once a job reaches `state`
struct CancelAt {
    node: Arc<Ddl>,
    job_type: JobType,
    state: SchemaState,
    fired: AtomicBool,
    recorder: Arc<Recorder>,
}

impl Callback for CancelAt {
    fn on_job_updated(&self, job: &Job, old_state: SchemaState) {
        self.recorder.on_job_updated(job, old_state);
        if job.job_type() == self.job_type
            && job.state == JobState::Running
            && job.schema_state == self.state
            && !self.fired.swap(true, Ordering::SeqCst)
        {
            self.node.cancel(job.id).expect("cancel accepted");
        }
    }
}

#[test]
fn test_cancel_running_add_column_rolls_back() -> Result<()> {
    let cluster = Cluster::start(2)?;
    let recorder = Recorder::new();
    cluster.node(0).set_callback(Arc::new(CancelAt {
        node: cluster.nodes[1].clone(),
        job_type: JobType::AddColumn,
        state: SchemaState::WriteOnly,
        fired: AtomicBool::new(false),
        recorder: recorder.clone(),
    }));
    let ddl = cluster.node(1);
    setup_t1(ddl, 6)?;

    let job_id = ddl.submit(alter("t1", add_column("c4")))?;
    match ddl.wait(job_id) {
        Err(DdlError::JobRolledBack { error, .. }) => assert_eq!(error.class, ErrorClass::Cancelled),
        other => panic!("expected a rollback, got {:?}", other),
    }
    assert_eq!(
        recorder.states_of(job_id),
        vec![
            SchemaState::DeleteOnly,
            SchemaState::WriteOnly,
            SchemaState::DeleteOnly,
            SchemaState::DeleteReorganization,
            SchemaState::None
        ]
    );
    assert_eq!(column_names(ddl, "test", "t1")?, vec!["c1", "c2", "c3"]);

    let t1 = ddl.table("test", "t1")?;
    let mut txn = ddl.store().begin()?;
    for (handle, _) in t1.rows(txn.as_mut())? {
        assert_eq!(t1.stored_column_count(txn.as_mut(), handle)?, 3);
    }
    txn.rollback();
    Ok(())
}

#[test]
fn test_cancel_running_drop_column_restores_it() -> Result<()> {
    let cluster = Cluster::start(2)?;
    let recorder = Recorder::new();
    cluster.node(0).set_callback(Arc::new(CancelAt {
        node: cluster.nodes[1].clone(),
        job_type: JobType::DropColumn,
        state: SchemaState::WriteOnly,
        fired: AtomicBool::new(false),
        recorder: recorder.clone(),
    }));
    let ddl = cluster.node(1);
    setup_t1(ddl, 4)?;

    let job_id = ddl.submit(alter("t1", AlterOp::DropColumn { name: "c2".to_string() }))?;
    assert!(matches!(ddl.wait(job_id), Err(DdlError::JobRolledBack { .. })));
    assert_eq!(recorder.states_of(job_id), vec![SchemaState::WriteOnly, SchemaState::Public]);
    assert_eq!(column_names(ddl, "test", "t1")?, vec!["c1", "c2", "c3"]);
    Ok(())
}

#[test]
fn test_cancel_rejected() -> Result<()> {
    let cluster = Cluster::start(1)?;
    let ddl = cluster.node(0);
    setup_t1(ddl, 2)?;

    let job = ddl.execute(alter("t1", add_column("c4")))?;
    match ddl.cancel(job.id) {
        Err(DdlError::CancelRejected { state, .. }) => assert_eq!(state, JobState::Done),
        other => panic!("expected rejection, got {:?}", other),
    }
    assert!(matches!(ddl.cancel(job.id + 1000), Err(DdlError::JobNotFound(_))));
    Ok(())
}
