#[path = "../common/mod.rs"]
mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam::channel::{self, Sender};

use bayun_ddl::common::clock::expiry_after;
use bayun_ddl::ddl::Callback;
use bayun_ddl::meta::Meta;
use bayun_ddl::model::{Job, JobState, JobType, NodeStatus};
use bayun_ddl::{
    AlterOp, ColumnDef, ColumnPosition, DataType, DataValue, Ddl, DdlError, DdlRequest, Expr, SchemaState, run_in_new_txn,
};

use common::{Cluster, Recorder, alter, select_all, setup_t1, test_config};

/// Signals the test once backfill is under way, then slows the owner down
/// so that it is still backfilling when it is shut down
struct StallBackfill {
    started: Sender<()>,
    fired: AtomicBool,
    recorder: Arc<Recorder>,
}

impl Callback for StallBackfill {
    fn on_job_updated(&self, job: &Job, old_state: SchemaState) {
        self.recorder.on_job_updated(job, old_state);
    }

    fn on_reorg_batch(&self, job: &Job, _range: usize, processed: u64) {
        if job.job_type() != JobType::AddColumn {
            return;
        }
        if processed >= 8 && !self.fired.swap(true, Ordering::SeqCst) {
            let _ = self.started.send(());
        }
        if self.fired.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(20));
        }
    }
}

#[test]
fn test_owner_handoff_during_backfill() -> Result<()> {
    let cluster = Cluster::start(3)?;
    let recorder = Recorder::new();
    cluster.set_callback(recorder.clone());
    cluster.wait_for_owner(Duration::from_secs(5))?;
    let owner = cluster.nodes.iter().position(|n| n.is_owner()).expect("owner elected");
    let other = (owner + 1) % cluster.nodes.len();

    let (tx, rx) = channel::bounded(1);
    cluster.node(owner).set_callback(Arc::new(StallBackfill {
        started: tx,
        fired: AtomicBool::new(false),
        recorder: recorder.clone(),
    }));

    let ddl = cluster.node(other);
    setup_t1(ddl, 100)?;
    let column = ColumnDef::new("c4", DataType::Integer).default_value(Expr::literal(DataValue::Integer(100)));
    let job_id = ddl.submit(alter("t1", AlterOp::AddColumn { column, position: ColumnPosition::None }))?;

    rx.recv_timeout(Duration::from_secs(10))?;
    cluster.node(owner).close();

    let job = ddl.wait(job_id)?;
    assert_eq!(job.state, JobState::Done);
    assert!(!cluster.node(owner).is_owner());
    let successor = cluster.wait_for_owner(Duration::from_secs(5))?;
    assert_ne!(successor.node_id(), cluster.node(owner).node_id());

    // every batch ran once across both owners
    assert_eq!(job.row_count, 100);
    assert_eq!(
        recorder.states_of(job_id),
        vec![
            SchemaState::DeleteOnly,
            SchemaState::WriteOnly,
            SchemaState::WriteReorganization,
            SchemaState::Public
        ]
    );

    let rows = select_all(ddl, "test", "t1")?;
    assert_eq!(rows.len(), 100);
    assert!(rows.iter().all(|(_, row)| row[3] == DataValue::Integer(100)));
    Ok(())
}

#[test]
fn test_only_one_owner() -> Result<()> {
    let cluster = Cluster::start(4)?;
    cluster.wait_for_owner(Duration::from_secs(5))?;
    for _ in 0..10 {
        assert_eq!(cluster.nodes.iter().filter(|n| n.is_owner()).count(), 1);
        thread::sleep(cluster.config.owner_renew_interval);
    }
    Ok(())
}

fn publish_heartbeat(ddl: &Ddl, status: NodeStatus) -> Result<()> {
    run_in_new_txn(ddl.store().as_ref(), ddl.config().retry_policy(), |txn| -> Result<(), DdlError> {
        Meta::new(txn).set_node_status(&status)
    })?;
    Ok(())
}

#[test]
fn test_step_waits_for_lagging_node() -> Result<()> {
    let cluster = Cluster::start(1)?;
    let ddl = cluster.node(0);
    let lease = cluster.config.lease;

    // a live node that never reloads holds every step back for one lease
    publish_heartbeat(ddl, NodeStatus { node_id: "ghost".to_string(), loaded_version: 0, lease_expiry_ms: expiry_after(lease * 20) })?;
    let started = Instant::now();
    ddl.execute(DdlRequest::CreateSchema { name: "slow".to_string() })?;
    assert!(started.elapsed() >= lease, "step did not wait: {:?}", started.elapsed());

    // once its heartbeat has expired it is ignored
    publish_heartbeat(ddl, NodeStatus { node_id: "ghost".to_string(), loaded_version: 0, lease_expiry_ms: 0 })?;
    let started = Instant::now();
    ddl.execute(DdlRequest::CreateSchema { name: "fast".to_string() })?;
    assert!(started.elapsed() < lease, "step waited for an expired node: {:?}", started.elapsed());
    Ok(())
}

#[test]
fn test_stale_node_refuses_its_snapshot() -> Result<()> {
    let cluster = Cluster::start(1)?;
    let stale = cluster.new_node()?;
    stale.domain().reload()?;
    assert!(stale.info_schema().is_ok());

    thread::sleep(test_config().lease + Duration::from_millis(50));
    assert!(matches!(stale.info_schema(), Err(DdlError::SchemaExpired(_))));

    // name resolution reloads on demand
    setup_t1(&stale, 1)?;
    assert!(stale.info_schema().is_ok());
    Ok(())
}
