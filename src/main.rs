use std::sync::Arc;
use anyhow::Result;

use bayun_ddl::{
    AlterOp, ColumnDef, ColumnPosition, DataType, DataValue, Ddl, DdlConfig, DdlRequest, Expr, MemStore, Storage,
    run_in_new_txn,
};

fn main() -> Result<()> {
    // One node over an in-memory store
    let store: Arc<dyn Storage> = Arc::new(MemStore::new());
    let config = DdlConfig::default();
    let ddl = Ddl::new("node-1", store.clone(), config.clone())?;
    ddl.start()?;

    ddl.execute(DdlRequest::CreateSchema { name: "test".to_string() })?;
    ddl.execute(DdlRequest::CreateTable {
        schema: "test".to_string(),
        table: "t1".to_string(),
        columns: vec![
            ColumnDef::new("c1", DataType::Integer),
            ColumnDef::new("c2", DataType::Integer),
            ColumnDef::new("c3", DataType::Integer),
        ],
    })?;

    let t1 = ddl.table("test", "t1")?;
    for i in 0..10i64 {
        let row = vec![DataValue::Integer(i), DataValue::Integer(10 * i), DataValue::Integer(100 * i)];
        run_in_new_txn(store.as_ref(), config.retry_policy(), |txn| t1.add_record(txn, &row))?;
    }

    // Add a column with a default while the table holds data
    let job = ddl.execute(DdlRequest::AlterTable {
        schema: "test".to_string(),
        table: "t1".to_string(),
        op: AlterOp::AddColumn {
            column: ColumnDef::new("c4", DataType::Integer).default_value(Expr::literal(100)),
            position: ColumnPosition::After("c3".to_string()),
        },
    })?;
    println!("Finished job: {}", job);

    let t1 = ddl.table("test", "t1")?;
    let names: Vec<&str> = t1.cols().iter().map(|c| c.name.as_str()).collect();
    println!("Columns: {}", names.join(", "));

    let mut txn = store.begin()?;
    for (handle, row) in t1.rows(txn.as_mut())? {
        let values: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        println!("  {:>3}: ({})", handle, values.join(", "));
    }
    txn.rollback();

    println!("Schema version: {}", ddl.schema_version()?);
    ddl.close();
    Ok(())
}
