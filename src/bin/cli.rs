use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use log::{LevelFilter, Log, Metadata, Record};
use rustyline::error::ReadlineError;
use rustyline::Editor;
use rustyline::history::DefaultHistory;

use bayun_ddl::ddl::Callback;
use bayun_ddl::model::Job;
use bayun_ddl::{
    AlterOp, ColumnDef, ColumnPosition, DataType, DataValue, Ddl, DdlConfig, DdlRequest, Expr, MemStore,
    SchemaState, Storage, run_in_new_txn,
};

const HISTORY_FILE: &str = ".bayundb_ddl_history";

#[derive(Parser)]
#[command(author, version, about = "BayunDB DDL CLI - online schema changes over a shared store")]
struct Cli {
    /// Store snapshot file, loaded on start and written on exit
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// Node id of this process
    #[arg(short, long, default_value = "node-1")]
    node_id: String,

    /// Schema and owner lease in milliseconds
    #[arg(long, default_value_t = 1000)]
    lease_ms: u64,

    /// Rows per backfill transaction
    #[arg(long, default_value_t = 256)]
    batch_size: usize,

    /// Parallel backfill workers
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Command to execute
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive shell
    Shell,

    /// Run the add/drop column scenario on an in-memory cluster
    Demo {
        /// Number of nodes sharing the store
        #[arg(long, default_value_t = 3)]
        nodes: usize,

        /// Rows inserted before the schema change
        #[arg(long, default_value_t = 10)]
        rows: i64,
    },
}

impl Cli {
    fn config(&self) -> Result<DdlConfig> {
        let mut config = DdlConfig::with_lease(Duration::from_millis(self.lease_ms));
        config.backfill_batch_size = self.batch_size;
        config.backfill_workers = self.workers;
        config.validate()?;
        Ok(config)
    }
}

/// Writes log records to stderr
struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        eprintln!("[{:<5} {}] {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn init_logging(level: &str) -> Result<()> {
    let filter: LevelFilter = level.parse().map_err(|_| anyhow!("unknown log level '{}'", level))?;
    log::set_logger(&LOGGER).map_err(|e| anyhow!("failed to install logger: {}", e))?;
    log::set_max_level(filter);
    Ok(())
}

/// Prints every job transition it observes
struct PrintCallback;

impl Callback for PrintCallback {
    fn on_job_updated(&self, job: &Job, old_state: SchemaState) {
        println!(
            "  job {} {} `{}`: {} -> {} [{}]",
            job.id,
            job.job_type(),
            job.args.object_name(),
            old_state,
            job.schema_state,
            job.state
        );
    }
}

/// One parsed shell line
#[derive(Debug, PartialEq)]
enum ShellCommand {
    Ddl(DdlRequest),
    Insert { schema: String, table: String, values: Vec<DataValue> },
    Select { schema: String, table: String },
    Cancel(i64),
    Jobs,
    History,
    Version,
    Keys(usize),
    Help,
    Exit,
}

fn split_name(name: &str) -> Result<(String, String)> {
    match name.split_once('.') {
        Some((schema, table)) if !schema.is_empty() && !table.is_empty() => Ok((schema.to_string(), table.to_string())),
        _ => bail!("expected <schema>.<table>, got '{}'", name),
    }
}

/// Text between the first '(' and the last ')', split on commas
fn paren_list(line: &str) -> Result<Vec<String>> {
    let open = line.find('(').ok_or_else(|| anyhow!("missing '('"))?;
    let close = line.rfind(')').ok_or_else(|| anyhow!("missing ')'"))?;
    if close < open {
        bail!("unbalanced parentheses");
    }
    Ok(line[open + 1..close]
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

/// `<name> <type> [not null] [default <literal>] [first | after <col>]`
fn parse_column(tokens: &[&str]) -> Result<(ColumnDef, ColumnPosition)> {
    let [name, ty, rest @ ..] = tokens else {
        bail!("column definition needs a name and a type");
    };
    let data_type = DataType::parse(ty).ok_or_else(|| anyhow!("unknown type '{}'", ty))?;
    let mut column = ColumnDef::new(*name, data_type);
    let mut position = ColumnPosition::None;
    let mut i = 0;
    while i < rest.len() {
        match rest[i].to_lowercase().as_str() {
            "not" if rest.get(i + 1).is_some_and(|t| t.eq_ignore_ascii_case("null")) => {
                column = column.not_null();
                i += 2;
            }
            "default" => {
                let lit = rest.get(i + 1).ok_or_else(|| anyhow!("missing default value"))?;
                column = column.default_value(Expr::Literal(DataValue::parse_literal(lit)));
                i += 2;
            }
            "first" => {
                position = ColumnPosition::First;
                i += 1;
            }
            "after" => {
                let anchor = rest.get(i + 1).ok_or_else(|| anyhow!("missing column after AFTER"))?;
                position = ColumnPosition::After(anchor.to_string());
                i += 2;
            }
            other => bail!("unexpected '{}' in column definition", other),
        }
    }
    Ok((column, position))
}

fn parse_alter(schema: String, table: String, tokens: &[&str], line: &str) -> Result<ShellCommand> {
    let lower: Vec<String> = tokens.iter().map(|t| t.to_lowercase()).collect();
    let words: Vec<&str> = lower.iter().map(String::as_str).collect();
    let op = match words.as_slice() {
        ["add", "column", ..] => {
            let (column, position) = parse_column(&tokens[2..])?;
            AlterOp::AddColumn { column, position }
        }
        ["drop", "column", _] => AlterOp::DropColumn { name: tokens[2].to_string() },
        ["add", "index", ..] | ["add", "unique", "index", ..] => {
            let unique = words[1] == "unique";
            let name = tokens
                .get(if unique { 3 } else { 2 })
                .map(|t| t.split('(').next().unwrap_or_default().to_string())
                .filter(|n| !n.is_empty())
                .ok_or_else(|| anyhow!("missing index name"))?;
            AlterOp::AddIndex { name, columns: paren_list(line)?, unique }
        }
        ["drop", "index", _] => AlterOp::DropIndex { name: tokens[2].to_string() },
        _ => bail!("unknown ALTER TABLE operation"),
    };
    Ok(ShellCommand::Ddl(DdlRequest::AlterTable { schema, table, op }))
}

fn parse_command(line: &str) -> Result<ShellCommand> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let lower: Vec<String> = tokens.iter().map(|t| t.to_lowercase()).collect();
    let words: Vec<&str> = lower.iter().map(String::as_str).collect();

    let command = match words.as_slice() {
        ["exit"] | ["quit"] => ShellCommand::Exit,
        ["help"] => ShellCommand::Help,
        ["jobs"] => ShellCommand::Jobs,
        ["history"] => ShellCommand::History,
        ["version"] => ShellCommand::Version,
        ["keys"] => ShellCommand::Keys(100),
        ["keys", n] => ShellCommand::Keys(n.parse().context("keys takes a row limit")?),
        ["cancel", id] => ShellCommand::Cancel(id.parse().context("cancel takes a job id")?),
        ["create", "schema", _] => ShellCommand::Ddl(DdlRequest::CreateSchema { name: tokens[2].to_string() }),
        ["drop", "schema", _] => ShellCommand::Ddl(DdlRequest::DropSchema { name: tokens[2].to_string() }),
        ["create", "table", _, ..] => {
            let name = tokens[2].split('(').next().unwrap_or_default();
            let (schema, table) = split_name(name)?;
            let mut columns = Vec::new();
            for def in paren_list(line)? {
                let def_tokens: Vec<&str> = def.split_whitespace().collect();
                let (column, position) = parse_column(&def_tokens)?;
                if position != ColumnPosition::None {
                    bail!("column positions are only allowed in ALTER TABLE");
                }
                columns.push(column);
            }
            ShellCommand::Ddl(DdlRequest::CreateTable { schema, table, columns })
        }
        ["drop", "table", _] => {
            let (schema, table) = split_name(tokens[2])?;
            ShellCommand::Ddl(DdlRequest::DropTable { schema, table })
        }
        ["alter", "table", _, ..] => {
            let (schema, table) = split_name(tokens[2])?;
            parse_alter(schema, table, &tokens[3..], line)?
        }
        ["insert", "into", _, ..] => {
            let (schema, table) = split_name(tokens[2])?;
            let values = paren_list(line)?.iter().map(|v| DataValue::parse_literal(v)).collect();
            ShellCommand::Insert { schema, table, values }
        }
        ["select", "*", "from", _] => {
            let (schema, table) = split_name(tokens[3])?;
            ShellCommand::Select { schema, table }
        }
        _ => bail!("unrecognized command, type 'help'"),
    };
    Ok(command)
}

fn print_rows(headers: &[String], rows: &[Vec<String>]) {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len().max(3)).collect();
    for row in rows {
        for (i, value) in row.iter().enumerate() {
            widths[i] = widths[i].max(value.len());
        }
    }

    print!("|");
    for (header, width) in headers.iter().zip(&widths) {
        print!(" {:<width$} |", header, width = *width);
    }
    println!();
    print!("+");
    for width in &widths {
        print!("{:-<width$}+", "", width = width + 2);
    }
    println!();
    for row in rows {
        print!("|");
        for (value, width) in row.iter().zip(&widths) {
            print!(" {:<width$} |", value, width = *width);
        }
        println!();
    }
    println!("({} rows)", rows.len());
}

fn print_jobs(jobs: &[Job]) {
    for job in jobs {
        println!("{}", job);
    }
    println!("({} jobs)", jobs.len());
}

struct Session {
    store: MemStore,
    ddl: Ddl,
    path: Option<PathBuf>,
}

impl Session {
    fn open(cli: &Cli) -> Result<Self> {
        let store = match &cli.store {
            Some(path) if path.exists() => MemStore::load_from(path)
                .with_context(|| format!("Failed to load store from {}", path.display()))?,
            _ => MemStore::new(),
        };
        let ddl = Ddl::new(cli.node_id.clone(), Arc::new(store.clone()), cli.config()?)?;
        ddl.set_callback(Arc::new(PrintCallback));
        ddl.start()?;
        Ok(Self { store, ddl, path: cli.store.clone() })
    }

    fn close(self) -> Result<()> {
        self.ddl.close();
        if let Some(path) = &self.path {
            self.store
                .save_to(path)
                .with_context(|| format!("Failed to save store to {}", path.display()))?;
            println!("Store saved to {}", path.display());
        }
        Ok(())
    }

    /// Returns false when the shell should exit
    fn run(&self, command: ShellCommand) -> Result<bool> {
        match command {
            ShellCommand::Exit => return Ok(false),
            ShellCommand::Help => print_help(),
            ShellCommand::Ddl(request) => {
                let job = self.ddl.execute(request)?;
                println!("OK, job {} finished at schema version {}", job.id, job.schema_version);
            }
            ShellCommand::Insert { schema, table, values } => {
                let t = self.ddl.table(&schema, &table)?;
                let handle = run_in_new_txn(&self.store, self.ddl.config().retry_policy(), |txn| {
                    t.add_record(txn, &values)
                })?;
                println!("Inserted row {}", handle);
            }
            ShellCommand::Select { schema, table } => {
                let t = self.ddl.table(&schema, &table)?;
                let mut txn = self.store.begin()?;
                let rows = t.rows(txn.as_mut());
                txn.rollback();
                let headers: Vec<String> = t.cols().iter().map(|c| c.name.clone()).collect();
                let rows: Vec<Vec<String>> = rows?
                    .into_iter()
                    .map(|(_, row)| row.iter().map(|v| v.to_string()).collect())
                    .collect();
                print_rows(&headers, &rows);
            }
            ShellCommand::Cancel(job_id) => {
                self.ddl.cancel(job_id)?;
                println!("Cancellation of job {} requested", job_id);
            }
            ShellCommand::Jobs => print_jobs(&self.ddl.jobs()?),
            ShellCommand::History => print_jobs(&self.ddl.history()?),
            ShellCommand::Version => {
                println!("Schema version: {}", self.ddl.schema_version()?);
                println!("Loaded version: {}", self.ddl.domain().loaded_version());
                println!("DDL owner: {}", if self.ddl.is_owner() { "this node" } else { "another node" });
            }
            ShellCommand::Keys(limit) => {
                let mut txn = self.store.begin()?;
                let pairs = txn.scan(&[], &[0xFF], limit);
                txn.rollback();
                for (key, value) in pairs? {
                    println!("{}  ({} bytes)", hex::encode(&key), value.len());
                }
            }
        }
        Ok(true)
    }
}

fn run_shell(session: &Session) -> Result<()> {
    println!("Welcome to the BayunDB DDL CLI. Type 'help' for assistance or 'exit' to quit.");

    let mut rl = Editor::<(), DefaultHistory>::new()?;
    if let Err(err) = rl.load_history(HISTORY_FILE) {
        if !err.to_string().contains("No such file or directory") {
            println!("Error loading history: {}", err);
        }
    }

    loop {
        match rl.readline("bayundb-ddl> ") {
            Ok(line) => {
                let _ = rl.add_history_entry(&line);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let keep_going = parse_command(line).and_then(|command| session.run(command));
                match keep_going {
                    Ok(true) => {}
                    Ok(false) => {
                        println!("Goodbye!");
                        break;
                    }
                    Err(err) => println!("Error: {}", err),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                println!("Error: {}", err);
                break;
            }
        }
    }

    if let Err(err) = rl.save_history(HISTORY_FILE) {
        println!("Error saving history: {}", err);
    }
    Ok(())
}

fn print_help() {
    println!("Schema changes:");
    println!("  CREATE SCHEMA <name>");
    println!("  DROP SCHEMA <name>");
    println!("  CREATE TABLE <schema>.<table> (<col> <type> [NOT NULL] [DEFAULT <v>], ...)");
    println!("  DROP TABLE <schema>.<table>");
    println!("  ALTER TABLE <schema>.<table> ADD COLUMN <col> <type> [NOT NULL] [DEFAULT <v>] [FIRST | AFTER <col>]");
    println!("  ALTER TABLE <schema>.<table> DROP COLUMN <col>");
    println!("  ALTER TABLE <schema>.<table> ADD [UNIQUE] INDEX <name> (<col>, ...)");
    println!("  ALTER TABLE <schema>.<table> DROP INDEX <name>");
    println!();
    println!("Data:");
    println!("  INSERT INTO <schema>.<table> VALUES (<v>, ...)");
    println!("  SELECT * FROM <schema>.<table>");
    println!();
    println!("Other commands:");
    println!("  jobs | history               - Active or finished DDL jobs");
    println!("  cancel <job id>              - Request cancellation of a job");
    println!("  version                      - Schema versions and ownership");
    println!("  keys [limit]                 - Dump raw store keys in hex");
    println!("  help                         - Display this help message");
    println!("  exit                         - Exit the CLI");
}

fn run_demo(cli: &Cli, nodes: usize, rows: i64) -> Result<()> {
    let config = cli.config()?;
    let store = MemStore::new();
    let mut cluster = Vec::with_capacity(nodes.max(1));
    for i in 0..nodes.max(1) {
        let ddl = Ddl::new(format!("node-{}", i + 1), Arc::new(store.clone()), config.clone())?;
        ddl.set_callback(Arc::new(PrintCallback));
        ddl.start()?;
        cluster.push(ddl);
    }
    let front = &cluster[cluster.len() - 1];
    println!("Started {} nodes", cluster.len());

    println!("Creating test.t1(c1, c2, c3)");
    front.execute(DdlRequest::CreateSchema { name: "test".to_string() })?;
    front.execute(DdlRequest::CreateTable {
        schema: "test".to_string(),
        table: "t1".to_string(),
        columns: ["c1", "c2", "c3"].iter().map(|n| ColumnDef::new(*n, DataType::Integer)).collect(),
    })?;

    let t1 = front.table("test", "t1")?;
    for i in 0..rows {
        let row = vec![DataValue::Integer(i), DataValue::Integer(10 * i), DataValue::Integer(100 * i)];
        run_in_new_txn(&store, config.retry_policy(), |txn| t1.add_record(txn, &row))?;
    }
    println!("Inserted {} rows", rows);

    println!("Adding c4 after c3 with default 100");
    front.execute(DdlRequest::AlterTable {
        schema: "test".to_string(),
        table: "t1".to_string(),
        op: AlterOp::AddColumn {
            column: ColumnDef::new("c4", DataType::Integer).default_value(Expr::literal(100)),
            position: ColumnPosition::After("c3".to_string()),
        },
    })?;
    print_table(front, &store)?;

    println!("Dropping c4");
    front.execute(DdlRequest::AlterTable {
        schema: "test".to_string(),
        table: "t1".to_string(),
        op: AlterOp::DropColumn { name: "c4".to_string() },
    })?;
    print_table(front, &store)?;

    println!("Schema version: {}", front.schema_version()?);
    for ddl in &cluster {
        ddl.close();
    }
    Ok(())
}

fn print_table(ddl: &Ddl, store: &MemStore) -> Result<()> {
    let t1 = ddl.table("test", "t1")?;
    let mut txn = store.begin()?;
    let rows = t1.rows(txn.as_mut());
    txn.rollback();
    let headers: Vec<String> = t1.cols().iter().map(|c| c.name.clone()).collect();
    let rows: Vec<Vec<String>> = rows?
        .into_iter()
        .map(|(_, row)| row.iter().map(|v| v.to_string()).collect())
        .collect();
    print_rows(&headers, &rows);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    match &cli.command {
        Some(Commands::Demo { nodes, rows }) => run_demo(&cli, *nodes, *rows),
        Some(Commands::Shell) | None => {
            let session = Session::open(&cli).context("Failed to start DDL node")?;
            run_shell(&session)?;
            session.close()
        }
    }
}
