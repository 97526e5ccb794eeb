use anyhow::Result;
use std::io::Write;
use std::process::{Command, Stdio};

fn bnql() -> Command {
    Command::new(env!("CARGO_BIN_EXE_bnql"))
}

/// The demo runs the add/drop column scenario on a small cluster
#[test]
fn test_cli_demo() -> Result<()> {
    let output = bnql().args(["--lease-ms", "300", "demo", "--nodes", "2", "--rows", "5"]).output()?;
    assert!(output.status.success(), "demo failed: {}", String::from_utf8_lossy(&output.stderr));

    let stdout = String::from_utf8(output.stdout)?;
    assert!(stdout.contains("Started 2 nodes"));
    assert!(stdout.contains("Adding c4 after c3 with default 100"));
    assert!(stdout.contains("Dropping c4"));
    assert!(stdout.contains("(5 rows)"));
    assert!(stdout.contains("Schema version:"));
    Ok(())
}

/// Statements piped into the shell are executed and the store is saved on exit
#[test]
fn test_cli_shell_with_snapshot() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = dir.path().join("store.bin");

    let mut child = bnql()
        .current_dir(dir.path())
        .args(["--store", &store.to_string_lossy(), "--lease-ms", "300", "shell"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    {
        let stdin = child.stdin.as_mut().expect("piped stdin");
        writeln!(stdin, "create schema shop")?;
        writeln!(stdin, "create table shop.items (id int not null, qty int default 1)")?;
        writeln!(stdin, "insert into shop.items values (1, 5)")?;
        writeln!(stdin, "alter table shop.items add column price int default 9 after id")?;
        writeln!(stdin, "select * from shop.items")?;
        writeln!(stdin, "history")?;
        writeln!(stdin, "exit")?;
    }
    let output = child.wait_with_output()?;
    assert!(output.status.success(), "shell failed: {}", String::from_utf8_lossy(&output.stderr));

    let stdout = String::from_utf8(output.stdout)?;
    assert!(stdout.contains("Inserted row 1"), "unexpected output:\n{}", stdout);
    assert!(stdout.contains("(1 rows)"), "unexpected output:\n{}", stdout);
    assert!(stdout.contains("(3 jobs)"), "unexpected output:\n{}", stdout);
    assert!(store.exists());

    // a second session sees the saved schema
    let output = bnql()
        .current_dir(dir.path())
        .args(["--store", &store.to_string_lossy(), "--lease-ms", "300", "shell"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .and_then(|mut child| {
            if let Some(stdin) = child.stdin.as_mut() {
                writeln!(stdin, "select * from shop.items")?;
                writeln!(stdin, "exit")?;
            }
            child.wait_with_output()
        })?;
    let stdout = String::from_utf8(output.stdout)?;
    assert!(stdout.contains("price"), "unexpected output:\n{}", stdout);
    Ok(())
}
