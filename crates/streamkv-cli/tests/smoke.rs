use serde_json::{Value, json};
use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

fn write_schema(path: &Path) {
    let schema = json!([
        {
            "version": 1,
            "stores": [
                {
                    "name": "users",
                    "key_path": "id",
                    "auto_increment": true,
                    "indexes": [{"name": "by_city", "key_path": "city"}]
                }
            ]
        }
    ]);
    std::fs::write(path, schema.to_string()).expect("schema file write should succeed");
}

fn run_cli(args: &[&str], root: &Path) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_streamkv-cli"))
        .args(args)
        .env("STREAMKV_ROOT", root)
        .env_remove("RUST_LOG")
        .current_dir(root)
        .output()
        .expect("cli should run")
}

fn assert_success(output: &std::process::Output) {
    assert!(
        output.status.success(),
        "stdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn stdout_lines(output: &std::process::Output) -> Vec<Value> {
    String::from_utf8(output.stdout.clone())
        .expect("stdout should be utf8")
        .lines()
        .map(|line| serde_json::from_str(line).expect("every line should be JSON"))
        .collect()
}

#[test]
fn init_put_and_scan_persist_across_invocations() {
    let temp = TempDir::new().expect("tempdir should create");
    let schema = temp.path().join("schema.json");
    write_schema(&schema);
    let schema = schema.to_str().expect("schema path should be utf8");

    let output = run_cli(&["init", "--db", "app", "--schema", schema], temp.path());
    assert_success(&output);
    assert_eq!(stdout_lines(&output), vec![json!({"name": "app", "version": 1})]);

    for (name, city) in [("ada", "london"), ("grace", "arlington"), ("alan", "london")] {
        let value = json!({"name": name, "city": city}).to_string();
        let output = run_cli(
            &["add", "--db", "app", "--store", "users", "--value", &value],
            temp.path(),
        );
        assert_success(&output);
    }

    let output = run_cli(&["get", "--db", "app", "--store", "users", "--key", "2"], temp.path());
    assert_success(&output);
    assert_eq!(
        stdout_lines(&output),
        vec![json!({"name": "grace", "city": "arlington", "id": 2})]
    );

    let output = run_cli(
        &[
            "scan", "--db", "app", "--store", "users", "--index", "by_city", "--lower", "london",
        ],
        temp.path(),
    );
    assert_success(&output);
    let rows = stdout_lines(&output);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["key"], json!("london"));
    assert_eq!(rows[0]["primary_key"], json!(1));
    assert_eq!(rows[1]["value"]["name"], json!("alan"));

    let output = run_cli(&["delete", "--db", "app", "--store", "users", "--key", "1"], temp.path());
    assert_success(&output);
    let output = run_cli(&["count", "--db", "app", "--store", "users"], temp.path());
    assert_success(&output);
    assert_eq!(stdout_lines(&output), vec![json!(2)]);
}

#[test]
fn missing_database_and_duplicate_add_fail() {
    let temp = TempDir::new().expect("tempdir should create");

    let output = run_cli(&["stores", "--db", "ghost"], temp.path());
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8(output.stderr).expect("stderr should be utf8");
    assert!(stderr.contains("no database named 'ghost'"));

    let schema = temp.path().join("schema.json");
    write_schema(&schema);
    let schema = schema.to_str().expect("schema path should be utf8");
    assert_success(&run_cli(&["init", "--db", "app", "--schema", schema], temp.path()));

    let value = json!({"id": 7, "name": "x"}).to_string();
    let add = ["add", "--db", "app", "--store", "users", "--value", value.as_str()];
    assert_success(&run_cli(&add, temp.path()));
    let output = run_cli(&add, temp.path());
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8(output.stderr).expect("stderr should be utf8");
    assert!(stderr.contains("constraint"));
}
