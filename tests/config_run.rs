// tests/config_run.rs

mod common;

use std::io::Write;
use std::sync::Arc;

use tempfile::NamedTempFile;

use common::{config, dispatcher, outputs, with_timeout};
use fanout::config::load_and_validate;
use fanout::engine::{Args, CellStatus};
use fanout::errors::FanoutError;
use fanout::tree::Resolver;

const FLEET: &str = r#"
[settings]
connect_timeout = "5s"
max_parallel = 4

[target.a]
kind = "local"

[target.b]
kind = "local"

[target.c]
kind = "local"

[node.root]
roles = { web = ["a", "b"], db = ["c"] }

[node.web]
parent = "root"
map = { host = "web" }
isolate = "host"

[node.web.action.greet]
cmd = "echo hello {0} from $FANOUT_ROLE"
env = { FANOUT_ROLE = "web" }

[node.web.action.fail]
cmd = "exit 4"

[node.web.action.tolerate]
cmd = "echo soft; exit 4"
ignore_exit_status = true

[node.all]
parent = "root"
map = { every = "*" }

[node.db]
parent = "root"
map = { host = "db" }
isolate = "host"
just_one = true
"#;

#[test]
fn file_on_disk_loads_with_settings() {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{FLEET}").unwrap();

    let cfg = load_and_validate(file.path()).unwrap();
    assert_eq!(cfg.root(), "root");
    assert_eq!(cfg.settings.max_parallel, Some(4));
    assert_eq!(cfg.settings.connect_timeout.as_secs(), 5);
    assert_eq!(cfg.children_of("root").collect::<Vec<_>>(), vec!["web", "all", "db"]);
}

#[test]
fn star_mapping_takes_every_parent_target() {
    let cfg = config(FLEET).unwrap();
    let tree = Arc::new(cfg.build_tree().unwrap());
    let resolver = Resolver::new(tree.clone());
    let all = resolver.resolve(tree.find("all").unwrap()).unwrap();
    assert_eq!(all.slugs()["every"], vec!["a", "b", "c"]);
}

#[tokio::test]
async fn shell_actions_from_config_run_on_local_targets() {
    let cfg = config(FLEET).unwrap();
    let tree = Arc::new(cfg.build_tree().unwrap());
    let d = dispatcher(tree);

    let result = with_timeout(d.invoke_path("web", "greet", Args::new().arg("world")))
        .await
        .unwrap();
    assert!(result.is_success());
    let out = outputs(&result);
    assert_eq!(out.len(), 2);
    for (_, text) in &out {
        assert_eq!(text.trim(), "hello world from web");
    }

    let result = with_timeout(d.invoke_path("web[0]", "fail", Args::new())).await.unwrap();
    let outcome = &result.outcomes()[0];
    assert_eq!(outcome.exit_code(), Some(4));
    assert!(matches!(outcome.status, CellStatus::Failed(_)));

    let result = with_timeout(d.invoke_path("web", "tolerate", Args::new())).await.unwrap();
    assert!(result.is_success());
    assert_eq!(result.outcomes()[1].exit_code(), Some(4));
}

fn err(toml_text: &str) -> FanoutError {
    config(toml_text).unwrap_err()
}

#[test]
fn structural_config_errors() {
    assert!(matches!(err(""), FanoutError::ConfigError(_)));

    assert!(matches!(
        err("[node.a]\n[node.b]\n"),
        FanoutError::ConfigError(msg) if msg.contains("exactly one node")
    ));

    assert!(matches!(
        err("[node.a]\n[node.b]\nparent = \"nope\"\n"),
        FanoutError::ConfigError(msg) if msg.contains("unknown parent")
    ));

    assert!(matches!(
        err("[node.a]\nparent = \"b\"\n[node.b]\nparent = \"a\"\n"),
        FanoutError::TreeCycle(_)
    ));

    assert!(matches!(
        err("[node.root]\n[node.root.action.x]\ncmd = \"  \"\n"),
        FanoutError::ConfigError(msg) if msg.contains("empty `cmd`")
    ));

    assert!(matches!(
        err("[node.root]\n[node.root.action.x]\ncmd = \"id\"\nsudo = true\nsudo_user = \"app\"\n"),
        FanoutError::ConfigError(msg) if msg.contains("sudo")
    ));

    assert!(matches!(
        err("[settings]\nmax_parallel = 0\n[node.root]\n"),
        FanoutError::ConfigError(msg) if msg.contains("max_parallel")
    ));

    assert!(matches!(err("[node.root]\ncolour = \"blue\"\n"), FanoutError::TomlError(_)));
}

#[test]
fn mapping_an_unknown_role_fails_on_resolution() {
    let cfg = config(
        r#"
[target.a]
kind = "local"

[node.root]
roles = { web = ["a"] }

[node.app]
parent = "root"
map = { host = "db" }
isolate = "host"
"#,
    )
    .unwrap();
    let tree = Arc::new(cfg.build_tree().unwrap());
    let resolver = Resolver::new(tree.clone());
    assert!(matches!(
        resolver.resolve(tree.find("app").unwrap()).unwrap_err(),
        FanoutError::UnknownRole { role, .. } if role == "db"
    ));
}
