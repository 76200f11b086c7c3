//! Workflow tests against scripted collaborators.

use std::sync::Arc;
use std::time::Duration;

use sagaflow_core::{kinds, Action, EngineHandle, ErrorKind, FlowError, MemoryStorage, Policy, TaskContext};
use sagaflow_testing::{drain, CompletionRecorder, Harness};
use serde_json::{json, Value};
use tokio::time::timeout;

use crate::actions::{
    self, AddProjectOptions, ImportArduinoProject, InitProject, InspectConfiguration, SaveOptions,
};
use crate::{keys, preload_projects, register_all, ProjectSettings, PROJECT_CONFIG_SAVE_CONSENT_ID};

// ============================================================================
// Helpers
// ============================================================================

fn settings() -> ProjectSettings {
    ProjectSettings {
        ide_timeout_ms: 20,
        ..ProjectSettings::default()
    }
}

fn start(harness: &Harness) -> EngineHandle {
    register_all(harness.builder(), settings()).build().start()
}

async fn settle(handle: &EngineHandle) {
    timeout(Duration::from_secs(5), handle.settled())
        .await
        .expect("workflows did not settle");
}

async fn seed_projects(harness: &Harness, handle: &EngineHandle, projects: Value) {
    harness
        .rpc
        .respond("ide.send_command", json!([]))
        .respond("project.get_projects", projects);
    handle.dispatch(actions::load_projects(true));
    settle(handle).await;
}

fn titles(actions: &[Action], kind: &str) -> Vec<String> {
    actions
        .iter()
        .filter(|action| action.is(kind))
        .filter_map(|action| action.payload()["title"].as_str().map(str::to_string))
        .collect()
}

fn configuration() -> InspectConfiguration {
    InspectConfiguration {
        project_dir: "/p".into(),
        env: "uno".into(),
        memory: true,
        code: true,
    }
}

fn script_inspection(harness: &Harness) {
    harness
        .rpc
        .respond("core.call", Value::Null)
        .respond("core.call", json!([{"severity": "low"}]));
    harness.rpc.respond("project.config_call", json!("/p/.build"));
    harness.rpc.respond("os.request_content", json!(r#"{"total": 10}"#));
}

// ============================================================================
// Recent projects
// ============================================================================

#[tokio::test]
async fn add_project_rejects_directory_without_config_file() {
    let harness = Harness::new();
    harness.rpc.respond("os.is_file", json!(false));
    let handle = start(&harness);
    let done = CompletionRecorder::new();

    handle.dispatch(actions::add_project("/tmp/x", AddProjectOptions::default()).with_completion(done.completion()));
    let (error, result) = done.wait().await;

    let error = error.unwrap();
    assert_eq!(error.kind, ErrorKind::PreconditionFailed);
    assert!(error.message.contains("conf.ini"));
    assert_eq!(result, Some(json!("/tmp/x")));
    assert_eq!(harness.rpc.params_of("os.is_file"), vec![vec![json!("/tmp/x/conf.ini")]]);
    settle(&handle).await;
    assert!(handle.state().storage_item(keys::RECENT_PROJECTS).is_none());
}

#[tokio::test]
async fn add_project_remembers_and_persists_directory() {
    let harness = Harness::new();
    harness.rpc.respond("os.is_file", json!(true));
    let storage = Arc::new(MemoryStorage::new());
    let handle = register_all(harness.builder().with_storage(storage.clone()), settings())
        .build()
        .start();
    let done = CompletionRecorder::new();
    let options = AddProjectOptions {
        with_open: false,
        with_reload: false,
    };

    handle.dispatch(actions::add_project("/p", options).with_completion(done.completion()));
    assert_eq!(done.wait().await, (None, Some(json!("/p"))));
    settle(&handle).await;

    assert_eq!(handle.state().storage_item(keys::RECENT_PROJECTS), Some(&json!(["/p"])));
    assert_eq!(storage.get("state", keys::RECENT_PROJECTS), Some(json!(["/p"])));
}

#[tokio::test]
async fn hide_project_removes_it_everywhere() {
    let harness = Harness::new();
    harness.rpc.respond("os.is_file", json!(true));
    let handle = start(&harness);
    seed_projects(&harness, &handle, json!([{"path": "/a"}, {"path": "/b"}])).await;
    for dir in ["/a", "/b"] {
        handle.dispatch(actions::add_project(dir, AddProjectOptions { with_open: false, with_reload: false }));
        settle(&handle).await;
    }

    handle.dispatch(actions::hide_project("/a"));
    settle(&handle).await;

    let state = handle.state();
    assert_eq!(state.storage_item(keys::RECENT_PROJECTS), Some(&json!(["/b"])));
    assert_eq!(state.entity(keys::PROJECTS), Some(&json!([{"path": "/b"}])));
}

#[tokio::test]
async fn rename_replaces_recent_entry_and_reloads() {
    let harness = Harness::new();
    harness.rpc.respond("os.is_file", json!(true));
    let handle = start(&harness);
    seed_projects(&harness, &handle, json!([{"path": "/old"}])).await;
    handle.dispatch(actions::add_project("/old", AddProjectOptions { with_open: false, with_reload: false }));
    settle(&handle).await;
    let loads_before = harness.rpc.call_count("project.get_projects");

    handle.dispatch(actions::os_rename_file("/old", "/new"));
    settle(&handle).await;

    assert_eq!(handle.state().storage_item(keys::RECENT_PROJECTS), Some(&json!(["/new"])));
    assert_eq!(harness.rpc.call_count("project.get_projects"), loads_before + 1);

    handle.dispatch(actions::os_rename_file("/unknown", "/other"));
    settle(&handle).await;
    assert_eq!(handle.state().storage_item(keys::RECENT_PROJECTS), Some(&json!(["/new"])));
}

#[tokio::test]
async fn open_project_failure_reveals_directory() {
    let harness = Harness::new();
    harness.rpc.fail("ide.send_command", "IDE is not running", None);
    let handle = start(&harness);
    let mut bus = handle.subscribe();

    handle.dispatch(actions::open_project("/p"));
    settle(&handle).await;

    let dispatched = drain(&mut bus);
    let reveal = dispatched.iter().find(|action| action.is(actions::OS_REVEAL_FILE)).unwrap();
    assert_eq!(reveal.payload()["path"], json!("/p"));
    assert_eq!(titles(&dispatched, kinds::NOTIFY_SUCCESS), vec!["Open Project..."]);
}

// ============================================================================
// Project list
// ============================================================================

#[tokio::test]
async fn load_projects_gives_up_on_slow_ide_and_drops_its_answer() {
    let harness = Harness::new();
    harness
        .rpc
        .respond_after("ide.send_command", Duration::from_millis(100), json!(["/ide"]));
    harness.rpc.respond("project.get_projects", json!([{"path": "/p"}]));
    let handle = start(&harness);
    let mut bus = handle.subscribe();

    handle.dispatch(actions::load_projects(false));
    settle(&handle).await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(handle.state().entity(keys::PROJECTS), Some(&json!([{"path": "/p"}])));
    assert!(handle.state().storage_item(keys::RECENT_PROJECTS).is_none());
    assert!(!harness.rpc.answered().contains(&"ide.send_command".to_string()));
    assert!(drain(&mut bus).iter().any(|action| action.is(actions::PROJECTS_LOADED)));
}

#[tokio::test]
async fn load_projects_merges_ide_projects_and_waits_for_save() {
    let harness = Harness::new();
    harness.rpc.respond("ide.send_command", json!(["/ide"]));
    harness.rpc.respond("project.get_projects", json!([{"path": "/ide"}]));
    let handle = start(&harness);
    let mut bus = handle.subscribe();

    handle.dispatch(actions::load_projects(false));
    settle(&handle).await;

    assert_eq!(handle.state().storage_item(keys::RECENT_PROJECTS), Some(&json!(["/ide"])));
    let order: Vec<String> = drain(&mut bus)
        .iter()
        .map(|action| action.kind().to_string())
        .filter(|kind| kind == kinds::STATE_SAVED || kind == actions::PROJECTS_LOADED)
        .collect();
    assert_eq!(order, vec![kinds::STATE_SAVED, actions::PROJECTS_LOADED]);
}

#[tokio::test]
async fn loaded_projects_are_served_from_cache() {
    let harness = Harness::new();
    let handle = start(&harness);
    seed_projects(&harness, &handle, json!([])).await;
    let mut bus = handle.subscribe();

    handle.dispatch(actions::load_projects(false));
    settle(&handle).await;

    assert_eq!(harness.rpc.call_count("project.get_projects"), 1);
    assert!(drain(&mut bus).iter().any(|action| action.is(actions::PROJECTS_LOADED)));
}

#[tokio::test]
async fn failed_ide_discovery_still_loads_project_list() {
    let harness = Harness::new();
    harness.rpc.fail("ide.send_command", "IDE is not running", None);
    harness.rpc.respond("project.get_projects", json!([{"path": "/p"}]));
    let handle = start(&harness);
    let mut bus = handle.subscribe();

    handle.dispatch(actions::load_projects(false));
    settle(&handle).await;

    assert_eq!(handle.state().entity(keys::PROJECTS), Some(&json!([{"path": "/p"}])));
    assert!(handle.state().storage_item(keys::RECENT_PROJECTS).is_none());
    let seen = drain(&mut bus);
    assert!(seen.iter().any(|action| action.is(actions::PROJECTS_LOADED)));
    assert!(titles(&seen, kinds::NOTIFY_ERROR).is_empty());
}

async fn count_projects(_action: Action, mut ctx: TaskContext) -> Result<(), FlowError> {
    preload_projects(&mut ctx).await?;
    let count = ctx.select(|state| {
        state
            .entity(keys::PROJECTS)
            .and_then(Value::as_array)
            .map_or(0, Vec::len)
    });
    ctx.end(None, Some(json!(count)));
    Ok(())
}

#[tokio::test]
async fn preload_waits_for_project_list() {
    let harness = Harness::new();
    harness.rpc.respond("ide.send_command", json!([]));
    harness.rpc.respond_after(
        "project.get_projects",
        Duration::from_millis(20),
        json!([{"path": "/a"}, {"path": "/b"}]),
    );
    let builder = harness
        .builder()
        .register("COUNT_PROJECTS", Policy::ConcurrentEvery, count_projects);
    let handle = register_all(builder, settings()).build().start();

    let first = CompletionRecorder::new();
    handle.dispatch(Action::new("COUNT_PROJECTS").with_completion(first.completion()));
    assert_eq!(first.wait().await, (None, Some(json!(2))));
    settle(&handle).await;

    let cached = CompletionRecorder::new();
    handle.dispatch(Action::new("COUNT_PROJECTS").with_completion(cached.completion()));
    assert_eq!(cached.wait().await, (None, Some(json!(2))));
    settle(&handle).await;
    assert_eq!(harness.rpc.call_count("project.get_projects"), 1);
}

#[tokio::test]
async fn platform_changes_clear_project_examples() {
    let harness = Harness::new();
    harness.rpc.respond("project.get_project_examples", json!([{"name": "blink"}]));
    let handle = start(&harness);

    handle.dispatch(actions::load_project_examples());
    settle(&handle).await;
    handle.dispatch(actions::load_project_examples());
    settle(&handle).await;
    assert_eq!(harness.rpc.call_count("project.get_project_examples"), 1);

    handle.dispatch(Action::new(actions::INSTALL_PLATFORM));
    settle(&handle).await;
    assert!(!handle.state().has_entity(keys::PROJECT_EXAMPLES));
}

// ============================================================================
// Import and init
// ============================================================================

#[tokio::test]
async fn import_project_notifies_and_completes_with_location() {
    let harness = Harness::new();
    harness.rpc.respond("project.import_pio", json!("/imported"));
    let handle = start(&harness);
    let mut bus = handle.subscribe();
    let done = CompletionRecorder::new();

    handle.dispatch(actions::import_project("/src").with_completion(done.completion()));
    assert_eq!(done.wait().await, (None, Some(json!("/imported"))));
    settle(&handle).await;

    assert_eq!(
        titles(&drain(&mut bus), kinds::NOTIFY_SUCCESS),
        vec!["Project has been successfully imported"]
    );
    assert!(done.fired_once());
}

#[tokio::test]
async fn arduino_import_failure_gets_dedicated_hint() {
    let harness = Harness::new();
    harness
        .rpc
        .fail("project.import_arduino", "Not an Arduino project: /sketch", None);
    let handle = start(&harness);
    let mut bus = handle.subscribe();
    let done = CompletionRecorder::new();

    let request = ImportArduinoProject {
        board: "uno".into(),
        use_arduino_libs: true,
        arduino_project_dir: "/sketch".into(),
    };
    handle.dispatch(actions::import_arduino_project(request).with_completion(done.completion()));
    let (error, result) = done.wait().await;
    settle(&handle).await;

    assert_eq!(error.map(|e| e.kind), Some(ErrorKind::RpcFailure));
    assert_eq!(result, None);
    let errors = titles(&drain(&mut bus), kinds::NOTIFY_ERROR);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains(".ino or .pde"));
    assert!(!handle.state().has_entity("error/import_arduino_project"));
}

fn init_request() -> InitProject {
    InitProject {
        board: "uno".into(),
        framework: "arduino".into(),
        project_dir: "/new".into(),
        spine_dir: None,
        build_dir: Some("/new/.build".into()),
    }
}

#[tokio::test]
async fn init_project_notifies_and_completes_with_location() {
    let harness = Harness::new();
    harness.rpc.respond("project.init", json!("/new"));
    let handle = start(&harness);
    let mut bus = handle.subscribe();
    let done = CompletionRecorder::new();

    handle.dispatch(actions::init_project(init_request()).with_completion(done.completion()));
    assert_eq!(done.wait().await, (None, Some(json!("/new"))));
    settle(&handle).await;

    assert_eq!(
        harness.rpc.params_of("project.init"),
        vec![vec![json!("uno"), json!("arduino"), json!("/new"), Value::Null, json!("/new/.build")]]
    );
    let seen = drain(&mut bus);
    let success = seen
        .iter()
        .find(|action| action.is(kinds::NOTIFY_SUCCESS))
        .unwrap();
    assert_eq!(success.payload()["title"], json!("Project has been successfully initialized"));
    assert_eq!(
        success.payload()["detail"],
        json!("Board: uno, framework: arduino, location: /new")
    );
    assert!(titles(&seen, kinds::NOTIFY_ERROR).is_empty());
    assert!(done.fired_once());
}

#[tokio::test]
async fn init_project_failure_notifies_once_and_reports_error() {
    let harness = Harness::new();
    harness.rpc.fail("project.init", "Unknown board ID 'nope'", None);
    let handle = start(&harness);
    let mut bus = handle.subscribe();
    let done = CompletionRecorder::new();

    handle.dispatch(actions::init_project(init_request()).with_completion(done.completion()));
    let (error, result) = done.wait().await;
    settle(&handle).await;

    let error = error.unwrap();
    assert_eq!(error.kind, ErrorKind::RpcFailure);
    assert!(error.message.contains("Unknown board ID"));
    assert_eq!(result, None);
    let seen = drain(&mut bus);
    assert_eq!(titles(&seen, kinds::NOTIFY_ERROR), vec!["Could not initialize project"]);
    assert!(titles(&seen, kinds::NOTIFY_SUCCESS).is_empty());
    assert!(done.fired_once());
}

// ============================================================================
// Project configuration
// ============================================================================

#[tokio::test]
async fn stale_config_is_not_written_unless_forced() {
    let harness = Harness::new();
    harness.rpc.respond("os.get_file_mtime", json!(100.00002));
    harness.rpc.respond("project.config_dump", Value::Null);
    let handle = start(&harness);
    let mut bus = handle.subscribe();

    let done = CompletionRecorder::new();
    let options = SaveOptions {
        mtime: Some(100.0),
        force: false,
    };
    handle.dispatch(actions::save_project_config("/p", json!([]), options).with_completion(done.completion()));
    let (error, _) = done.wait().await;
    settle(&handle).await;

    let error = error.unwrap();
    assert_eq!(error.kind, ErrorKind::StaleWriteConflict);
    assert_eq!(error.data.as_ref().unwrap()["loadedAt"], json!(100.0));
    assert_eq!(harness.rpc.call_count("project.config_dump"), 0);
    assert!(titles(&drain(&mut bus), kinds::NOTIFY_ERROR).is_empty());

    let done = CompletionRecorder::new();
    let options = SaveOptions {
        mtime: Some(100.0),
        force: true,
    };
    handle.dispatch(actions::save_project_config("/p", json!([]), options).with_completion(done.completion()));
    assert_eq!(done.wait().await, (None, None));
    settle(&handle).await;

    assert_eq!(harness.rpc.call_count("project.config_dump"), 1);
    assert_eq!(
        handle.state().entity(keys::PROJECT_CONFIG).unwrap()["mtime"],
        json!(100.00002)
    );
}

#[tokio::test]
async fn rejected_consent_aborts_save_silently() {
    let harness = Harness::new().rejecting_consent();
    let handle = start(&harness);
    settle(&handle).await;
    let mut bus = handle.subscribe();
    let done = CompletionRecorder::new();

    handle.dispatch(
        actions::save_project_config("/p", json!([]), SaveOptions::default()).with_completion(done.completion()),
    );
    assert_eq!(done.wait().await, (None, None));
    settle(&handle).await;

    assert!(harness.rpc.calls().is_empty());
    assert_eq!(harness.prompter.prompts()[0].id, PROJECT_CONFIG_SAVE_CONSENT_ID);
    assert!(!handle.state().has_entity(keys::PROJECT_CONFIG));
    assert!(titles(&drain(&mut bus), kinds::NOTIFY_ERROR).is_empty());
}

#[tokio::test]
async fn project_config_is_reshaped_into_sections() {
    let harness = Harness::new();
    harness
        .rpc
        .respond("project.config_load", json!([["env:uno", [["board", "uno"], ["framework", "arduino"]]]]));
    harness.rpc.respond("os.get_file_mtime", json!(5.5));
    let handle = start(&harness);

    handle.dispatch(actions::load_project_config("/p"));
    settle(&handle).await;

    assert_eq!(
        handle.state().entity(keys::PROJECT_CONFIG),
        Some(&json!({
            "config": [{
                "section": "env:uno",
                "items": [
                    {"name": "board", "value": "uno"},
                    {"name": "framework", "value": "arduino"},
                ],
            }],
            "mtime": 5.5,
        }))
    );
}

#[tokio::test]
async fn project_config_failure_falls_back_to_project_list() {
    let harness = Harness::new();
    harness.rpc.fail("project.config_load", "No such file", None);
    let handle = start(&harness);
    let mut bus = handle.subscribe();

    handle.dispatch(actions::load_project_config("/p"));
    settle(&handle).await;

    assert_eq!(harness.navigator.last().as_deref(), Some("/projects"));
    assert_eq!(
        titles(&drain(&mut bus), kinds::NOTIFY_ERROR),
        vec!["Could not load project config"]
    );
    assert!(handle.state().has_entity("error/load_project_config"));
}

#[tokio::test]
async fn config_schema_rpc_failure_is_silent() {
    let harness = Harness::new();
    harness.rpc.fail("project.get_config_schema", "unsupported", None);
    let handle = start(&harness);
    let mut bus = handle.subscribe();

    handle.dispatch(actions::load_config_schema());
    settle(&handle).await;

    assert!(titles(&drain(&mut bus), kinds::NOTIFY_ERROR).is_empty());
    assert!(!handle.state().has_entity(keys::CONFIG_SCHEMA));
}

#[tokio::test]
async fn failed_description_update_is_rolled_back() {
    let harness = Harness::new();
    harness
        .rpc
        .fail("project.config_update_description", "read-only file", None);
    let handle = start(&harness);
    seed_projects(&harness, &handle, json!([{"path": "/p", "description": "old"}])).await;
    let mut bus = handle.subscribe();
    let done = CompletionRecorder::new();

    handle.dispatch(actions::update_config_description("/p", "new").with_completion(done.completion()));
    let (error, _) = done.wait().await;
    settle(&handle).await;

    assert_eq!(error.map(|e| e.kind), Some(ErrorKind::RpcFailure));
    assert_eq!(handle.state().entity(keys::PROJECTS).unwrap()[0]["description"], json!("old"));
    assert_eq!(
        titles(&drain(&mut bus), kinds::NOTIFY_ERROR),
        vec!["Could not update project description"]
    );
}

#[tokio::test]
async fn overlapping_failed_description_updates_restore_original() {
    let harness = Harness::new();
    harness.rpc.fail_after(
        "project.config_update_description",
        Duration::from_millis(30),
        "read-only file",
    );
    let handle = start(&harness);
    seed_projects(&harness, &handle, json!([{"path": "/p", "description": "old"}])).await;
    let description =
        |handle: &EngineHandle| handle.state().entity(keys::PROJECTS).unwrap()[0]["description"].clone();

    handle.dispatch(actions::update_config_description("/p", "a"));
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(description(&handle), json!("a"));
    handle.dispatch(actions::update_config_description("/p", "b"));
    settle(&handle).await;

    assert_eq!(description(&handle), json!("old"));
}

#[tokio::test]
async fn confirmed_description_update_is_kept() {
    let harness = Harness::new();
    harness.rpc.respond("project.config_update_description", Value::Null);
    let handle = start(&harness);
    seed_projects(&harness, &handle, json!([{"path": "/p", "description": "old"}])).await;

    handle.dispatch(actions::update_config_description("/p", "new"));
    settle(&handle).await;

    assert_eq!(handle.state().entity(keys::PROJECTS).unwrap()[0]["description"], json!("new"));
    assert_eq!(
        harness.rpc.params_of("project.config_update_description"),
        vec![vec![json!("/p/conf.ini"), json!("new")]]
    );
}

// ============================================================================
// Inspection
// ============================================================================

#[tokio::test]
async fn inspection_of_unknown_project_reports_error() {
    let harness = Harness::new();
    let handle = start(&harness);
    let done = CompletionRecorder::new();

    handle.dispatch(actions::inspect_project(configuration()).with_completion(done.completion()));
    let (error, result) = done.wait().await;
    settle(&handle).await;

    let error = error.unwrap();
    assert_eq!(error.kind, ErrorKind::PreconditionFailed);
    assert_eq!(error.message, "Can't inspect non-existing project '/p'");
    assert_eq!(result, None);
    assert_eq!(
        handle.state().entity(keys::INSPECT_RESULT),
        Some(&json!({"error": "Can't inspect non-existing project '/p'"}))
    );
    assert_eq!(harness.navigator.last().as_deref(), Some("/inspect"));
}

#[tokio::test]
async fn identical_inspection_reuses_cached_result() {
    let harness = Harness::new();
    let handle = start(&harness);
    seed_projects(&harness, &handle, json!([{"path": "/p"}])).await;
    script_inspection(&harness);

    let first = CompletionRecorder::new();
    handle.dispatch(actions::inspect_project(configuration()).with_completion(first.completion()));
    let (error, result) = first.wait().await;
    settle(&handle).await;
    assert!(error.is_none());
    let result = result.unwrap();
    assert_eq!(result["memory"], json!({"total": 10}));
    assert_eq!(result["codeChecks"], json!([{"severity": "low"}]));
    assert_eq!(
        harness.navigator.visited(),
        vec!["/inspect/processing", "/inspect/result"]
    );

    let calls = harness.rpc.calls().len();
    let second = CompletionRecorder::new();
    handle.dispatch(actions::inspect_project(configuration()).with_completion(second.completion()));
    assert_eq!(second.wait().await, (None, Some(result)));
    settle(&handle).await;
    assert_eq!(harness.rpc.calls().len(), calls);

    let metrics = handle.state().storage_item(keys::INSPECT_STORAGE).unwrap()["metrics"].clone();
    assert!(metrics["/p:uno:memory"].as_u64().is_some());
    assert!(metrics["/p:uno:code"].as_u64().is_some());
}

#[tokio::test]
async fn malformed_memory_report_is_bad_json() {
    let harness = Harness::new();
    let handle = start(&harness);
    seed_projects(&harness, &handle, json!([{"path": "/p"}])).await;
    harness.rpc.respond("core.call", Value::Null);
    harness.rpc.respond("project.config_call", json!("/p/.build"));
    harness.rpc.respond("os.request_content", json!("{not json"));

    let done = CompletionRecorder::new();
    let memory_only = InspectConfiguration {
        code: false,
        ..configuration()
    };
    handle.dispatch(actions::inspect_project(memory_only).with_completion(done.completion()));
    let (error, _) = done.wait().await;

    let error = error.unwrap();
    assert_eq!(error.kind, ErrorKind::MalformedResponse);
    assert_eq!(error.message, "Bad JSON");
}

#[tokio::test]
async fn reinspect_runs_saved_configuration_with_same_completion() {
    let harness = Harness::new();
    let handle = start(&harness);
    seed_projects(&harness, &handle, json!([{"path": "/p"}])).await;
    script_inspection(&harness);

    handle.dispatch(actions::inspect_project(configuration()));
    settle(&handle).await;
    let calls = harness.rpc.calls().len();

    let done = CompletionRecorder::new();
    handle.dispatch(actions::reinspect_project().with_completion(done.completion()));
    let (error, result) = done.wait().await;
    settle(&handle).await;

    assert!(error.is_none());
    assert_eq!(result.unwrap()["memory"], json!({"total": 10}));
    assert!(done.fired_once());
    assert!(harness.rpc.calls().len() > calls);
}

#[tokio::test]
async fn reinspect_without_saved_configuration_fails() {
    let harness = Harness::new();
    let handle = start(&harness);
    let done = CompletionRecorder::new();

    handle.dispatch(actions::reinspect_project().with_completion(done.completion()));
    let (error, _) = done.wait().await;

    assert_eq!(error.map(|e| e.kind), Some(ErrorKind::PreconditionFailed));
}
