//! Engine tests against an in-memory provider.
use std::{path::PathBuf, sync::Mutex};

use crate::{Action, Construct, Error, HasDependencies, Remote, Resource, Stack};

/// Provider that records every platform call.
#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<String>>,
}

impl Recorder {
    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, HasDependencies)]
struct Store {
    name: String,
    version: u32,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
struct StoreOutput {
    arn: String,
}

impl Resource for Store {
    type Provider = Recorder;
    type Error = String;
    type Output = StoreOutput;

    fn kind() -> &'static str {
        "Test::Store"
    }

    async fn create(&self, provider: &Self::Provider) -> Result<Self::Output, Self::Error> {
        provider.record(format!("create {}", self.name));
        Ok(StoreOutput {
            arn: format!("arn:{}:{}", self.name, self.version),
        })
    }

    async fn read(&self, provider: &Self::Provider) -> Result<Self::Output, Self::Error> {
        provider.record(format!("read {}", self.name));
        Ok(StoreOutput {
            arn: format!("arn:{}:{}", self.name, self.version),
        })
    }

    async fn update(
        &self,
        provider: &Self::Provider,
        _previous_local: &Self,
        _previous_remote: &Self::Output,
    ) -> Result<Self::Output, Self::Error> {
        provider.record(format!("update {}", self.name));
        Ok(StoreOutput {
            arn: format!("arn:{}:{}", self.name, self.version),
        })
    }

    async fn delete(
        &self,
        provider: &Self::Provider,
        _previous_remote: &Self::Output,
    ) -> Result<(), Self::Error> {
        provider.record(format!("delete {}", self.name));
        Ok(())
    }
}

/// Like [`Store`], but its output ignores the tag.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, HasDependencies)]
struct Tagged {
    name: String,
    tag: String,
}

impl Resource for Tagged {
    type Provider = Recorder;
    type Error = String;
    type Output = StoreOutput;

    async fn create(&self, provider: &Self::Provider) -> Result<Self::Output, Self::Error> {
        provider.record(format!("create {}", self.name));
        Ok(StoreOutput {
            arn: format!("arn:{}", self.name),
        })
    }

    async fn update(
        &self,
        provider: &Self::Provider,
        _previous_local: &Self,
        previous_remote: &Self::Output,
    ) -> Result<Self::Output, Self::Error> {
        provider.record(format!("update {}", self.name));
        Ok(previous_remote.clone())
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, HasDependencies)]
struct Service {
    store_arn: Remote<String>,
    replicas: u32,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
struct ServiceOutput {
    endpoint: String,
}

impl Service {
    fn output(&self) -> Result<ServiceOutput, String> {
        let arn = self.store_arn.get().map_err(|e| e.to_string())?;
        Ok(ServiceOutput {
            endpoint: format!("https://{arn}"),
        })
    }
}

impl Resource for Service {
    type Provider = Recorder;
    type Error = String;
    type Output = ServiceOutput;

    fn kind() -> &'static str {
        "Test::Service"
    }

    async fn create(&self, provider: &Self::Provider) -> Result<Self::Output, Self::Error> {
        provider.record("create service");
        self.output()
    }

    async fn update(
        &self,
        provider: &Self::Provider,
        _previous_local: &Self,
        _previous_remote: &Self::Output,
    ) -> Result<Self::Output, Self::Error> {
        provider.record("update service");
        self.output()
    }

    async fn delete(
        &self,
        provider: &Self::Provider,
        _previous_remote: &Self::Output,
    ) -> Result<(), Self::Error> {
        provider.record("delete service");
        Ok(())
    }
}

fn state_dir(test_name: &str) -> PathBuf {
    let dir = std::env::temp_dir()
        .join("stackform-tests")
        .join(test_name);
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

fn new_stack(dir: &PathBuf) -> Stack<Recorder> {
    let _ = env_logger::builder().is_test(true).try_init();
    Stack::new("test-stack", dir, Recorder::default())
}

fn declare(
    stack: &mut Stack<Recorder>,
    version: u32,
) -> form::Result<(
    Construct<Store, StoreOutput>,
    Construct<Service, ServiceOutput>,
)> {
    let store = stack.resource(
        "store",
        Store {
            name: "store".into(),
            version,
        },
    )?;
    let service = stack.resource(
        "service",
        Service {
            store_arn: store.remote(|out| out.arn.clone()),
            replicas: 1,
        },
    )?;
    Ok((store, service))
}

fn read_state(stack: &Stack<Recorder>, id: &str) -> serde_json::Value {
    let path = stack.state_dir().join(format!("{id}.json"));
    let contents = std::fs::read_to_string(path).unwrap();
    serde_json::from_str(&contents).unwrap()
}

#[tokio::test]
async fn create_then_load() {
    let dir = state_dir("create_then_load");

    let mut stack = new_stack(&dir);
    let (store, service) = declare(&mut stack, 1).unwrap();
    assert_eq!(Action::Create, store.action());
    assert_eq!(Action::Create, service.action());
    let plan = stack.plan().unwrap();
    assert!(!plan.is_empty());
    assert_eq!(
        vec![vec!["create store".to_owned()], vec!["create service".to_owned()]],
        plan.steps()
    );
    stack.apply(plan).await.unwrap();
    assert_eq!(
        vec!["create store".to_owned(), "create service".to_owned()],
        stack.provider().calls()
    );
    assert_eq!(
        serde_json::json!({"endpoint": "https://arn:store:1"}),
        read_state(&stack, "service")["remote"]
    );

    let mut stack = new_stack(&dir);
    let (store, service) = declare(&mut stack, 1).unwrap();
    assert_eq!(Action::Load, store.action());
    assert_eq!(Action::Load, service.action());
    assert_eq!(
        Some(StoreOutput {
            arn: "arn:store:1".into()
        }),
        store.output()
    );
    let plan = stack.plan().unwrap();
    assert!(plan.is_empty());
    assert_eq!("No changes.\n", plan.to_string());
    stack.apply(plan).await.unwrap();
    assert!(stack.provider().calls().is_empty());
}

#[tokio::test]
async fn upstream_update_propagates_downstream() {
    let dir = state_dir("upstream_update_propagates_downstream");

    let mut stack = new_stack(&dir);
    declare(&mut stack, 1).unwrap();
    let plan = stack.plan().unwrap();
    stack.apply(plan).await.unwrap();

    let mut stack = new_stack(&dir);
    let (store, service) = declare(&mut stack, 2).unwrap();
    assert_eq!(Action::Update, store.action());
    assert_eq!(Action::Update, service.action());
    let plan = stack.plan().unwrap();
    assert_eq!(Some(0), plan.step_of("update store"));
    assert_eq!(Some(1), plan.step_of("update service"));
    stack.apply(plan).await.unwrap();
    assert_eq!(
        vec!["update store".to_owned(), "update service".to_owned()],
        stack.provider().calls()
    );
    assert_eq!(
        serde_json::json!({"endpoint": "https://arn:store:2"}),
        read_state(&stack, "service")["remote"]
    );
    assert_eq!(
        serde_json::json!({"token": "store", "value": "arn:store:2"}),
        read_state(&stack, "service")["local"]["store_arn"]
    );
}

#[test]
fn duplicate_id_is_an_error() {
    let dir = state_dir("duplicate_id_is_an_error");
    let mut stack = new_stack(&dir);
    let store = Store {
        name: "store".into(),
        version: 1,
    };
    stack.resource("store", store.clone()).unwrap();
    assert!(matches!(
        stack.resource("store", store),
        Err(Error::DuplicateId { id }) if id == "store"
    ));
}

#[test]
fn token_from_another_stack_is_missing() {
    let mut upstream = new_stack(&state_dir("token_from_another_stack_upstream"));
    let store = upstream
        .resource(
            "store",
            Store {
                name: "store".into(),
                version: 1,
            },
        )
        .unwrap();

    let mut downstream = new_stack(&state_dir("token_from_another_stack_downstream"));
    let result = downstream.resource(
        "service",
        Service {
            store_arn: store.remote(|out| out.arn.clone()),
            replicas: 1,
        },
    );
    assert!(matches!(
        result,
        Err(Error::MissingResource { name }) if name == "store"
    ));
}

#[tokio::test]
async fn orphans_are_destroyed() {
    let dir = state_dir("orphans_are_destroyed");

    let mut stack = new_stack(&dir);
    declare(&mut stack, 1).unwrap();
    let plan = stack.plan().unwrap();
    stack.apply(plan).await.unwrap();

    let mut stack = new_stack(&dir);
    stack.register::<Service>();
    stack
        .resource(
            "store",
            Store {
                name: "store".into(),
                version: 1,
            },
        )
        .unwrap();
    let plan = stack.plan().unwrap();
    assert!(plan.warnings.is_empty());
    let orphan = plan
        .actions
        .iter()
        .find(|action| action.id == "service")
        .unwrap();
    assert_eq!(Action::Destroy, orphan.action);
    assert!(orphan.is_orphan);
    assert_eq!(Some("Test::Service"), orphan.kind.as_deref());

    stack.apply(plan).await.unwrap();
    assert_eq!(vec!["delete service".to_owned()], stack.provider().calls());
    assert!(!stack.state_dir().join("service.json").exists());
    assert!(stack.state_dir().join("store.json").exists());
}

#[tokio::test]
async fn unknown_orphans_are_warnings() {
    let dir = state_dir("unknown_orphans_are_warnings");

    let mut stack = new_stack(&dir);
    declare(&mut stack, 1).unwrap();
    let plan = stack.plan().unwrap();
    stack.apply(plan).await.unwrap();

    let mut stack = new_stack(&dir);
    stack
        .resource(
            "store",
            Store {
                name: "store".into(),
                version: 1,
            },
        )
        .unwrap();
    let plan = stack.plan().unwrap();
    assert_eq!(1, plan.warnings.len());
    assert!(plan.warnings[0].contains("'service'"));
    assert!(plan.is_empty());
    stack.apply(plan).await.unwrap();
    assert!(stack.state_dir().join("service.json").exists());
}

#[tokio::test]
async fn teardown_destroys_dependents_first() {
    let dir = state_dir("teardown_destroys_dependents_first");

    let mut stack = new_stack(&dir);
    declare(&mut stack, 1).unwrap();
    let plan = stack.plan().unwrap();
    stack.apply(plan).await.unwrap();

    let mut stack = new_stack(&dir);
    declare(&mut stack, 1).unwrap();
    stack.clear_resources();
    let plan = stack.plan().unwrap();
    assert_eq!(2, plan.actions.len());
    assert!(plan
        .actions
        .iter()
        .all(|action| action.action == Action::Destroy && action.is_orphan));
    let service_step = plan.step_of("destroy service").unwrap();
    let store_step = plan.step_of("destroy store").unwrap();
    assert!(service_step < store_step, "{}", plan.schedule_string());
    assert_eq!(
        vec!["service", "store"],
        plan.actions
            .iter()
            .map(|action| action.id.as_str())
            .collect::<Vec<_>>()
    );
    assert_eq!(
        "  destroy 'service' [Test::Service] (orphan)\n  destroy 'store' [Test::Store] (orphan)\n",
        plan.to_string()
    );

    stack.apply(plan).await.unwrap();
    assert_eq!(
        vec!["delete service".to_owned(), "delete store".to_owned()],
        stack.provider().calls()
    );
    let remaining = std::fs::read_dir(stack.state_dir()).unwrap().count();
    assert_eq!(0, remaining);
}

#[test]
fn synth_lists_declarations_in_order() {
    let dir = state_dir("synth_lists_declarations_in_order");
    let mut stack = new_stack(&dir);
    declare(&mut stack, 1).unwrap();

    let template = stack.synth();
    assert_eq!("test-stack", template.stack);
    assert_eq!(
        vec!["store", "service"],
        template
            .resources
            .iter()
            .map(|r| r.id.as_str())
            .collect::<Vec<_>>()
    );
    assert_eq!(1, template.count_of_kind("Test::Service"));

    let service = template.resource("service").unwrap();
    assert_eq!(Action::Create, service.action);
    assert_eq!(vec!["store".to_owned()], service.depends_on);
    assert_eq!(
        Some(&serde_json::json!("store")),
        service.property("/store_arn/token")
    );
    assert_eq!(
        Some(&serde_json::Value::Null),
        service.property("/store_arn/value")
    );
    assert!(template.resource("store").unwrap().depends_on.is_empty());
}

#[test]
fn dependencies_merge_without_duplicates() {
    let deps = form::Dependencies::new("a")
        .merge(form::Dependencies::new("b"))
        .merge(form::Dependencies::new("a"));
    assert_eq!(&["a".to_owned(), "b".to_owned()], deps.as_slice());
    assert_eq!("a, b", deps.to_string());
}

#[tokio::test]
async fn state_file_is_complete_after_apply() {
    let dir = state_dir("state_file_is_complete_after_apply");
    for version in 1..=50 {
        let mut stack = new_stack(&dir);
        declare(&mut stack, version).unwrap();
        let plan = stack.plan().unwrap();
        stack.apply(plan).await.unwrap();
        assert_eq!(
            serde_json::json!({"endpoint": format!("https://arn:store:{version}")}),
            read_state(&stack, "service")["remote"],
            "state of 'service' after apply #{version}"
        );
        assert_eq!(
            serde_json::json!(version),
            read_state(&stack, "store")["local"]["version"]
        );
    }
}

#[tokio::test]
async fn unchanged_downstream_update_is_skipped() {
    let dir = state_dir("unchanged_downstream_update_is_skipped");
    let declare_tagged = |stack: &mut Stack<Recorder>, tag: &str| {
        let tagged = stack
            .resource(
                "tagged",
                Tagged {
                    name: "tagged".into(),
                    tag: tag.into(),
                },
            )
            .unwrap();
        let service = stack
            .resource(
                "service",
                Service {
                    store_arn: tagged.remote(|out| out.arn.clone()),
                    replicas: 1,
                },
            )
            .unwrap();
        (tagged, service)
    };

    let mut stack = new_stack(&dir);
    declare_tagged(&mut stack, "a");
    let plan = stack.plan().unwrap();
    stack.apply(plan).await.unwrap();
    let service_state = read_state(&stack, "service");

    let mut stack = new_stack(&dir);
    let (tagged, service) = declare_tagged(&mut stack, "b");
    assert_eq!(Action::Update, tagged.action());
    assert_eq!(Action::Update, service.action());
    let plan = stack.plan().unwrap();
    stack.apply(plan).await.unwrap();
    assert_eq!(vec!["update tagged".to_owned()], stack.provider().calls());
    assert_eq!(service_state, read_state(&stack, "service"));
    assert_eq!(
        serde_json::json!("b"),
        read_state(&stack, "tagged")["local"]["tag"]
    );
}

#[tokio::test]
async fn import_reads_then_loads() {
    let dir = state_dir("import_reads_then_loads");
    let store = Store {
        name: "store".into(),
        version: 3,
    };

    let mut stack = new_stack(&dir);
    let imported = stack.import("store", store.clone()).unwrap();
    assert_eq!(Action::Read, imported.action());
    assert_eq!(None, imported.output());
    let plan = stack.plan().unwrap();
    assert!(!plan.is_empty());
    assert_eq!(vec![vec!["read store".to_owned()]], plan.steps());
    assert_eq!("  read 'store' [Test::Store]\n", plan.to_string());
    stack.apply(plan).await.unwrap();
    assert_eq!(vec!["read store".to_owned()], stack.provider().calls());
    assert_eq!(
        serde_json::json!({"arn": "arn:store:3"}),
        read_state(&stack, "store")["remote"]
    );

    let mut stack = new_stack(&dir);
    let imported = stack.import("store", store.clone()).unwrap();
    assert_eq!(Action::Load, imported.action());
    assert_eq!(
        Some(StoreOutput {
            arn: "arn:store:3".into()
        }),
        imported.output()
    );

    let mut stack = new_stack(&dir);
    let declared = stack.resource("store", store).unwrap();
    assert_eq!(Action::Load, declared.action());
}

#[tokio::test]
async fn dependents_of_an_import_wait_for_the_read() {
    let dir = state_dir("dependents_of_an_import_wait_for_the_read");
    let mut stack = new_stack(&dir);
    let store = stack
        .import(
            "store",
            Store {
                name: "store".into(),
                version: 1,
            },
        )
        .unwrap();
    stack
        .resource(
            "service",
            Service {
                store_arn: store.remote(|out| out.arn.clone()),
                replicas: 1,
            },
        )
        .unwrap();
    let plan = stack.plan().unwrap();
    assert_eq!(
        vec![vec!["read store".to_owned()], vec!["create service".to_owned()]],
        plan.steps()
    );
    stack.apply(plan).await.unwrap();
    assert_eq!(
        vec!["read store".to_owned(), "create service".to_owned()],
        stack.provider().calls()
    );
}

#[test]
fn schedule_lists_steps() {
    let dir = state_dir("schedule_lists_steps");
    let mut stack = new_stack(&dir);
    declare(&mut stack, 1).unwrap();
    let plan = stack.plan().unwrap();
    assert_eq!(
        "--- step 1\n  create store\n---\n--- step 2\n  create service\n---\n",
        plan.schedule_string()
    );

    let plan = stack.plan().unwrap();
    assert!(plan.actions.is_empty());
    assert_eq!("--- No changes.\n", plan.schedule_string());
    assert_eq!("No changes.\n", plan.to_string());
}

#[test]
fn apply_graph_is_saved_as_dot() {
    let dir = state_dir("apply_graph_is_saved_as_dot");
    std::fs::create_dir_all(&dir).unwrap();
    let mut stack = new_stack(&dir);
    declare(&mut stack, 1).unwrap();

    let path = dir.join("apply.dot");
    stack.save_apply_graph(&path).unwrap();
    let dot = std::fs::read_to_string(&path).unwrap();
    assert!(dot.contains("digraph"), "{dot}");
    assert!(dot.contains("create store"), "{dot}");
    assert!(dot.contains("create service"), "{dot}");

    // saving the graph doesn't consume the declarations
    let plan = stack.plan().unwrap();
    assert_eq!(2, plan.actions.len());
}
