//! The stack scope.
//!
//! A [`Stack`] collects construct declarations, compares them against the
//! state files of the previous apply and schedules the resulting actions
//! as a DAG.
use std::{
    collections::{HashMap, HashSet},
    future::Future,
    ops::Deref,
    path::{Path, PathBuf},
    pin::Pin,
};

use dagga::{dot::DagLegend, Node, Schedule};
use snafu::prelude::*;
use tokio::io::AsyncWriteExt;

use crate::{
    remote::{Remote, RemoteVar, Remotes},
    template::{Template, TemplateResource},
    Action, CreateFileSnafu, DeserializeSnafu, DotSnafu, Error, HasDependencies,
    MissingNameSnafu, MissingRemoteSnafu, MissingResourceSnafu, MissingStateFileSnafu, Resource,
    Result, ScanStateDirSnafu, SerializeSnafu, StateFileDeleteSnafu, StateFileReadSnafu,
    WriteFileSnafu,
};

fn indent(s: &str) -> String {
    s.lines()
        .map(|line| format!("  {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// The path to an individual construct's state file.
fn state_file_path(id: &str, state_dir: impl AsRef<Path>) -> PathBuf {
    state_dir.as_ref().join(format!("{id}.json"))
}

/// Persisted record of one applied construct.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
struct StateRecord {
    id: String,
    kind: String,
    /// Rust type name of the definition, used to find a deleter for orphans.
    type_name: String,
    local: serde_json::Value,
    remote: serde_json::Value,
    /// Ids this construct depended on when it was applied.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    dependencies: Vec<String>,
}

impl StateRecord {
    fn new<T: Resource>(id: &str, local: &T, remote: &T::Output) -> Result<Self> {
        Ok(Self {
            id: id.to_owned(),
            kind: T::kind().to_owned(),
            type_name: std::any::type_name::<T>().to_owned(),
            local: serde_json::to_value(local).context(SerializeSnafu {
                name: format!("state of {id}"),
            })?,
            remote: serde_json::to_value(remote).context(SerializeSnafu {
                name: format!("remote state of {id}"),
            })?,
            dependencies: local.dependencies().into_iter().collect(),
        })
    }

    fn read(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).context(StateFileReadSnafu { path })?;
        log::trace!("contents of {path:?}:\n{}", indent(&contents));
        serde_json::from_str(&contents).context(DeserializeSnafu {
            name: path.display().to_string(),
        })
    }

    async fn save(&self, state_dir: &Path) -> Result<()> {
        let path = state_file_path(&self.id, state_dir);
        log::info!("  storing '{}' to {path:?}", self.id);
        let contents = serde_json::to_string_pretty(self).context(SerializeSnafu {
            name: self.id.clone(),
        })?;
        tokio::fs::create_dir_all(state_dir)
            .await
            .context(CreateFileSnafu { path: state_dir })?;
        let mut file = tokio::fs::File::create(&path)
            .await
            .context(CreateFileSnafu { path: &path })?;
        file.write_all(contents.as_bytes())
            .await
            .context(WriteFileSnafu { path: &path })?;
        file.flush().await.context(WriteFileSnafu { path: &path })?;
        Ok(())
    }
}

/// Read a construct's previously applied definition and output.
fn read_typed<T: Resource>(state_dir: &Path, id: &str) -> Result<(T, T::Output)> {
    let path = state_file_path(id, state_dir);
    ensure!(path.exists(), MissingStateFileSnafu { id });
    log::debug!("reading '{id}' from {path:?}");
    let record = StateRecord::read(&path)?;
    let local = serde_json::from_value(record.local).context(DeserializeSnafu { name: id })?;
    let remote = serde_json::from_value(record.remote).context(DeserializeSnafu {
        name: format!("remote {id}"),
    })?;
    Ok((local, remote))
}

/// Handle to a declared construct.
///
/// Derefs to the definition. Use [`Construct::remote`] to hand its output to
/// other constructs.
#[derive(Clone, Debug)]
pub struct Construct<L, R> {
    id: String,
    definition: L,
    action: Action,
    pub(crate) remote_var: RemoteVar<R>,
}

impl<L, R> Deref for Construct<L, R> {
    type Target = L;

    fn deref(&self) -> &Self::Target {
        &self.definition
    }
}

impl<L, R> AsRef<L> for Construct<L, R> {
    fn as_ref(&self) -> &L {
        &self.definition
    }
}

impl<L, R> Construct<L, R> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The action that applying the stack will take on this construct.
    pub fn action(&self) -> Action {
        self.action
    }
}

impl<T: Resource> Construct<T, T::Output> {
    /// Map this construct's output into a token for other definitions.
    pub fn remote<X: Clone + core::fmt::Debug + 'static>(
        &self,
        f: impl Fn(&T::Output) -> X + 'static,
    ) -> Remote<X> {
        Remote::new(self, f)
    }

    /// The output, once the construct has been loaded or applied.
    pub fn output(&self) -> Option<T::Output> {
        self.remote_var.get()
    }
}

type NodeRunFn<P> = Box<dyn FnOnce(&'_ P) -> Pin<Box<dyn Future<Output = Result<()>> + '_>>>;

struct StackNode<P> {
    name: String,
    run: NodeRunFn<P>,
}

struct RunAction<'a, P, T: Resource<Provider = P>> {
    provider: &'a P,
    state_dir: PathBuf,
    id: String,
    action: Action,
    definition: T,
    /// Definition from the last apply, if any.
    previous: Option<T>,
    remote_var: RemoteVar<T::Output>,
}

impl<P, T: Resource<Provider = P>> RunAction<'_, P, T> {
    async fn run(self) -> Result<()> {
        let Self {
            provider,
            state_dir,
            id,
            action,
            definition,
            previous,
            remote_var,
        } = self;
        log::info!("{action} '{id}':");

        match action {
            Action::Load => {}
            Action::Create => {
                let output = definition
                    .create(provider)
                    .await
                    .map_err(|error| Error::Create {
                        name: id.clone(),
                        error: Box::new(error),
                    })?;
                remote_var.set(Some(output));
            }
            Action::Read => {
                let output = definition
                    .read(provider)
                    .await
                    .map_err(|error| Error::Import {
                        name: id.clone(),
                        error: Box::new(error),
                    })?;
                log::info!("  imported {output:?}");
                remote_var.set(Some(output));
            }
            Action::Update => {
                let previous_remote = remote_var
                    .get()
                    .context(MissingRemoteSnafu { name: &id })?;
                match previous {
                    Some(previous_local) if previous_local != definition => {
                        let cmp =
                            pretty_assertions::Comparison::new(&previous_local, &definition);
                        log::info!("  changes:\n{}", indent(&cmp.to_string()));
                        let output = definition
                            .update(provider, &previous_local, &previous_remote)
                            .await
                            .map_err(|error| Error::Update {
                                name: id.clone(),
                                error: Box::new(error),
                            })?;
                        remote_var.set(Some(output));
                    }
                    _ => {
                        log::warn!(
                            "  skipping '{id}' update as its definition has not changed once \
                             tokens were resolved"
                        );
                    }
                }
            }
            Action::Destroy => {
                let previous_remote = remote_var
                    .get()
                    .context(MissingRemoteSnafu { name: &id })?;
                definition
                    .delete(provider, &previous_remote)
                    .await
                    .map_err(|error| Error::Destroy {
                        name: id.clone(),
                        error: Box::new(error),
                    })?;
                let path = state_file_path(&id, &state_dir);
                log::info!("  removing state file {path:?}");
                tokio::fs::remove_file(&path)
                    .await
                    .context(StateFileDeleteSnafu { path })?;
                remote_var.set(None);
                log::info!("  '{id}' is destroyed");
                return Ok(());
            }
        }

        let output = remote_var
            .get()
            .context(MissingRemoteSnafu { name: &id })?;
        StateRecord::new(&id, &definition, &output)?
            .save(&state_dir)
            .await?;
        log::info!("  success!");
        Ok(())
    }
}

/// Type-erased destruction of a stored construct, used for orphans.
///
/// One is registered per definition type the first time the type is used
/// in a stack, or manually with [`Stack::register`].
struct Deleter<P> {
    make_run_fn: Box<dyn Fn(PathBuf, String) -> NodeRunFn<P>>,
}

/// A single planned action.
#[derive(Clone, Debug, PartialEq)]
pub struct PlannedAction {
    pub id: String,
    pub action: Action,
    pub kind: Option<String>,
    /// Whether this construct has state but was not declared in this run.
    pub is_orphan: bool,
}

/// A plan of actions produced by [`Stack::plan`].
///
/// Inspect the plan before passing it to [`Stack::apply`].
pub struct Plan<P> {
    /// Actions in schedule order.
    pub actions: Vec<PlannedAction>,
    /// Orphans that could not be scheduled for deletion.
    pub warnings: Vec<String>,
    schedule: Schedule<Node<StackNode<P>, usize>>,
}

impl<P> Plan<P> {
    /// Whether applying this plan would change anything on the platform.
    pub fn is_empty(&self) -> bool {
        self.actions.iter().all(|a| a.action == Action::Load)
    }

    /// Names of the graph nodes, batch by batch.
    pub fn steps(&self) -> Vec<Vec<String>> {
        self.schedule
            .batches
            .iter()
            .map(|batch| batch.iter().map(|node| node.name().to_owned()).collect())
            .collect()
    }

    /// Index of the batch that runs the given node, eg. `"create MyLambda"`.
    pub fn step_of(&self, node_name: &str) -> Option<usize> {
        self.schedule
            .batches
            .iter()
            .position(|batch| batch.iter().any(|node| node.name() == node_name))
    }

    pub fn schedule_string(&self) -> String {
        let mut s = String::new();
        if self.schedule.batches.is_empty() {
            s.push_str("--- No changes.\n");
        }
        for (i, batch) in self.steps().into_iter().enumerate() {
            s.push_str(&format!("--- step {}\n", i + 1));
            for name in batch {
                s.push_str(&format!("  {name}\n"));
            }
            s.push_str("---\n");
        }
        s
    }
}

impl<P> core::fmt::Display for Plan<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() && self.warnings.is_empty() {
            return f.write_str("No changes.\n");
        }
        for action in &self.actions {
            let orphan_marker = if action.is_orphan { " (orphan)" } else { "" };
            let kind = action.kind.as_deref().unwrap_or("unknown");
            writeln!(
                f,
                "  {} '{}' [{}]{}",
                action.action, action.id, kind, orphan_marker
            )?;
        }
        for warning in &self.warnings {
            writeln!(f, "  WARNING: {warning}")?;
        }
        Ok(())
    }
}

/// A unit of infrastructure declared, planned and applied together.
///
/// State for each construct lives in `<state_dir>/<stack id>/<construct id>.json`.
pub struct Stack<P> {
    id: String,
    path: PathBuf,
    provider: P,
    remotes: Remotes,
    graph: dagga::Dag<StackNode<P>, usize>,
    deleters: HashMap<String, Deleter<P>>,
    declarations: Vec<TemplateResource>,
}

impl<P: 'static> Stack<P> {
    pub fn new(id: impl Into<String>, state_dir: impl AsRef<Path>, provider: P) -> Self {
        let id = id.into();
        Self {
            path: state_dir.as_ref().join(&id),
            id,
            provider,
            remotes: Remotes::default(),
            graph: dagga::Dag::default(),
            deleters: HashMap::default(),
            declarations: vec![],
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Directory holding this stack's state files.
    pub fn state_dir(&self) -> &Path {
        &self.path
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    fn ensure_registered<T: Resource<Provider = P>>(&mut self) {
        let type_name = std::any::type_name::<T>();
        if self.deleters.contains_key(type_name) {
            return;
        }
        log::trace!("registering deleter for {type_name}");
        self.deleters.insert(
            type_name.to_owned(),
            Deleter {
                make_run_fn: Box::new(|state_dir, id| {
                    Box::new(move |provider: &P| {
                        Box::pin(async move {
                            let (definition, output) = read_typed::<T>(&state_dir, &id)?;
                            let remote_var = RemoteVar::default();
                            remote_var.set(Some(output));
                            log::info!("'{id}' is an orphan");
                            RunAction {
                                provider,
                                state_dir,
                                id,
                                action: Action::Destroy,
                                definition,
                                previous: None,
                                remote_var,
                            }
                            .run()
                            .await
                        }) as Pin<Box<dyn Future<Output = Result<()>> + '_>>
                    })
                }),
            },
        );
    }

    /// Register a definition type for orphan deletion.
    ///
    /// Types are registered automatically by [`Stack::resource`], so this is
    /// only needed for types that are no longer declared anywhere but may
    /// still have state files from a previous apply.
    pub fn register<T: Resource<Provider = P>>(&mut self) -> &mut Self {
        self.ensure_registered::<T>();
        self
    }

    /// Graph keys of everything `definition` depends on.
    fn dependency_keys<T: HasDependencies>(&self, definition: &T) -> Result<Vec<usize>> {
        definition
            .dependencies()
            .into_iter()
            .map(|dep| {
                self.remotes
                    .get(&dep)
                    .map(|var| var.key)
                    .context(MissingResourceSnafu { name: dep })
            })
            .collect()
    }

    /// `when_missing` is the action taken when there is no state for `id`.
    fn determine_action<T: Resource<Provider = P>>(
        &self,
        id: &str,
        definition: &T,
        when_missing: Action,
    ) -> Result<(Action, Option<(T, T::Output)>)> {
        match read_typed::<T>(&self.path, id) {
            Ok((stored, output)) => {
                log::debug!("  last output: {output:?}");
                let action = if *definition != stored {
                    log::debug!("  '{id}' has changed since the last apply");
                    Action::Update
                } else if definition.dependencies().into_iter().any(|dep| {
                    self.remotes
                        .get(&dep)
                        .map(|var| var.action != Action::Load)
                        .unwrap_or_default()
                }) {
                    log::debug!("  an upstream dependency of '{id}' is changing");
                    Action::Update
                } else {
                    Action::Load
                };
                Ok((action, Some((stored, output))))
            }
            Err(Error::MissingStateFile { .. }) => {
                log::debug!("  no state for '{id}', action is '{when_missing}'");
                Ok((when_missing, None))
            }
            Err(e) => {
                log::error!("could not declare '{id}': {e}");
                Err(e)
            }
        }
    }

    /// Declares a construct.
    ///
    /// Depending on the state of the last apply the construct will be
    /// created, updated or simply loaded.
    ///
    /// ## Errors
    /// Errs if `id` is already declared in this stack, or if the definition
    /// holds a token on a construct that isn't declared.
    pub fn resource<T: Resource<Provider = P>>(
        &mut self,
        id: impl AsRef<str>,
        definition: T,
    ) -> Result<Construct<T, T::Output>> {
        self.define(id.as_ref(), definition, Action::Create)
    }

    /// Declares a construct that already exists on the platform.
    ///
    /// Without state for `id` the resource is read with [`Resource::read`]
    /// instead of created, and its output is stored. Once stored it behaves
    /// exactly like a construct declared with [`Stack::resource`], so a
    /// retained bucket or table can be adopted again after a teardown.
    ///
    /// ## Errors
    /// Same as [`Stack::resource`].
    pub fn import<T: Resource<Provider = P>>(
        &mut self,
        id: impl AsRef<str>,
        definition: T,
    ) -> Result<Construct<T, T::Output>> {
        self.define(id.as_ref(), definition, Action::Read)
    }

    fn define<T: Resource<Provider = P>>(
        &mut self,
        id: &str,
        definition: T,
        when_missing: Action,
    ) -> Result<Construct<T, T::Output>> {
        self.ensure_registered::<T>();
        let (action, stored) = self.determine_action(id, &definition, when_missing)?;
        let reads = self.dependency_keys(&definition)?;
        let properties = serde_json::to_value(&definition).context(SerializeSnafu { name: id })?;
        let (remote_var, key) = self.remotes.declare::<T::Output>(id, T::kind(), action)?;
        let (previous, output) = stored.unzip();
        remote_var.set(output);

        let run: NodeRunFn<P> = Box::new({
            let state_dir = self.path.clone();
            let id = id.to_owned();
            let definition = definition.clone();
            let remote_var = remote_var.clone();
            move |provider: &P| {
                Box::pin(
                    RunAction {
                        provider,
                        state_dir,
                        id,
                        action,
                        definition,
                        previous,
                        remote_var,
                    }
                    .run(),
                ) as Pin<Box<dyn Future<Output = Result<()>> + '_>>
            }
        });
        let node_name = format!("{action} {id}");
        log::debug!("adding node '{node_name}' with result {key}, reading {reads:?}");
        self.graph.add_node(
            Node::new(StackNode {
                name: node_name.clone(),
                run,
            })
            .with_name(node_name)
            .with_reads(reads)
            .with_result(key),
        );

        self.declarations.push(TemplateResource {
            id: id.to_owned(),
            kind: T::kind().to_owned(),
            action,
            properties,
            depends_on: definition.dependencies().into_iter().collect(),
        });

        Ok(Construct {
            id: id.to_owned(),
            definition,
            action,
            remote_var,
        })
    }

    /// Forget every declaration made so far, keeping registered types.
    ///
    /// A following [`Stack::plan`] treats every state file as an orphan,
    /// which is how a whole stack is torn down.
    pub fn clear_resources(&mut self) {
        self.remotes = Remotes::default();
        self.graph = dagga::Dag::default();
        self.declarations.clear();
    }

    /// Snapshot of everything declared so far.
    pub fn synth(&self) -> Template {
        Template {
            stack: self.id.clone(),
            resources: self.declarations.clone(),
        }
    }

    fn graph_legend(&self) -> Result<DagLegend<usize>> {
        let mut missing = None;
        let legend = self.graph.legend()?.with_resources_named(|key| {
            let name = self.remotes.get_id_by_key(*key);
            if name.is_none() {
                missing = Some(*key);
            }
            name
        });
        if let Some(missing) = missing {
            log::error!("missing construct {missing}, declared:\n{}", self.remotes);
            return MissingNameSnafu { missing }.fail();
        }
        Ok(legend)
    }

    /// Write the pending apply graph as a graphviz dot file.
    pub fn save_apply_graph(&self, path: impl AsRef<Path>) -> Result<()> {
        if self.graph.is_empty() {
            log::warn!("apply graph is empty, writing an empty dot file");
        }
        let legend = self.graph_legend()?;
        dagga::dot::save_as_dot(&legend, path).context(DotSnafu)?;
        Ok(())
    }

    /// State records in the state directory that were not declared.
    fn scan_orphans(&self, declared: &HashSet<String>) -> Result<Vec<StateRecord>> {
        let mut orphans = vec![];
        if !self.path.exists() {
            return Ok(orphans);
        }
        let entries = std::fs::read_dir(&self.path).context(ScanStateDirSnafu { path: &self.path })?;
        for entry in entries {
            let path = entry
                .context(ScanStateDirSnafu { path: &self.path })?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if declared.contains(id) {
                continue;
            }
            orphans.push(StateRecord::read(&path)?);
        }
        orphans.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(orphans)
    }

    /// Build an execution plan from the declarations and the state directory.
    ///
    /// State files with no declaration are orphans. Orphans of a registered
    /// type are scheduled for destruction, always before the constructs they
    /// depend on. Other orphans produce warnings.
    ///
    /// Planning consumes the declarations, so the stack can be declared
    /// again afterwards.
    pub fn plan(&mut self) -> Result<Plan<P>> {
        let mut actions: Vec<PlannedAction> = self
            .remotes
            .iter()
            .map(|(id, var)| PlannedAction {
                id: id.clone(),
                action: var.action,
                kind: Some(var.kind.clone()),
                is_orphan: false,
            })
            .collect();
        let mut warnings = vec![];

        // Declare every deletable orphan before wiring any of them, so that
        // dependency keys resolve regardless of scan order.
        let declared = self.remotes.declared_ids();
        let mut deletable = vec![];
        for record in self.scan_orphans(&declared)? {
            if self.deleters.contains_key(&record.type_name) {
                log::info!(
                    "orphan detected: '{}' ({}), scheduling destruction",
                    record.id,
                    record.kind
                );
                let (_, key) = self.remotes.declare::<serde_json::Value>(
                    &record.id,
                    record.kind.clone(),
                    Action::Destroy,
                )?;
                deletable.push((record, key));
            } else {
                let msg = format!(
                    "Orphaned construct '{}' ({}) has state in {:?} but its type is not known \
                     to this run. Call `stack.register::<{}>()` to enable its destruction.",
                    record.id, record.kind, self.path, record.type_name
                );
                log::warn!("{msg}");
                warnings.push(msg);
            }
        }

        for (record, key) in deletable {
            let reads: Vec<usize> = record
                .dependencies
                .iter()
                .filter_map(|dep| self.remotes.get(dep).map(|var| var.key))
                .collect();

            let load_name = format!("load {}", record.id);
            let load: NodeRunFn<P> = Box::new(|_provider: &P| {
                Box::pin(async { Ok(()) }) as Pin<Box<dyn Future<Output = Result<()>> + '_>>
            });
            self.graph.add_node(
                Node::new(StackNode {
                    name: load_name.clone(),
                    run: load,
                })
                .with_name(load_name)
                .with_reads(reads.clone())
                .with_result(key),
            );

            let Some(deleter) = self.deleters.get(&record.type_name) else {
                continue;
            };
            let run = (deleter.make_run_fn)(self.path.clone(), record.id.clone());
            let destroy_name = format!("destroy {}", record.id);
            // Reading the dependencies here keeps them alive until this
            // construct is gone.
            self.graph.add_node(
                Node::new(StackNode {
                    name: destroy_name.clone(),
                    run,
                })
                .with_name(destroy_name)
                .with_reads(reads)
                .with_move(key),
            );

            actions.push(PlannedAction {
                id: record.id,
                action: Action::Destroy,
                kind: Some(record.kind),
                is_orphan: true,
            });
        }

        let graph = std::mem::take(&mut self.graph);
        let schedule = graph
            .build_schedule()
            .map_err(|e| Error::Schedule { msg: e.to_string() })?;

        // Node names are "{action} {id}". Orphans also have a "load {id}"
        // node, they are ordered by their "destroy {id}" node.
        let mut ordered = Vec::with_capacity(actions.len());
        for batch in &schedule.batches {
            for node in batch {
                let Some((verb, id)) = node.name().split_once(' ') else {
                    continue;
                };
                if let Some(pos) = actions
                    .iter()
                    .position(|a| a.id == id && (!a.is_orphan || verb == "destroy"))
                {
                    ordered.push(actions.remove(pos));
                }
            }
        }
        ordered.extend(actions);

        self.remotes = Remotes::default();
        self.declarations.clear();

        Ok(Plan {
            actions: ordered,
            warnings,
            schedule,
        })
    }

    /// Execute a plan previously built by [`Stack::plan`].
    pub async fn apply(&mut self, plan: Plan<P>) -> Result<()> {
        for (i, batch) in plan.schedule.batches.into_iter().enumerate() {
            for node in batch {
                let node = node.into_inner();
                log::debug!("step {}: {}", i + 1, node.name);
                (node.run)(&self.provider).await?;
            }
        }
        Ok(())
    }
}
