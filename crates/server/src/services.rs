//! Shared clients built once at startup and handed to every loop.

use std::sync::Arc;

use crate::command::CommandRunner;
use crate::config::CoreConfig;
use crate::editor::resolver::{EditorResolverOptions, EndpointTemplates};
use crate::editor::{EditorRegistry, EditorResolver, EditorRpc, Liveness};
use crate::process_tree::ProcessSnapshotter;
use crate::tmux::TmuxClient;

#[derive(Clone)]
pub struct Services {
    pub processes: Arc<ProcessSnapshotter>,
    pub tmux: Arc<TmuxClient>,
    pub editors: Arc<EditorResolver>,
    pub rpc: Arc<EditorRpc>,
}

impl Services {
    pub fn new(
        config: &CoreConfig,
        runner: Arc<dyn CommandRunner>,
        liveness: Arc<dyn Liveness>,
    ) -> Self {
        let processes = Arc::new(ProcessSnapshotter::new(
            runner.clone(),
            config.process_snapshot_ttl,
            config.command_timeout,
        ));
        let tmux = Arc::new(TmuxClient::new(
            runner.clone(),
            config.tmux_path.clone(),
            config.command_timeout,
            config.pane_settle_delay,
            config.reject_message_delay,
        ));
        let editors = Arc::new(EditorResolver::new(
            EditorRegistry::new(config.registry_path.clone(), config.registry_cache_ttl),
            runner.clone(),
            processes.clone(),
            tmux.clone(),
            liveness,
            EditorResolverOptions {
                lsof_path: config.lsof_path.clone(),
                editor_name: config.editor_process_name.clone(),
                command_timeout: config.command_timeout,
                cache_ttl: config.editor_cache_ttl,
                subtree_depth: config.editor_subtree_depth,
                templates: EndpointTemplates::from_env(),
            },
        ));
        let rpc = Arc::new(EditorRpc::new(
            runner,
            config.bridge_path.clone(),
            config.rpc_timeout,
        ));

        Self {
            processes,
            tmux,
            editors,
            rpc,
        }
    }
}

#[cfg(test)]
pub mod testing {
    //! Store + services wired against a scripted runner.

    use std::path::Path;
    use std::time::Duration;

    use super::*;
    use crate::command::testing::ScriptedRunner;
    use crate::paths::Paths;
    use crate::session_store::SessionStore;

    /// Every pid is alive and every endpoint exists.
    pub struct AllAlive;

    impl Liveness for AllAlive {
        fn is_alive(&self, _pid: u32) -> bool {
            true
        }

        fn endpoint_exists(&self, _endpoint: &str) -> bool {
            true
        }
    }

    pub fn test_config(dir: &Path) -> CoreConfig {
        let mut config = CoreConfig::new(&Paths::rooted_at(dir))
            .with_bridge(Some("bridge".into()))
            .with_registry(Some(dir.join("registry.json")));
        config.command_timeout = Duration::from_secs(1);
        config.pane_settle_delay = Duration::from_millis(1);
        config.reject_message_delay = Duration::from_millis(1);
        config.process_snapshot_ttl = Duration::from_secs(60);
        config
    }

    pub struct TestBed {
        pub store: SessionStore,
        pub runner: Arc<ScriptedRunner>,
        pub services: Services,
        pub config: CoreConfig,
        pub dir: tempfile::TempDir,
    }

    /// `registry` is written to the registry path when given.
    pub fn test_bed(runner: ScriptedRunner, registry: Option<&str>) -> TestBed {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        if let Some(contents) = registry {
            std::fs::write(&config.registry_path, contents).unwrap();
        }
        let (store, _task) = SessionStore::spawn(&config, Paths::rooted_at(dir.path()));
        let runner = Arc::new(runner);
        let services = Services::new(&config, runner.clone(), Arc::new(AllAlive));
        TestBed {
            store,
            runner,
            services,
            config,
            dir,
        }
    }
}
