//! Integration tests for fretforge

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use tempfile::TempDir;

    /// Command with a private config that keeps the audit log off
    fn fretforge(dir: &TempDir) -> Command {
        let config = dir.path().join("config.toml");
        if !config.exists() {
            std::fs::write(&config, "[general]\naudit_log = false\n").unwrap();
        }
        let mut cmd = cargo_bin_cmd!("fretforge");
        cmd.env("FRETFORGE_CONFIG", &config).env("CI", "1");
        cmd
    }

    #[test]
    fn help_displays() {
        let dir = TempDir::new().unwrap();
        fretforge(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("incremental part builds"));
    }

    #[test]
    fn version_displays() {
        let dir = TempDir::new().unwrap();
        fretforge(&dir)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("fretforge"));
    }

    #[test]
    fn build_plain_prints_assembly_digest() {
        let dir = TempDir::new().unwrap();
        fretforge(&dir)
            .args(["build", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::is_match(r"^assembly [0-9a-f]{64}\n$").unwrap());
    }

    #[test]
    fn build_is_deterministic_across_runs() {
        let dir = TempDir::new().unwrap();
        let first = fretforge(&dir)
            .args(["build", "neck", "--format", "plain", "--set", "scale.bass=650"])
            .output()
            .unwrap();
        let second = fretforge(&dir)
            .args(["build", "neck", "--format", "plain", "--set", "scale.bass=650.0"])
            .output()
            .unwrap();

        assert!(first.status.success());
        assert_eq!(first.stdout, second.stdout);
    }

    #[test]
    fn then_set_reports_only_affected_parts_rebuilt() {
        let dir = TempDir::new().unwrap();
        let output = fretforge(&dir)
            .args([
                "build",
                "--format",
                "json",
                "--then-set",
                "headStock.angle=12",
            ])
            .output()
            .unwrap();
        assert!(output.status.success());

        let rounds: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(rounds.as_array().unwrap().len(), 2);
        assert_eq!(rounds[0]["rebuilt"].as_array().unwrap().len(), 8);
        assert_eq!(
            rounds[1]["rebuilt"],
            serde_json::json!(["assembly", "headstock"])
        );
        assert_eq!(rounds[1]["changed"], serde_json::json!(["headStock.angle"]));
        assert_ne!(rounds[0]["parts"][0]["digest"], rounds[1]["parts"][0]["digest"]);
    }

    #[test]
    fn build_with_parameter_file() {
        let dir = TempDir::new().unwrap();
        let params = dir.path().join("strat.toml");
        std::fs::write(&params, "[scale]\nbass = 648.0\ntreble = 648.0\n").unwrap();

        fretforge(&dir)
            .args(["build", "fretboard", "--format", "plain", "--params"])
            .arg(&params)
            .assert()
            .success()
            .stdout(predicate::str::starts_with("fretboard "));
    }

    #[test]
    fn build_rejects_invalid_choice() {
        let dir = TempDir::new().unwrap();
        fretforge(&dir)
            .args(["build", "--set", "neck.joint=Glued"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("neck.joint"));
    }

    #[test]
    fn build_unknown_node() {
        let dir = TempDir::new().unwrap();
        fretforge(&dir)
            .args(["build", "tailpiece"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown build node"))
            .stderr(predicate::str::contains("fretforge graph"));
    }

    #[test]
    fn params_lists_catalogue() {
        let dir = TempDir::new().unwrap();
        fretforge(&dir)
            .args(["params", "headStock.", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::contains("headStock.angle=9"))
            .stdout(predicate::str::contains("scale.bass").not());
    }

    #[test]
    fn graph_affected_by() {
        let dir = TempDir::new().unwrap();
        fretforge(&dir)
            .args(["graph", "--affected-by", "headStock.angle", "--format", "plain"])
            .assert()
            .success()
            .stdout("assembly\nheadstock\n");
    }

    #[test]
    fn graph_affected_by_unknown_parameter_fails() {
        let dir = TempDir::new().unwrap();
        fretforge(&dir)
            .args(["graph", "--affected-by", "headStock.tilt"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown parameter: headStock.tilt"))
            .stderr(predicate::str::contains("fretforge params"));
    }

    #[test]
    fn graph_order_starts_with_constructions() {
        let dir = TempDir::new().unwrap();
        fretforge(&dir)
            .args(["graph", "--order", "headstock", "--format", "plain"])
            .assert()
            .success()
            .stdout("constructions\nneck\nheadstock\n");
    }

    #[test]
    fn config_path() {
        let dir = TempDir::new().unwrap();
        fretforge(&dir)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let dir = TempDir::new().unwrap();
        fretforge(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[general]"))
            .stdout(predicate::str::contains("audit_log = false"));
    }

    #[test]
    fn config_init_respects_existing_file() {
        let dir = TempDir::new().unwrap();
        fretforge(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("--force"));

        fretforge(&dir)
            .args(["config", "init", "--force"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration initialized"));

        let written = std::fs::read_to_string(dir.path().join("config.toml")).unwrap();
        assert!(written.contains("[scheduler]"));
    }

    #[test]
    fn broken_config_is_reported() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.toml"), "[cache\n").unwrap();
        fretforge(&dir)
            .args(["params"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"));
    }
}

mod pipeline_tests {
    use fretforge::cache::CachePolicy;
    use fretforge::error::ForgeError;
    use fretforge::graph::{BuildNode, DependencyGraph, NodeKind};
    use fretforge::kernel::{BuilderTable, GeometryKernel, ManifestKernel, ResolvedInputs};
    use fretforge::params::{ParamValue, ParameterStore};
    use fretforge::pipeline::{Pipeline, PipelineOptions};
    use fretforge::scheduler::{ArtifactSource, NodeState, ProgressState};
    use fretforge::KernelError;
    use futures_util::future::join_all;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Kernel calls per node
    #[derive(Clone, Default)]
    struct Calls(Arc<Mutex<HashMap<String, usize>>>);

    impl Calls {
        fn of(&self, node: &str) -> usize {
            self.0.lock().unwrap().get(node).copied().unwrap_or(0)
        }

        fn total(&self) -> usize {
            self.0.lock().unwrap().values().sum()
        }
    }

    /// Describes each part as text and counts how often it is asked to
    struct CountingKernel {
        calls: Calls,
        delay: Duration,
        /// Neck builds fail when scale_length exceeds this
        neck_limit: f64,
    }

    impl GeometryKernel for CountingKernel {
        type Shape = String;

        fn build(&self, kind: &NodeKind, inputs: &ResolvedInputs<String>) -> Result<String, KernelError> {
            *self
                .calls
                .0
                .lock()
                .unwrap()
                .entry(inputs.node().to_string())
                .or_default() += 1;
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }

            if *kind == NodeKind::Neck && inputs.float("scale_length")? > self.neck_limit {
                return Err(KernelError::new("neck blank too short"));
            }

            let params: Vec<String> = inputs
                .params()
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect();
            let deps: Vec<&str> = inputs.dependencies().map(|(_, part)| part.as_str()).collect();
            Ok(format!(
                "{}[{}]({})",
                inputs.node(),
                params.join(";"),
                deps.join(",")
            ))
        }
    }

    fn guitar_graph() -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        graph
            .register(BuildNode::new("body", NodeKind::Body).params(["scale_length", "body_width"]))
            .unwrap();
        graph
            .register(
                BuildNode::new("neck", NodeKind::Neck)
                    .params(["scale_length"])
                    .after(["body"]),
            )
            .unwrap();
        graph
            .register(
                BuildNode::new("headstock", NodeKind::Headstock)
                    .params(["headstock_angle"])
                    .after(["neck"]),
            )
            .unwrap();
        graph
    }

    fn guitar_params() -> ParameterStore {
        let mut store = ParameterStore::new();
        store
            .apply(vec![
                ("scale_length".to_string(), ParamValue::Float(648.0)),
                ("body_width".to_string(), ParamValue::Float(330.0)),
                ("headstock_angle".to_string(), ParamValue::Float(9.0)),
            ])
            .unwrap();
        store
    }

    fn guitar(delay: Duration, options: PipelineOptions) -> (Pipeline<CountingKernel>, Calls) {
        let calls = Calls::default();
        let kernel = CountingKernel {
            calls: calls.clone(),
            delay,
            neck_limit: 700.0,
        };
        let pipeline = Pipeline::new(kernel, guitar_graph(), guitar_params(), options).unwrap();
        (pipeline, calls)
    }

    #[tokio::test]
    async fn headstock_angle_edit_rebuilds_only_headstock() {
        let (pipeline, calls) = guitar(Duration::ZERO, PipelineOptions::default());

        let first = pipeline.request_artifact("headstock").await.unwrap();
        assert_eq!(calls.total(), 3);

        pipeline.set_parameter("headstock_angle", 12.0).unwrap();
        assert_eq!(
            pipeline.node_state("headstock").unwrap(),
            Some(NodeState::NeedsFingerprint)
        );
        assert_eq!(pipeline.node_state("neck").unwrap(), Some(NodeState::Clean));

        let second = pipeline.request_artifact("headstock").await.unwrap();
        assert_eq!(calls.of("body"), 1);
        assert_eq!(calls.of("neck"), 1);
        assert_eq!(calls.of("headstock"), 2);
        assert!(second.contains("headstock_angle=12"));
        assert_ne!(first.fingerprint(), second.fingerprint());
    }

    #[tokio::test]
    async fn scale_length_edit_rebuilds_the_chain() {
        let (pipeline, calls) = guitar(Duration::ZERO, PipelineOptions::default());
        pipeline.request_artifact("headstock").await.unwrap();

        let change = pipeline.set_parameter("scale_length", 628.0).unwrap();
        assert_eq!(change.dirtied.len(), 3);

        let report = pipeline.request_report("headstock").await.unwrap();
        assert_eq!(
            report.nodes_from(ArtifactSource::Built),
            vec!["body", "neck", "headstock"]
        );
        assert_eq!(calls.total(), 6);
    }

    #[tokio::test]
    async fn repeated_request_returns_same_handle() {
        let (pipeline, calls) = guitar(Duration::ZERO, PipelineOptions::default());

        let a = pipeline.request_artifact("headstock").await.unwrap();
        let b = pipeline.request_artifact("headstock").await.unwrap();

        assert!(a.same_artifact(&b));
        assert_eq!(calls.total(), 3);
        assert_eq!(pipeline.cache_stats().hits, 3);
    }

    #[tokio::test]
    async fn restoring_a_value_hits_the_cache() {
        let (pipeline, calls) = guitar(Duration::ZERO, PipelineOptions::default());
        let original = pipeline.request_artifact("headstock").await.unwrap();

        pipeline.set_parameter("headstock_angle", 14.0).unwrap();
        pipeline.request_artifact("headstock").await.unwrap();
        pipeline.set_parameter("headstock_angle", 9.0).unwrap();
        let restored = pipeline.request_artifact("headstock").await.unwrap();

        assert!(original.same_artifact(&restored));
        assert_eq!(calls.of("headstock"), 2);
    }

    #[tokio::test]
    async fn fingerprints_ignore_edit_order() {
        let (a, _) = guitar(Duration::ZERO, PipelineOptions::default());
        let (b, _) = guitar(Duration::ZERO, PipelineOptions::default());

        a.set_parameter("body_width", 320.0).unwrap();
        a.set_parameter("scale_length", 635.0).unwrap();
        b.set_parameters(vec![
            ("scale_length".to_string(), ParamValue::Float(635.0)),
            ("body_width".to_string(), ParamValue::Float(320.0)),
        ])
        .unwrap();

        let from_a = a.request_artifact("headstock").await.unwrap();
        let from_b = b.request_artifact("headstock").await.unwrap();
        assert_eq!(from_a.fingerprint(), from_b.fingerprint());
        assert_eq!(*from_a, *from_b);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_share_one_build() {
        let (pipeline, calls) = guitar(Duration::from_millis(40), PipelineOptions::default());

        let leases = join_all((0..8).map(|_| pipeline.request_artifact("headstock"))).await;
        let leases: Vec<_> = leases.into_iter().map(Result::unwrap).collect();

        assert_eq!(calls.of("body"), 1);
        assert_eq!(calls.of("neck"), 1);
        assert_eq!(calls.of("headstock"), 1);
        assert!(leases.iter().all(|lease| lease.same_artifact(&leases[0])));
    }

    #[tokio::test]
    async fn failed_dependency_skips_dependents() {
        let (pipeline, calls) = guitar(Duration::ZERO, PipelineOptions::default());
        pipeline.set_parameter("scale_length", 760.0).unwrap();

        let report = pipeline.request_report("headstock").await.unwrap();
        assert_eq!(report.failed(), vec!["neck", "headstock"]);
        assert_eq!(calls.of("headstock"), 0);
        let err = report.into_result().unwrap_err();
        assert!(matches!(
            err,
            ForgeError::DependencyFailed { ref dependency, .. } if dependency == "neck"
        ));

        // Unchanged inputs: the failure is returned without a kernel call
        assert!(pipeline.request_artifact("headstock").await.is_err());
        assert_eq!(calls.of("neck"), 1);
        assert_eq!(pipeline.node_state("neck").unwrap(), Some(NodeState::Failed));

        pipeline.set_parameter("scale_length", 648.0).unwrap();
        pipeline.request_artifact("headstock").await.unwrap();
        assert_eq!(calls.of("neck"), 2);
        assert_eq!(calls.of("headstock"), 1);
    }

    #[tokio::test]
    async fn batch_edit_is_one_version() {
        let (pipeline, calls) = guitar(Duration::ZERO, PipelineOptions::default());
        pipeline.request_artifact("headstock").await.unwrap();
        let before = pipeline.params_version().unwrap();

        let change = pipeline
            .set_parameters(vec![
                ("scale_length".to_string(), ParamValue::Float(640.0)),
                ("headstock_angle".to_string(), ParamValue::Float(11.0)),
            ])
            .unwrap();
        assert_eq!(change.version, before + 1);

        pipeline.request_artifact("headstock").await.unwrap();
        assert_eq!(calls.of("neck"), 2);
        assert_eq!(calls.of("headstock"), 2);
    }

    #[tokio::test]
    async fn eviction_never_frees_a_held_artifact() {
        let options = PipelineOptions {
            workers: 2,
            cache: CachePolicy {
                budget: Some(1),
                max_idle: None,
            },
            ..Default::default()
        };
        let (pipeline, calls) = guitar(Duration::ZERO, options);

        let headstock = pipeline.request_artifact("headstock").await.unwrap();
        pipeline.request_artifact("body").await.unwrap();

        assert_eq!(calls.of("body"), 2);
        assert!(pipeline.cache_stats().evictions >= 2);
        assert!(headstock.starts_with("headstock["));

        // The held artifact is still served without a rebuild
        let again = pipeline.request_artifact("headstock").await;
        assert!(again.is_ok());
        assert_eq!(calls.of("headstock"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn edit_during_build_returns_latest_version() {
        let graph = guitar_graph();
        let pipeline = Arc::new(
            Pipeline::new(
                ManifestKernel::new().with_build_delay(Duration::from_millis(60)),
                graph,
                guitar_params(),
                PipelineOptions::default(),
            )
            .unwrap(),
        );

        let request = tokio::spawn({
            let pipeline = Arc::clone(&pipeline);
            async move { pipeline.request_report("headstock").await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let change = pipeline.set_parameter("headstock_angle", 15.0).unwrap();

        let report = request.await.unwrap().unwrap();
        assert!(report.passes >= 2);
        assert_eq!(report.params_version, change.version);
        let headstock = report.into_result().unwrap();
        assert_eq!(
            headstock.params.get("headstock_angle"),
            Some(&ParamValue::Float(15.0))
        );
    }

    #[tokio::test]
    async fn edit_during_build_without_reissues_returns_planned_version() {
        let pipeline = Arc::new(
            Pipeline::new(
                ManifestKernel::new().with_build_delay(Duration::from_millis(60)),
                guitar_graph(),
                guitar_params(),
                PipelineOptions {
                    max_reissues: 0,
                    ..Default::default()
                },
            )
            .unwrap(),
        );
        let planned = pipeline.params_version().unwrap();

        let request = tokio::spawn({
            let pipeline = Arc::clone(&pipeline);
            async move { pipeline.request_report("headstock").await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        pipeline.set_parameter("headstock_angle", 15.0).unwrap();

        let report = request.await.unwrap().unwrap();
        assert_eq!(report.passes, 1);
        assert_eq!(report.params_version, planned);
        assert!(report.into_result().is_ok());
        assert!(pipeline
            .dirty_nodes()
            .unwrap()
            .contains(&"headstock".to_string()));
    }

    #[tokio::test]
    async fn disposed_artifact_is_rebuilt_on_next_request() {
        let builds = Arc::new(AtomicUsize::new(0));
        let disposed: Arc<Mutex<HashSet<String>>> = Arc::default();
        let kernel = BuilderTable::new()
            .with(NodeKind::Body, {
                let builds = Arc::clone(&builds);
                move |_: &ResolvedInputs<String>| {
                    let n = builds.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok(format!("body#{}", n))
                }
            })
            .check_alive_with({
                let disposed = Arc::clone(&disposed);
                move |shape: &String| !disposed.lock().unwrap().contains(shape)
            });
        let mut graph = DependencyGraph::new();
        graph
            .register(BuildNode::new("body", NodeKind::Body).params(["body_width"]))
            .unwrap();
        let pipeline =
            Pipeline::new(kernel, graph, guitar_params(), PipelineOptions::default()).unwrap();

        let first = pipeline.request_artifact("body").await.unwrap();
        disposed.lock().unwrap().insert(first.to_string());

        let second = pipeline.request_artifact("body").await.unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert_eq!(second.as_str(), "body#2");
        assert!(!first.same_artifact(&second));
        assert_eq!(second.fingerprint(), first.fingerprint());
        assert_eq!(pipeline.cache_stats().discarded, 1);

        let third = pipeline.request_artifact("body").await.unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert!(second.same_artifact(&third));
    }

    #[tokio::test]
    async fn progress_reports_each_build() {
        let (pipeline, _) = guitar(Duration::ZERO, PipelineOptions::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = pipeline.subscribe_progress(Some("neck"), move |event| {
            sink.lock().unwrap().push(event.state)
        });

        pipeline.request_artifact("headstock").await.unwrap();
        assert!(pipeline.unsubscribe_progress(id));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![ProgressState::Building, ProgressState::Built]
        );
    }

    #[tokio::test]
    async fn missing_parameter_is_a_request_error() {
        let pipeline = Pipeline::new(
            ManifestKernel::new(),
            guitar_graph(),
            ParameterStore::new(),
            PipelineOptions::default(),
        )
        .unwrap();

        let err = pipeline.request_artifact("body").await.unwrap_err();
        assert!(matches!(err, ForgeError::MissingParameter { .. }));
    }
}
