use anyhow::{Context, Result};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use tracing::debug;

use super::{ExecOptions, ExecutionBackend, choose_target};
use crate::utils::command::{CommandRunner, argv, non_empty_lines};

const KUBECTL: &str = "kubectl";
const INFRAHUB_SELECTOR: &str = "app.kubernetes.io/name=infrahub";
const POD_NAMES: &str = "jsonpath={range .items[*]}{.metadata.name}{\"\\n\"}{end}";
const POD_PHASES: &str = "jsonpath={range .items[*]}{.status.phase}{\"\\n\"}{end}";
const POD_NAMES_AND_PHASES: &str =
    "jsonpath={range .items[*]}{.metadata.name}{\";\"}{.status.phase}{\"\\n\"}{end}";

/// Kubernetes deployment; runtime units are pods, lifecycle is replica scaling.
pub struct KubernetesBackend {
    runner: Box<dyn CommandRunner>,
    requested_namespace: Option<String>,
    namespace: String,
    pod_cache: RefCell<HashMap<String, String>>,
}

/// Label selectors tried in order when looking up a service's pods or workloads.
pub fn pod_selectors(service: &str) -> Vec<String> {
    let chart_name = match service {
        "database" => Some("neo4j"),
        "task-manager-db" => Some("postgresql"),
        "cache" => Some("redis"),
        "message-queue" => Some("rabbitmq"),
        "task-manager" => Some("prefect-server"),
        _ => None,
    };
    let mut selectors = Vec::new();
    if let Some(name) = chart_name {
        selectors.push(format!("app.kubernetes.io/name={}", name));
    }
    selectors.push(format!("app.kubernetes.io/component={}", service));
    selectors.push(format!("app.kubernetes.io/name={}", service));
    selectors.push(format!("app={}", service));
    selectors
}

/// Namespaces running Infrahub pods, sorted and deduplicated.
pub fn list_kubernetes_namespaces(runner: &dyn CommandRunner) -> Result<Vec<String>> {
    let output = runner.run(
        KUBECTL,
        &argv(&[
            "get",
            "pods",
            "-A",
            "-l",
            INFRAHUB_SELECTOR,
            "-o",
            "jsonpath={range .items[*]}{.metadata.namespace}{\"\\n\"}{end}",
        ]),
    )?;
    let namespaces: BTreeSet<String> = non_empty_lines(&output).into_iter().collect();
    Ok(namespaces.into_iter().collect())
}

impl KubernetesBackend {
    pub fn new(runner: Box<dyn CommandRunner>, namespace: Option<String>) -> Self {
        Self {
            runner,
            requested_namespace: namespace,
            namespace: String::new(),
            pod_cache: RefCell::new(HashMap::new()),
        }
    }

    fn kubectl(&self, rest: &[&str]) -> Result<String> {
        let mut args = argv(&["-n", &self.namespace]);
        args.extend(rest.iter().map(|s| s.to_string()));
        self.runner.run(KUBECTL, &args)
    }

    /// First selector with results wins, then a substring match over all pod names.
    fn pod_for(&self, service: &str) -> Result<String> {
        if let Some(pod) = self.pod_cache.borrow().get(service) {
            return Ok(pod.clone());
        }

        let resolved = self
            .first_selector_match(service, &["get", "pods"], POD_NAMES)
            .or_else(|| {
                let output = self.kubectl(&["get", "pods", "-o", POD_NAMES]).ok()?;
                non_empty_lines(&output)
                    .into_iter()
                    .find(|name| name.contains(service))
            });

        match resolved {
            Some(pod) => {
                self.pod_cache
                    .borrow_mut()
                    .insert(service.to_string(), pod.clone());
                Ok(pod)
            }
            None => anyhow::bail!(
                "no pods found for service {} in namespace {}",
                service,
                self.namespace
            ),
        }
    }

    fn first_selector_match(&self, service: &str, query: &[&str], output: &str) -> Option<String> {
        pod_selectors(service).iter().find_map(|selector| {
            let mut rest = query.to_vec();
            rest.extend_from_slice(&["-l", selector.as_str(), "-o", output]);
            match self.kubectl(&rest) {
                Ok(out) => non_empty_lines(&out).into_iter().next(),
                Err(err) => {
                    debug!(selector = %selector, "selector lookup failed: {err:#}");
                    None
                }
            }
        })
    }

    fn pod_phases(&self, service: &str) -> Result<Vec<String>> {
        for selector in pod_selectors(service) {
            let Ok(output) = self.kubectl(&["get", "pods", "-l", &selector, "-o", POD_PHASES]) else {
                continue;
            };
            let phases = non_empty_lines(&output);
            if !phases.is_empty() {
                return Ok(phases);
            }
        }

        let output = self.kubectl(&["get", "pods", "-o", POD_NAMES_AND_PHASES])?;
        Ok(non_empty_lines(&output)
            .into_iter()
            .filter_map(|line| {
                let (name, phase) = line.split_once(';')?;
                name.contains(service).then(|| phase.to_string())
            })
            .collect())
    }

    /// The deployment or statefulset owning a service's pods, as `kind/name`.
    fn workload_for(&self, service: &str) -> Result<String> {
        if let Some(workload) =
            self.first_selector_match(service, &["get", "deployments,statefulsets"], "name")
        {
            return Ok(workload);
        }
        let output = self.kubectl(&["get", "deployments,statefulsets", "-o", "name"])?;
        non_empty_lines(&output)
            .into_iter()
            .find(|name| {
                name.rsplit('/')
                    .next()
                    .is_some_and(|short| short.contains(service))
            })
            .with_context(|| {
                format!(
                    "no deployment or statefulset found for service {} in namespace {}",
                    service, self.namespace
                )
            })
    }

    fn scale(&self, services: &[&str], replicas: u32) -> Result<()> {
        for service in services {
            let workload = self.workload_for(service)?;
            let replicas_arg = format!("--replicas={}", replicas);
            self.kubectl(&["scale", &workload, &replicas_arg])
                .with_context(|| format!("Failed to scale {} to {} replicas", workload, replicas))?;
        }
        Ok(())
    }

    /// Pods run under their own security context, so only the environment is applied.
    fn prepare_command(command: &[String], opts: &ExecOptions) -> Vec<String> {
        if let Some(user) = &opts.user {
            debug!(user = %user, "kubernetes exec runs as the pod's configured user");
        }
        let mut prepared = Vec::new();
        if !opts.env.is_empty() {
            prepared.push("env".to_string());
            prepared.extend(opts.env.iter().map(|(k, v)| format!("{}={}", k, v)));
        }
        prepared.extend(command.iter().cloned());
        prepared
    }

    fn exec_args(&self, service: &str, command: &[String], opts: &ExecOptions) -> Result<Vec<String>> {
        let pod = self.pod_for(service)?;
        let mut args = argv(&["exec", "-n", &self.namespace, &pod, "--"]);
        args.extend(Self::prepare_command(command, opts));
        Ok(args)
    }
}

impl ExecutionBackend for KubernetesBackend {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    fn target(&self) -> String {
        self.namespace.clone()
    }

    fn detect(&mut self) -> Result<()> {
        self.runner
            .run_quiet(KUBECTL, &argv(&["version", "--client"]))
            .context("kubectl CLI not available")?;

        if let Some(namespace) = self.requested_namespace.clone() {
            self.namespace = namespace;
            let pods = self
                .kubectl(&["get", "pods", "-l", INFRAHUB_SELECTOR, "-o", "name"])
                .with_context(|| format!("Failed to verify namespace {}", self.namespace))?;
            if non_empty_lines(&pods).is_empty() {
                anyhow::bail!("namespace {} does not host an Infrahub deployment", self.namespace);
            }
            return Ok(());
        }

        let namespaces = list_kubernetes_namespaces(self.runner.as_ref())?;
        self.namespace = choose_target("kubernetes namespaces", None, namespaces)?;
        Ok(())
    }

    fn exec(&self, service: &str, command: &[String], opts: &ExecOptions) -> Result<String> {
        let args = self.exec_args(service, command, opts)?;
        self.runner.run(KUBECTL, &args)
    }

    fn exec_stream(&self, service: &str, command: &[String], opts: &ExecOptions) -> Result<String> {
        let args = self.exec_args(service, command, opts)?;
        self.runner.run_streaming(KUBECTL, &args)
    }

    fn copy_to(&self, service: &str, local: &Path, remote: &str) -> Result<()> {
        let pod = self.pod_for(service)?;
        let args = vec![
            "cp".to_string(),
            local.display().to_string(),
            format!("{}/{}:{}", self.namespace, pod, remote),
        ];
        self.runner.run_quiet(KUBECTL, &args)
    }

    fn copy_from(&self, service: &str, remote: &str, local: &Path) -> Result<()> {
        let pod = self.pod_for(service)?;
        let args = vec![
            "cp".to_string(),
            format!("{}/{}:{}", self.namespace, pod, remote),
            local.display().to_string(),
        ];
        self.runner.run_quiet(KUBECTL, &args)
    }

    fn start(&self, services: &[&str]) -> Result<()> {
        self.scale(services, 1)
    }

    fn stop(&self, services: &[&str]) -> Result<()> {
        self.scale(services, 0)
    }

    fn is_running(&self, service: &str) -> Result<bool> {
        Ok(self
            .pod_phases(service)?
            .iter()
            .any(|phase| phase.eq_ignore_ascii_case("running")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::command::testing::ScriptedRunner;

    fn backend(runner: ScriptedRunner) -> Result<KubernetesBackend> {
        let mut backend = KubernetesBackend::new(Box::new(runner), Some("infrahub".into()));
        backend.detect()?;
        Ok(backend)
    }

    #[test]
    fn second_selector_wins_when_first_is_empty() -> Result<()> {
        let runner = ScriptedRunner::new()
            .on("-l app.kubernetes.io/name=infrahub -o name", "pod/infrahub-server-0\n")
            .on("-l app.kubernetes.io/name=neo4j", "")
            .on(
                "-l app.kubernetes.io/component=database",
                "infrahub-database-0\ninfrahub-database-1\n",
            );
        let journal = runner.journal();
        let backend = backend(runner)?;

        assert_eq!(backend.pod_for("database")?, "infrahub-database-0");
        assert_eq!(backend.pod_for("database")?, "infrahub-database-0");

        let lookups = journal
            .borrow()
            .iter()
            .filter(|c| c.contains("app.kubernetes.io/component=database"))
            .count();
        assert_eq!(lookups, 1);
        Ok(())
    }

    #[test]
    fn falls_back_to_pod_name_substring() -> Result<()> {
        let runner = ScriptedRunner::new()
            .on("-l app.kubernetes.io/name=infrahub -o name", "pod/x\n")
            .on("-l ", "")
            .on("get pods -o jsonpath", "infrahub-cache-0\ninfrahub-task-worker-7f\n");
        let backend = backend(runner)?;
        assert_eq!(backend.pod_for("task-worker")?, "infrahub-task-worker-7f");
        assert!(backend.pod_for("nonexistent").is_err());
        Ok(())
    }

    #[test]
    fn exec_applies_environment_prefix() -> Result<()> {
        let runner = ScriptedRunner::new()
            .on("-l app.kubernetes.io/name=infrahub -o name", "pod/x\n")
            .on("-l app.kubernetes.io/name=postgresql", "infrahub-task-manager-db-0\n");
        let journal = runner.journal();
        let backend = backend(runner)?;

        let opts = ExecOptions::default().with_env("PGPASSWORD", "pw");
        backend.exec("task-manager-db", &argv(&["pg_dump", "-Fc"]), &opts)?;
        assert!(journal.borrow().contains(
            &"kubectl exec -n infrahub infrahub-task-manager-db-0 -- env PGPASSWORD=pw pg_dump -Fc"
                .to_string()
        ));
        Ok(())
    }

    #[test]
    fn start_and_stop_scale_the_owning_workload() -> Result<()> {
        let runner = ScriptedRunner::new()
            .on("-l app.kubernetes.io/name=infrahub -o name", "pod/x\n")
            .on(
                "get deployments,statefulsets -l app.kubernetes.io/component=infrahub-server",
                "deployment.apps/infrahub-infrahub-server\n",
            );
        let journal = runner.journal();
        let backend = backend(runner)?;

        backend.stop(&["infrahub-server"])?;
        backend.start(&["infrahub-server"])?;
        let calls = journal.borrow();
        assert!(calls.contains(
            &"kubectl -n infrahub scale deployment.apps/infrahub-infrahub-server --replicas=0".to_string()
        ));
        assert!(calls.contains(
            &"kubectl -n infrahub scale deployment.apps/infrahub-infrahub-server --replicas=1".to_string()
        ));
        Ok(())
    }

    #[test]
    fn running_state_uses_fallback_listing() -> Result<()> {
        let runner = ScriptedRunner::new()
            .on("-l app.kubernetes.io/name=infrahub -o name", "pod/x\n")
            .on("-l ", "")
            .on(
                "get pods -o jsonpath",
                "infrahub-task-worker-1;Pending\ninfrahub-task-worker-2;Running\n",
            );
        let backend = backend(runner)?;
        assert!(backend.is_running("task-worker")?);
        assert!(!backend.is_running("cache")?);
        Ok(())
    }

    #[test]
    fn explicit_namespace_without_infrahub_is_rejected() {
        let mut backend =
            KubernetesBackend::new(Box::new(ScriptedRunner::new()), Some("default".into()));
        assert!(backend.detect().is_err());
    }

    #[test]
    fn auto_discovery_reports_every_candidate() {
        let runner = ScriptedRunner::new().on("get pods -A", "prod\nstaging\n");
        let mut backend = KubernetesBackend::new(Box::new(runner), None);
        let err = backend.detect().unwrap_err();
        assert!(err.to_string().contains("prod, staging"));
    }
}
