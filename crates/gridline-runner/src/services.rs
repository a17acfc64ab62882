//! Service provisioning: environment-discovered or Docker-started.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use gridline_core::config::ServiceDefinition;
use gridline_core::ids::JobId;
use gridline_core::job::ServiceEndpoint;
use gridline_core::ports::ServiceProvisioner;
use gridline_core::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{Duration, Instant, sleep};
use tracing::{debug, info, warn};

const STEP: &str = "provision";

/// Prefix of the discovery keys for `service`, e.g. `GRIDLINE_TEST_POSTGRES`.
pub fn env_prefix(service: &str) -> String {
    format!(
        "GRIDLINE_TEST_{}",
        service.to_ascii_uppercase().replace('-', "_")
    )
}

/// Discovery key/value pairs for a service reachable at `host:port`.
pub fn discovery_env(
    service: &str,
    definition: &ServiceDefinition,
    host: &str,
    port: u16,
) -> BTreeMap<String, String> {
    let prefix = env_prefix(service);
    let mut env = BTreeMap::new();
    env.insert(format!("{}_HOST", prefix), host.to_string());
    env.insert(format!("{}_PORT", prefix), port.to_string());
    if let Some(user) = &definition.user {
        env.insert(format!("{}_USER", prefix), user.clone());
    }
    if let Some(password) = &definition.password {
        env.insert(format!("{}_PASSWORD", prefix), password.clone());
    }
    if let Some(database) = &definition.database {
        env.insert(format!("{}_DATABASE", prefix), database.clone());
    }
    env
}

/// Poll `host:port` until it accepts a TCP connection or `limit` elapses.
pub async fn wait_for_tcp(service: &str, host: &str, port: u16, limit: Duration) -> Result<()> {
    let deadline = Instant::now() + limit;
    loop {
        match TcpStream::connect((host, port)).await {
            Ok(_) => {
                debug!(service, host, port, "Service accepting connections");
                return Ok(());
            }
            Err(e) if Instant::now() >= deadline => {
                return Err(Error::infrastructure(
                    STEP,
                    format!(
                        "service '{}' at {}:{} not ready after {}s: {}",
                        service,
                        host,
                        port,
                        limit.as_secs(),
                        e
                    ),
                ));
            }
            Err(_) => sleep(Duration::from_millis(250)).await,
        }
    }
}

fn definition<'a>(
    services: &'a BTreeMap<String, ServiceDefinition>,
    service: &str,
) -> Result<&'a ServiceDefinition> {
    services
        .get(service)
        .ok_or_else(|| Error::infrastructure(STEP, format!("no definition for service '{}'", service)))
}

/// Uses services started outside Gridline, located through
/// `GRIDLINE_TEST_<SERVICE>_*` variables.
///
/// An external instance is shared by every job that needs it, so at most one
/// job holds a given service at a time; others wait in `provision` until the
/// holder's lease is released.
pub struct EnvProvisioner {
    services: BTreeMap<String, ServiceDefinition>,
    env: BTreeMap<String, String>,
    check_ready: bool,
    locks: BTreeMap<String, Arc<Semaphore>>,
    held: Mutex<HashMap<String, OwnedSemaphorePermit>>,
}

impl EnvProvisioner {
    /// Snapshot the process environment.
    pub fn from_env(services: BTreeMap<String, ServiceDefinition>) -> Self {
        Self::with_env(services, std::env::vars().collect())
    }

    pub fn with_env(
        services: BTreeMap<String, ServiceDefinition>,
        env: BTreeMap<String, String>,
    ) -> Self {
        let locks = services
            .keys()
            .map(|name| (name.clone(), Arc::new(Semaphore::new(1))))
            .collect();
        Self {
            services,
            env,
            check_ready: true,
            locks,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Skip the TCP readiness probe.
    pub fn without_readiness_check(mut self) -> Self {
        self.check_ready = false;
        self
    }
}

#[async_trait]
impl ServiceProvisioner for EnvProvisioner {
    async fn provision(&self, job: JobId, service: &str) -> Result<ServiceEndpoint> {
        let definition = definition(&self.services, service)?;
        let prefix = env_prefix(service);

        let host = self.env.get(&format!("{}_HOST", prefix)).cloned().ok_or_else(|| {
            Error::infrastructure(
                STEP,
                format!("service '{}' not available: {}_HOST is not set", service, prefix),
            )
        })?;
        let port = match self.env.get(&format!("{}_PORT", prefix)) {
            Some(raw) => raw.parse::<u16>().map_err(|_| {
                Error::infrastructure(STEP, format!("{}_PORT is not a port: '{}'", prefix, raw))
            })?,
            None => definition.port,
        };

        let lock = self.locks.get(service).cloned().ok_or_else(|| {
            Error::infrastructure(STEP, format!("no definition for service '{}'", service))
        })?;
        debug!(job = %job, service, "Waiting for exclusive use of external service");
        let permit = lock
            .acquire_owned()
            .await
            .map_err(|_| Error::infrastructure(STEP, format!("service '{}' lock closed", service)))?;

        if self.check_ready {
            wait_for_tcp(
                service,
                &host,
                port,
                Duration::from_secs(definition.readiness_timeout_secs),
            )
            .await?;
        }

        let mut env = discovery_env(service, definition, &host, port);
        for (key, value) in &self.env {
            if key.starts_with(&prefix) {
                env.insert(key.clone(), value.clone());
            }
        }

        info!(job = %job, service, host = %host, port, "Using external service");

        let handle = format!("{}-{}", service, job.as_uuid().simple());
        self.held.lock().await.insert(handle.clone(), permit);

        Ok(ServiceEndpoint {
            service: service.to_string(),
            host,
            port,
            env,
            handle: Some(handle),
        })
    }

    async fn release(&self, endpoint: &ServiceEndpoint) -> Result<()> {
        if let Some(handle) = &endpoint.handle {
            if self.held.lock().await.remove(handle).is_some() {
                debug!(service = %endpoint.service, "External service released");
            }
        }
        Ok(())
    }
}

/// Starts one container per job per service.
pub struct DockerProvisioner {
    docker: Docker,
    services: BTreeMap<String, ServiceDefinition>,
    host: String,
}

impl DockerProvisioner {
    pub fn new(services: BTreeMap<String, ServiceDefinition>) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Internal(format!("Failed to connect to Docker: {}", e)))?;
        Ok(Self::with_docker(docker, services))
    }

    pub fn with_docker(docker: Docker, services: BTreeMap<String, ServiceDefinition>) -> Self {
        Self {
            docker,
            services,
            host: "127.0.0.1".to_string(),
        }
    }

    async fn published_port(&self, container: &str, port: u16) -> Result<u16> {
        let inspect = self
            .docker
            .inspect_container(container, None::<InspectContainerOptions>)
            .await
            .map_err(|e| Error::infrastructure(STEP, format!("inspect failed: {}", e)))?;

        let key = format!("{}/tcp", port);
        inspect
            .network_settings
            .and_then(|n| n.ports)
            .and_then(|ports| ports.get(&key).cloned().flatten())
            .and_then(|bindings| bindings.into_iter().find_map(|b| b.host_port))
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| {
                Error::infrastructure(STEP, format!("container {} publishes no port for {}", container, key))
            })
    }

    async fn remove(&self, container: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.docker
            .remove_container(container, Some(options))
            .await
            .map_err(|e| Error::Internal(format!("Failed to remove container: {}", e)))
    }
}

#[async_trait]
impl ServiceProvisioner for DockerProvisioner {
    async fn provision(&self, job: JobId, service: &str) -> Result<ServiceEndpoint> {
        let definition = definition(&self.services, service)?;
        let image = definition.image.clone().ok_or_else(|| {
            Error::infrastructure(STEP, format!("service '{}' has no image", service))
        })?;
        let container_name = format!("gridline-{}-{}", service, job.as_uuid().simple());
        let exposed = format!("{}/tcp", definition.port);

        info!(job = %job, service, image = %image, container = %container_name, "Starting service container");

        let env: Vec<String> = definition
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let config = Config {
            image: Some(image),
            env: Some(env),
            exposed_ports: Some(HashMap::from([(exposed.clone(), HashMap::new())])),
            host_config: Some(bollard::models::HostConfig {
                publish_all_ports: Some(true),
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        self.docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| Error::infrastructure(STEP, format!("create {} failed: {}", service, e)))?;

        let ready = async {
            self.docker
                .start_container(&container_name, None::<StartContainerOptions<String>>)
                .await
                .map_err(|e| Error::infrastructure(STEP, format!("start {} failed: {}", service, e)))?;
            let port = self.published_port(&container_name, definition.port).await?;
            wait_for_tcp(
                service,
                &self.host,
                port,
                Duration::from_secs(definition.readiness_timeout_secs),
            )
            .await?;
            Ok::<u16, Error>(port)
        }
        .await;

        let port = match ready {
            Ok(port) => port,
            Err(e) => {
                if let Err(cleanup) = self.remove(&container_name).await {
                    warn!(container = %container_name, error = %cleanup, "Failed to remove service container");
                }
                return Err(e);
            }
        };

        Ok(ServiceEndpoint {
            service: service.to_string(),
            host: self.host.clone(),
            port,
            env: discovery_env(service, definition, &self.host, port),
            handle: Some(container_name),
        })
    }

    async fn release(&self, endpoint: &ServiceEndpoint) -> Result<()> {
        if let Some(container) = &endpoint.handle {
            info!(service = %endpoint.service, container = %container, "Removing service container");
            self.remove(container).await?;
        }
        Ok(())
    }
}

/// Services provisioned for one job. Released explicitly on normal exit;
/// if dropped unreleased (e.g. the job was cancelled) release is spawned in
/// the background.
pub struct ServiceLease {
    provisioner: Arc<dyn ServiceProvisioner>,
    endpoints: Vec<ServiceEndpoint>,
}

impl ServiceLease {
    pub fn new(provisioner: Arc<dyn ServiceProvisioner>) -> Self {
        Self {
            provisioner,
            endpoints: Vec::new(),
        }
    }

    pub fn push(&mut self, endpoint: ServiceEndpoint) {
        self.endpoints.push(endpoint);
    }

    pub fn endpoints(&self) -> &[ServiceEndpoint] {
        &self.endpoints
    }

    /// Release every service, in reverse order. Failures are logged.
    pub async fn release(mut self) {
        let endpoints = std::mem::take(&mut self.endpoints);
        release_all(self.provisioner.as_ref(), endpoints).await;
    }
}

impl Drop for ServiceLease {
    fn drop(&mut self) {
        if self.endpoints.is_empty() {
            return;
        }
        let endpoints = std::mem::take(&mut self.endpoints);
        let provisioner = self.provisioner.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { release_all(provisioner.as_ref(), endpoints).await });
            }
            Err(_) => warn!(
                services = endpoints.len(),
                "Service lease dropped outside a runtime; services not released"
            ),
        }
    }
}

async fn release_all(provisioner: &dyn ServiceProvisioner, endpoints: Vec<ServiceEndpoint>) {
    for endpoint in endpoints.iter().rev() {
        if let Err(e) = provisioner.release(endpoint).await {
            warn!(service = %endpoint.service, error = %e, "Failed to release service");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn postgres() -> ServiceDefinition {
        ServiceDefinition {
            image: Some("postgres:13".into()),
            port: 5432,
            user: Some("postgres".into()),
            password: Some("postgres".into()),
            database: Some("ibis_testing".into()),
            env: BTreeMap::new(),
            readiness_timeout_secs: 1,
        }
    }

    fn services() -> BTreeMap<String, ServiceDefinition> {
        BTreeMap::from([("postgres".to_string(), postgres())])
    }

    #[test]
    fn test_discovery_env_keys() {
        let env = discovery_env("postgres", &postgres(), "localhost", 5432);
        assert_eq!(env["GRIDLINE_TEST_POSTGRES_HOST"], "localhost");
        assert_eq!(env["GRIDLINE_TEST_POSTGRES_PORT"], "5432");
        assert_eq!(env["GRIDLINE_TEST_POSTGRES_USER"], "postgres");
        assert_eq!(env["GRIDLINE_TEST_POSTGRES_DATABASE"], "ibis_testing");
        assert_eq!(env_prefix("click-house"), "GRIDLINE_TEST_CLICK_HOUSE");
    }

    #[tokio::test]
    async fn test_env_provisioner_uses_discovered_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let env = BTreeMap::from([
            ("GRIDLINE_TEST_POSTGRES_HOST".to_string(), "127.0.0.1".to_string()),
            ("GRIDLINE_TEST_POSTGRES_PORT".to_string(), port.to_string()),
        ]);

        let provisioner = EnvProvisioner::with_env(services(), env);
        let endpoint = provisioner.provision(JobId::new(), "postgres").await.unwrap();
        assert_eq!(endpoint.port, port);
        assert_eq!(endpoint.env["GRIDLINE_TEST_POSTGRES_PASSWORD"], "postgres");
    }

    #[tokio::test]
    async fn test_env_provisioner_serializes_jobs_per_service() {
        let env = BTreeMap::from([
            ("GRIDLINE_TEST_POSTGRES_HOST".to_string(), "db".to_string()),
            ("GRIDLINE_TEST_POSTGRES_PORT".to_string(), "5432".to_string()),
        ]);
        let provisioner = EnvProvisioner::with_env(services(), env).without_readiness_check();

        let first = provisioner.provision(JobId::new(), "postgres").await.unwrap();
        let waiting =
            tokio::time::timeout(Duration::from_millis(100), provisioner.provision(JobId::new(), "postgres"))
                .await;
        assert!(waiting.is_err(), "second job must wait while the first holds the service");

        provisioner.release(&first).await.unwrap();
        let second =
            tokio::time::timeout(Duration::from_secs(1), provisioner.provision(JobId::new(), "postgres"))
                .await
                .unwrap()
                .unwrap();
        assert_eq!(second.host, "db");
        assert_ne!(second.handle, first.handle);
    }

    #[tokio::test]
    async fn test_failed_readiness_frees_the_service() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let env = BTreeMap::from([
            ("GRIDLINE_TEST_POSTGRES_HOST".to_string(), "127.0.0.1".to_string()),
            ("GRIDLINE_TEST_POSTGRES_PORT".to_string(), port.to_string()),
        ]);
        let provisioner = EnvProvisioner::with_env(services(), env);
        assert!(provisioner.provision(JobId::new(), "postgres").await.is_err());
        assert_eq!(provisioner.locks["postgres"].available_permits(), 1);
    }

    #[tokio::test]
    async fn test_env_provisioner_missing_host_is_infrastructure_error() {
        let provisioner = EnvProvisioner::with_env(services(), BTreeMap::new());
        let err = provisioner.provision(JobId::new(), "postgres").await.unwrap_err();
        assert_eq!(err.kind(), gridline_core::ErrorKind::Infrastructure);
    }

    #[tokio::test]
    async fn test_unready_service_times_out() {
        // Bind then drop to get a port nothing listens on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let env = BTreeMap::from([
            ("GRIDLINE_TEST_POSTGRES_HOST".to_string(), "127.0.0.1".to_string()),
            ("GRIDLINE_TEST_POSTGRES_PORT".to_string(), port.to_string()),
        ]);
        let provisioner = EnvProvisioner::with_env(services(), env);
        let err = provisioner.provision(JobId::new(), "postgres").await.unwrap_err();
        assert!(err.to_string().contains("not ready"));
    }

    #[tokio::test]
    #[ignore = "requires docker"]
    async fn test_docker_provisioner_starts_and_removes_container() {
        let mut definition = postgres();
        definition.readiness_timeout_secs = 60;
        definition
            .env
            .insert("POSTGRES_PASSWORD".into(), "postgres".into());
        let provisioner =
            DockerProvisioner::new(BTreeMap::from([("postgres".to_string(), definition)])).unwrap();

        let endpoint = provisioner.provision(JobId::new(), "postgres").await.unwrap();
        assert!(endpoint.handle.is_some());
        provisioner.release(&endpoint).await.unwrap();
    }
}
