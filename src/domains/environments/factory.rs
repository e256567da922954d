use std::sync::Arc;

use dashmap::DashMap;
use log::debug;

use super::docker::DockerEnvironment;
use super::error::EnvironmentError;
use super::host::HostEnvironment;
use super::ssh::SshEnvironment;
use super::types::{CloneLocation, EnvironmentKind, EnvironmentRecord};
use super::ExecutionEnvironment;
use crate::domains::settings::Settings;

/// Turns a project's environment reference (or its clone location policy)
/// into a usable backend.
pub trait EnvironmentFactory: Send + Sync {
    fn resolve(
        &self,
        record: Option<&EnvironmentRecord>,
        policy: CloneLocation,
    ) -> Result<Arc<dyn ExecutionEnvironment>, EnvironmentError>;
}

pub struct DefaultEnvironmentFactory {
    settings: Settings,
    host: Arc<HostEnvironment>,
    default_docker: Arc<DockerEnvironment>,
    by_record: DashMap<String, (EnvironmentRecord, Arc<dyn ExecutionEnvironment>)>,
}

impl DefaultEnvironmentFactory {
    pub fn new(settings: Settings) -> Self {
        let host = Arc::new(HostEnvironment::new(
            settings.exec_timeout(),
            settings.stop_grace_period(),
        ));
        let default_docker = Arc::new(DockerEnvironment::from_settings(
            &settings.docker,
            settings.exec_timeout(),
        ));
        Self {
            settings,
            host,
            default_docker,
            by_record: DashMap::new(),
        }
    }

    fn build(&self, record: &EnvironmentRecord) -> Result<Arc<dyn ExecutionEnvironment>, EnvironmentError> {
        let env: Arc<dyn ExecutionEnvironment> = match record.kind {
            EnvironmentKind::Host => self.host.clone(),
            EnvironmentKind::Docker => Arc::new(DockerEnvironment::from_record(
                record,
                &self.settings.docker,
                self.settings.exec_timeout(),
            )?),
            EnvironmentKind::Ssh => Arc::new(SshEnvironment::from_record(
                record,
                &self.settings.ssh,
                self.settings.exec_timeout(),
                self.settings.stop_grace_period(),
            )?),
        };
        Ok(env)
    }
}

impl EnvironmentFactory for DefaultEnvironmentFactory {
    fn resolve(
        &self,
        record: Option<&EnvironmentRecord>,
        policy: CloneLocation,
    ) -> Result<Arc<dyn ExecutionEnvironment>, EnvironmentError> {
        let Some(record) = record else {
            return Ok(match policy {
                CloneLocation::Host => self.host.clone(),
                CloneLocation::Docker => self.default_docker.clone(),
            });
        };

        if let Some(cached) = self.by_record.get(&record.id) {
            if cached.0 == *record {
                return Ok(cached.1.clone());
            }
        }

        // Config may change after creation; rebuild when the record differs.
        debug!("Building {} environment '{}'", record.kind, record.name);
        let env = self.build(record)?;
        self.by_record
            .insert(record.id.clone(), (record.clone(), env.clone()));
        Ok(env)
    }
}
