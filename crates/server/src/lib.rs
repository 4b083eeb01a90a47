//! Agent-facing callback server.
//!
//! Every request walks the same states: decode, resolve the agent's identity,
//! do the endpoint's work, then pick a reply. A failure in any state ends the
//! request with an empty 400, logged with the state it happened in.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use callback_backends::{BlobStore, JobQueue};
use callback_proto::{
    decode, validate_version, AgentIdentity, CatalogFileEventReport, ContentKind, EventReport,
    HeartbeatReport, ProcessEventReport, Registration, ResponseToAgent, UpdateRequest,
};
use callback_store::{NewContent, NewProcessEvent, Store, SystemId};
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use uuid::Uuid;

pub mod config;
pub mod dispatch;
pub mod error;
pub mod http_server;
pub mod intake;
pub mod respond;

use crate::dispatch::AnalysisDispatcher;
use crate::error::{CallbackError, CallbackResult, InPhase, Rejection, RequestPhase};
use crate::intake::{FileIntake, IntakeSettings};
use crate::respond::ResponseOrchestrator;

pub use crate::http_server::{router, run_http};

/// Server time in unix seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

pub struct CallbackServer {
    store: Store,
    intake: FileIntake,
    responder: ResponseOrchestrator,
    updates_dir: PathBuf,
}

impl CallbackServer {
    pub fn new(
        store: Store,
        blobs: Arc<dyn BlobStore>,
        queue: Arc<dyn JobQueue>,
        intake: IntakeSettings,
        updates_dir: PathBuf,
    ) -> Self {
        let dispatcher = AnalysisDispatcher::new(store.clone(), queue);
        Self {
            intake: FileIntake::new(store.clone(), blobs, dispatcher, intake),
            responder: ResponseOrchestrator::new(store.clone()),
            store,
            updates_dir,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn intake(&self) -> &FileIntake {
        &self.intake
    }

    /// Maps a claimed (system, tenant) pair to the registered system. Any
    /// mismatch, including a malformed UUID, is reported as not found.
    pub async fn resolve(&self, identity: &AgentIdentity) -> CallbackResult<SystemId> {
        self.store
            .resolve_system(&identity.system_uuid, &identity.tenant_uuid)
            .await?
            .ok_or(CallbackError::NotFound)
    }

    pub async fn respond(
        &self,
        system: SystemId,
        natural: ResponseToAgent,
        now: i64,
    ) -> Result<String, Rejection> {
        self.responder
            .respond(system, natural, now)
            .await
            .during(RequestPhase::SelectingResponse)
    }

    pub async fn register(&self, body: &[u8]) -> Result<String, Rejection> {
        let registration: Registration = decode(body).during(RequestPhase::Decoding)?;
        let tenant = Uuid::parse_str(&registration.tenant_uuid)
            .map_err(|_| CallbackError::NotFound)
            .during(RequestPhase::ResolvingIdentity)?;

        let now = unix_now();
        let system = self
            .store
            .register_system(tenant, &registration, now)
            .await
            .during(RequestPhase::ProcessingEvent)?
            .ok_or(CallbackError::NotFound)
            .during(RequestPhase::ResolvingIdentity)?;

        info!(
            system = %system.id,
            system_uuid = %system.uuid,
            machine = %registration.machine_name,
            agent_version = %registration.agent_version,
            "system registered"
        );
        self.respond(
            system.id,
            ResponseToAgent::SetSystemUuid {
                system_uuid: system.uuid,
            },
            now,
        )
        .await
    }

    /// Decodes a timestamped agent report and resolves who sent it.
    async fn accept<R>(&self, body: &[u8]) -> Result<(R, SystemId), Rejection>
    where
        R: DeserializeOwned + EventReport,
    {
        let report: R = decode(body).during(RequestPhase::Decoding)?;
        let system = self
            .resolve(report.identity())
            .await
            .during(RequestPhase::ResolvingIdentity)?;
        Ok((report, system))
    }

    pub async fn process_event(&self, body: &[u8]) -> Result<String, Rejection> {
        let (report, system) = self.accept::<ProcessEventReport>(body).await?;

        let now = unix_now();
        self.record_process_event(system, &report, now)
            .await
            .during(RequestPhase::ProcessingEvent)?;
        self.respond(system, ResponseToAgent::Success, now).await
    }

    async fn record_process_event(
        &self,
        system: SystemId,
        report: &ProcessEventReport,
        now: i64,
    ) -> CallbackResult<()> {
        let event_time = report.corrected_time(now)?;
        let content = NewContent {
            kind: ContentKind::Executable,
            sha256: report.sha256,
            size: report.size,
            first_seen: event_time,
            path: &report.path,
            md5: report.md5,
            sha1: report.sha1,
            is_signed: report.is_signed,
        };
        let executable = self.intake.register_sighting(system, &content, now).await?;

        self.store
            .record_process_event(&NewProcessEvent {
                system,
                executable_id: executable.id,
                pid: report.pid,
                ppid: report.ppid,
                path: &report.path,
                command_line: &report.command_line,
                event_time,
            })
            .await?;
        self.store
            .record_sighting(
                ContentKind::Executable,
                executable.id,
                system,
                event_time,
                &report.path,
            )
            .await?;
        Ok(())
    }

    pub async fn catalog_file_event(&self, body: &[u8]) -> Result<String, Rejection> {
        let (report, system) = self.accept::<CatalogFileEventReport>(body).await?;

        let now = unix_now();
        self.record_catalog_event(system, &report, now)
            .await
            .during(RequestPhase::ProcessingEvent)?;
        self.respond(system, ResponseToAgent::Success, now).await
    }

    async fn record_catalog_event(
        &self,
        system: SystemId,
        report: &CatalogFileEventReport,
        now: i64,
    ) -> CallbackResult<()> {
        let event_time = report.corrected_time(now)?;
        let content = NewContent {
            kind: ContentKind::Catalog,
            sha256: report.sha256,
            size: report.size,
            first_seen: event_time,
            path: &report.path,
            md5: None,
            sha1: None,
            is_signed: false,
        };
        let catalog = self.intake.register_sighting(system, &content, now).await?;

        self.store
            .record_catalog_event(system, catalog.id, &report.path, event_time)
            .await?;
        self.store
            .record_sighting(
                ContentKind::Catalog,
                catalog.id,
                system,
                event_time,
                &report.path,
            )
            .await?;
        Ok(())
    }

    pub async fn heartbeat(&self, body: &[u8]) -> Result<String, Rejection> {
        let (_, system) = self.accept::<HeartbeatReport>(body).await?;

        let now = unix_now();
        self.store
            .touch_system(system, now)
            .await
            .during(RequestPhase::ProcessingEvent)?;
        self.respond(system, ResponseToAgent::Nop, now).await
    }

    /// Returns the raw update payload for the agent's current version.
    pub async fn get_update(&self, body: &[u8]) -> Result<Vec<u8>, Rejection> {
        let request: UpdateRequest = decode(body).during(RequestPhase::Decoding)?;
        let version_from = request.version().during(RequestPhase::Decoding)?;
        let system = self
            .resolve(&request.identity)
            .await
            .during(RequestPhase::ResolvingIdentity)?;

        let payload = self
            .load_update(version_from)
            .await
            .during(RequestPhase::ProcessingEvent)?;
        info!(%system, from = version_from, bytes = payload.len(), "serving agent update");
        Ok(payload)
    }

    async fn load_update(&self, version_from: &str) -> CallbackResult<Vec<u8>> {
        let version_to = self
            .store
            .next_update(version_from)
            .await?
            .ok_or(CallbackError::NotFound)?;
        // Catalogue rows are written by operators; never trust them as paths.
        validate_version(&version_to)?;

        let path = self
            .updates_dir
            .join(format!("update-{version_from}-{version_to}.exe"));
        match tokio::fs::read(&path).await {
            Ok(payload) => Ok(payload),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "update listed but file missing");
                Err(CallbackError::NotFound)
            }
            Err(err) => Err(err.into()),
        }
    }
}
