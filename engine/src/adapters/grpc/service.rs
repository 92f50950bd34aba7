//! NodeAgent gRPC service
//! Thin adapter: decode the request, call the supervisor, encode the
//! result. No supervision logic lives here.

use super::mappers::{health_to_proto, log_line_to_proto, state_to_proto, status_from};
use crate::proto::node_agent as pb;
use crate::proto::node_agent::node_agent_server::NodeAgent;
use crate::runner::StopOutcome;
use crate::supervisor::Supervisor;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tonic::{Request, Response, Status};
use tracing::debug;

/// Buffered lines per log stream before backpressure on the pump task
const LOG_STREAM_BUFFER: usize = 64;

pub struct NodeAgentService {
    supervisor: Arc<Supervisor>,
}

impl NodeAgentService {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }
}

#[tonic::async_trait]
impl NodeAgent for NodeAgentService {
    async fn configure(
        &self,
        request: Request<pb::ConfigureRequest>,
    ) -> Result<Response<pb::ConfigureResponse>, Status> {
        let req = request.into_inner();
        let (revision, state) = self
            .supervisor
            .configure(&req.backend_id, &req.schema_version, &req.blob)
            .await
            .map_err(status_from)?;
        Ok(Response::new(pb::ConfigureResponse {
            revision,
            state: state_to_proto(state) as i32,
        }))
    }

    async fn start(
        &self,
        request: Request<pb::StartRequest>,
    ) -> Result<Response<pb::StartResponse>, Status> {
        let req = request.into_inner();
        let health = self
            .supervisor
            .start(&req.backend_id)
            .await
            .map_err(status_from)?;
        Ok(Response::new(pb::StartResponse {
            state: state_to_proto(health.state) as i32,
            pid: health.pid.unwrap_or(0),
        }))
    }

    async fn stop(
        &self,
        request: Request<pb::StopRequest>,
    ) -> Result<Response<pb::StopResponse>, Status> {
        let req = request.into_inner();
        let outcome = self
            .supervisor
            .stop(&req.backend_id)
            .await
            .map_err(status_from)?;
        let health = self
            .supervisor
            .status_of(&req.backend_id)
            .await
            .map_err(status_from)?;
        Ok(Response::new(pb::StopResponse {
            state: state_to_proto(health.state) as i32,
            forced: outcome == StopOutcome::Forced,
        }))
    }

    async fn restart(
        &self,
        request: Request<pb::RestartRequest>,
    ) -> Result<Response<pb::RestartResponse>, Status> {
        let req = request.into_inner();
        let health = self
            .supervisor
            .restart(&req.backend_id)
            .await
            .map_err(status_from)?;
        Ok(Response::new(pb::RestartResponse {
            state: state_to_proto(health.state) as i32,
            pid: health.pid.unwrap_or(0),
        }))
    }

    async fn rollback(
        &self,
        request: Request<pb::RollbackRequest>,
    ) -> Result<Response<pb::RollbackResponse>, Status> {
        let req = request.into_inner();
        let (revision, _) = self
            .supervisor
            .rollback(&req.backend_id)
            .await
            .map_err(status_from)?;
        Ok(Response::new(pb::RollbackResponse { revision }))
    }

    async fn status(
        &self,
        request: Request<pb::StatusRequest>,
    ) -> Result<Response<pb::StatusResponse>, Status> {
        let req = request.into_inner();
        let status = self.supervisor.status().await;

        let backends = match req.backend_id.filter(|id| !id.is_empty()) {
            Some(id) => {
                let health = self
                    .supervisor
                    .status_of(&id)
                    .await
                    .map_err(status_from)?;
                vec![health_to_proto(&health)]
            }
            None => status.backends.iter().map(health_to_proto).collect(),
        };

        Ok(Response::new(pb::StatusResponse {
            agent_version: status.agent_version,
            agent_uptime_sec: status.uptime.as_secs(),
            backends,
        }))
    }

    type StreamLogsStream = Pin<Box<dyn Stream<Item = Result<pb::LogLine, Status>> + Send>>;

    async fn stream_logs(
        &self,
        request: Request<pb::StreamLogsRequest>,
    ) -> Result<Response<Self::StreamLogsStream>, Status> {
        let req = request.into_inner();
        let mut subscription = self
            .supervisor
            .subscribe_logs(&req.backend_id)
            .map_err(status_from)?;

        // The pump ends the moment the client disconnects, even while
        // the backend is silent, so the subscription never outlives
        // the session
        let (tx, rx) = mpsc::channel(LOG_STREAM_BUFFER);
        let backend_id = req.backend_id;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    line = subscription.next() => match line {
                        Some(line) => {
                            if tx.send(Ok(log_line_to_proto(line))).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            debug!(backend = %backend_id, "log stream closed");
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}
