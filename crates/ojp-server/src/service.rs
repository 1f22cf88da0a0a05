//! gRPC service implementations
//!
//! Thin tonic adapters over the [`Dispatcher`]: extract the peer address,
//! hand the request to the pipeline, map [`crate::error::ServerError`] onto
//! `tonic::Status`. Result streaming re-enters the dispatcher per batch so
//! the per-session queue is honored and cancellation is observable between
//! batches.

use crate::dispatcher::Dispatcher;
use ojp_proto::statement_service_server::StatementService;
use ojp_proto::{
    AckResponse, ExecuteRequest, ExecuteResponse, FetchRequest, FetchResponse, LobReadRequest,
    LobReadResponse, LobWriteRequest, LobWriteResponse, OpenSessionRequest, SessionRequest,
    SessionResponse, XaRequest, XaResponse,
};
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tonic::{Request, Response, Status};

pub struct OjpStatementService {
    dispatcher: Arc<Dispatcher>,
}

impl OjpStatementService {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

fn remote_ip<T>(request: &Request<T>) -> Option<IpAddr> {
    request.remote_addr().map(|addr| addr.ip())
}

#[tonic::async_trait]
impl StatementService for OjpStatementService {
    async fn open_session(
        &self,
        request: Request<OpenSessionRequest>,
    ) -> Result<Response<SessionResponse>, Status> {
        let remote = remote_ip(&request);
        let descriptor = self
            .dispatcher
            .open_session(remote, request.into_inner())
            .await?;
        Ok(Response::new(SessionResponse {
            session: Some(descriptor),
        }))
    }

    async fn close_session(
        &self,
        request: Request<SessionRequest>,
    ) -> Result<Response<AckResponse>, Status> {
        let remote = remote_ip(&request);
        let req = request.into_inner();
        self.dispatcher
            .close_session(remote, req.session.as_ref(), &req.cluster_health)
            .await?;
        Ok(Response::new(AckResponse { ok: true }))
    }

    async fn execute(
        &self,
        request: Request<ExecuteRequest>,
    ) -> Result<Response<ExecuteResponse>, Status> {
        let remote = remote_ip(&request);
        let response = self.dispatcher.execute(remote, request.into_inner()).await?;
        Ok(Response::new(response))
    }

    async fn fetch(
        &self,
        request: Request<FetchRequest>,
    ) -> Result<Response<FetchResponse>, Status> {
        let remote = remote_ip(&request);
        let response = self.dispatcher.fetch(remote, request.into_inner()).await?;
        Ok(Response::new(response))
    }

    type StreamResultsStream = Pin<Box<dyn Stream<Item = Result<FetchResponse, Status>> + Send>>;

    /// Streams the remaining batches of a cursor. Each batch is a fresh
    /// pass through the dispatcher, so the stream yields between batches
    /// and a dropped receiver (client cancellation) ends the task.
    async fn stream_results(
        &self,
        request: Request<FetchRequest>,
    ) -> Result<Response<Self::StreamResultsStream>, Status> {
        let remote = remote_ip(&request);
        let req = request.into_inner();
        let dispatcher = self.dispatcher.clone();

        let (tx, rx) = tokio::sync::mpsc::channel(4);
        tokio::spawn(async move {
            loop {
                match dispatcher.fetch(remote, req.clone()).await {
                    Ok(batch) => {
                        let has_more = batch.has_more;
                        let done = batch.rows.is_empty();
                        if tx.send(Ok(batch)).await.is_err() {
                            break;
                        }
                        if !has_more || done {
                            break;
                        }
                    }
                    Err(err) => {
                        let _ = tx.send(Err(err.to_status())).await;
                        break;
                    }
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn commit(
        &self,
        request: Request<SessionRequest>,
    ) -> Result<Response<AckResponse>, Status> {
        let remote = remote_ip(&request);
        let req = request.into_inner();
        self.dispatcher
            .commit(remote, req.session.as_ref(), &req.cluster_health)
            .await?;
        Ok(Response::new(AckResponse { ok: true }))
    }

    async fn rollback(
        &self,
        request: Request<SessionRequest>,
    ) -> Result<Response<AckResponse>, Status> {
        let remote = remote_ip(&request);
        let req = request.into_inner();
        self.dispatcher
            .rollback(remote, req.session.as_ref(), &req.cluster_health)
            .await?;
        Ok(Response::new(AckResponse { ok: true }))
    }

    async fn xa_operation(
        &self,
        request: Request<XaRequest>,
    ) -> Result<Response<XaResponse>, Status> {
        let remote = remote_ip(&request);
        let response = self
            .dispatcher
            .xa_operation(remote, request.into_inner())
            .await?;
        Ok(Response::new(response))
    }

    async fn lob_write(
        &self,
        request: Request<LobWriteRequest>,
    ) -> Result<Response<LobWriteResponse>, Status> {
        let remote = remote_ip(&request);
        let response = self
            .dispatcher
            .lob_write(remote, request.into_inner())
            .await?;
        Ok(Response::new(response))
    }

    async fn lob_read(
        &self,
        request: Request<LobReadRequest>,
    ) -> Result<Response<LobReadResponse>, Status> {
        let remote = remote_ip(&request);
        let response = self
            .dispatcher
            .lob_read(remote, request.into_inner())
            .await?;
        Ok(Response::new(response))
    }
}
