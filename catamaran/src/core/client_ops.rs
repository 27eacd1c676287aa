//! Leader intake of session traffic: Register, KeepAlive, Unregister,
//! Command and Query.
//!
//! Every accepted request becomes a log entry carrying its response channel
//! through `awaiting_committed`; once the entry commits, the state machine
//! context produces the result and answers the client directly.

use std::sync::Arc;

use crate::core::LeaderState;
use crate::core::apply::ResponderTx;
use crate::entry::EntryPayload;
use crate::entry::KeepAliveEntry;
use crate::entry::OperationEntry;
use crate::entry::RegisterEntry;
use crate::entry::UnregisterEntry;
use crate::error::ClientError;
use crate::error::ServerResult;
use crate::network::Transport;
use crate::protocol::CommandRequest;
use crate::protocol::Consistency;
use crate::protocol::KeepAliveRequest;
use crate::protocol::QueryRequest;
use crate::protocol::RegisterRequest;
use crate::protocol::UnregisterRequest;
use crate::server::CommandTx;
use crate::server::KeepAliveTx;
use crate::server::QueryTx;
use crate::server::RegisterTx;
use crate::server::UnregisterTx;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;

impl<'a, D: AppData, R: AppDataResponse, N: Transport<D>> LeaderState<'a, D, R, N> {
    #[tracing::instrument(level = "debug", skip(self, rpc, tx))]
    pub(super) fn handle_register(&mut self, rpc: RegisterRequest, tx: RegisterTx) -> ServerResult<()> {
        let payload = EntryPayload::Register(RegisterEntry {
            connection: rpc.connection,
            timeout: rpc.timeout,
        });
        self.append_client_entry(payload, tx.into())
    }

    #[tracing::instrument(level = "debug", skip(self, rpc, tx))]
    pub(super) fn handle_keep_alive(&mut self, rpc: KeepAliveRequest, tx: KeepAliveTx) -> ServerResult<()> {
        let payload = EntryPayload::KeepAlive(KeepAliveEntry {
            session: rpc.session,
            command_sequence: rpc.command_sequence,
            event_sequence: rpc.event_sequence,
        });
        self.append_client_entry(payload, tx.into())
    }

    #[tracing::instrument(level = "debug", skip(self, rpc, tx))]
    pub(super) fn handle_unregister(&mut self, rpc: UnregisterRequest, tx: UnregisterTx) -> ServerResult<()> {
        let payload = EntryPayload::Unregister(UnregisterEntry { session: rpc.session });
        self.append_client_entry(payload, tx.into())
    }

    #[tracing::instrument(level = "debug", skip(self, rpc, tx), fields(rpc=%rpc.summary()))]
    pub(super) fn handle_command(&mut self, rpc: CommandRequest<D>, tx: CommandTx<R>) -> ServerResult<()> {
        let payload = EntryPayload::Command(OperationEntry {
            session: rpc.session,
            sequence: rpc.sequence,
            operation: rpc.operation,
        });
        self.append_client_entry(payload, tx.into())
    }

    /// Queries are ordered behind the session's commands either through the
    /// log (linearizable) or directly against applied state (sequential).
    #[tracing::instrument(level = "debug", skip(self, rpc, tx), fields(rpc=%rpc.summary()))]
    pub(super) fn handle_query(&mut self, rpc: QueryRequest<D>, tx: QueryTx<R>) -> ServerResult<()> {
        match rpc.consistency {
            Consistency::Linearizable => {
                let payload = EntryPayload::Query(OperationEntry {
                    session: rpc.session,
                    sequence: rpc.sequence,
                    operation: rpc.operation,
                });
                self.append_client_entry(payload, tx.into())
            }
            Consistency::Sequential => {
                self.core.sequential_query(rpc.session, rpc.sequence, rpc.operation, tx);
                Ok(())
            }
        }
    }

    /// Append a client request to the log and begin replicating it. The
    /// response channel travels with the entry to the commit point.
    fn append_client_entry(&mut self, payload: EntryPayload<D>, tx: ResponderTx<R>) -> ServerResult<()> {
        let entry = match self.core.append_entry(payload) {
            Ok(entry) => entry,
            Err(err) => {
                tx.fail(ClientError::Shutdown);
                return Err(err);
            }
        };
        tracing::debug!(entry = %entry.summary(), "appended client entry");
        self.awaiting_committed.push(PendingRequest {
            entry: entry.clone(),
            tx,
        });
        self.replicate(entry)
    }
}

/// A client request which has been appended locally and awaits commitment.
pub(super) struct PendingRequest<D: AppData, R: AppDataResponse> {
    pub entry: Arc<crate::entry::Entry<D>>,
    pub tx: ResponderTx<R>,
}
