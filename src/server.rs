use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::Sink;
use pgwire::api::auth::{save_startup_parameters_to_metadata, StartupHandler};
use pgwire::api::copy::NoopCopyHandler;
use pgwire::api::portal::Portal;
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DescribePortalResponse, DescribeStatementResponse, QueryResponse, Response,
};
use pgwire::api::stmt::{NoopQueryParser, StoredStatement};
use pgwire::api::{ClientInfo, NoopErrorHandler, PgWireConnectionState, PgWireServerHandlers};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::response::{ReadyForQuery, READY_STATUS_IDLE};
use pgwire::messages::startup::{Authentication, BackendKeyData, ParameterStatus};
use pgwire::messages::{PgWireBackendMessage, PgWireFrontendMessage};
use pgwire::tokio::process_socket;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::query::{user_error, QueryHandler, QueryOutcome};

/// Session parameters reported during startup.
const STARTUP_PARAMETERS: [(&str, &str); 7] = [
    ("server_version", "17.0"),
    ("server_encoding", "UTF8"),
    ("client_encoding", "UTF8"),
    ("DateStyle", "ISO, MDY"),
    ("integer_datetimes", "on"),
    ("TimeZone", "UTC"),
    ("standard_conforming_strings", "on"),
];

/// Per-session cancellation state. A cancel request fires whatever query is
/// currently in flight; each new query gets a fresh token.
pub struct SessionCancel {
    current: Mutex<CancellationToken>,
}

impl Default for SessionCancel {
    fn default() -> Self {
        Self {
            current: Mutex::new(CancellationToken::new()),
        }
    }
}

impl SessionCancel {
    fn begin_query(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.current.lock().expect("cancel lock") = token.clone();
        token
    }

    fn cancel(&self) {
        self.current.lock().expect("cancel lock").cancel();
    }
}

/// Sessions addressable by cancel requests, keyed by (backend pid, secret).
#[derive(Default)]
pub struct CancelRegistry {
    sessions: Mutex<HashMap<(i32, i32), Arc<SessionCancel>>>,
}

impl CancelRegistry {
    fn register(&self, pid: i32, secret: i32) -> Arc<SessionCancel> {
        let cancel = Arc::new(SessionCancel::default());
        self.sessions
            .lock()
            .expect("registry lock")
            .insert((pid, secret), cancel.clone());
        cancel
    }

    fn unregister(&self, pid: i32, secret: i32) {
        self.sessions
            .lock()
            .expect("registry lock")
            .remove(&(pid, secret));
    }

    /// Unknown keys are ignored, as Postgres does.
    pub fn cancel(&self, pid: i32, secret: i32) {
        if let Some(session) = self
            .sessions
            .lock()
            .expect("registry lock")
            .get(&(pid, secret))
        {
            tracing::info!(pid, "canceling in-flight query");
            session.cancel();
        }
    }
}

/// Startup: parameter collection, cleartext or trust authentication,
/// BackendKeyData, and cancel-request dispatch.
pub struct BemiStartupHandler {
    password: Option<String>,
    registry: Arc<CancelRegistry>,
    pid: i32,
    secret: i32,
}

impl BemiStartupHandler {
    async fn finish_startup<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send,
        C::Error: Debug,
        PgWireError: From<<C as Sink<PgWireBackendMessage>>::Error>,
    {
        client
            .send(PgWireBackendMessage::Authentication(Authentication::Ok))
            .await?;
        for (name, value) in STARTUP_PARAMETERS {
            client
                .send(PgWireBackendMessage::ParameterStatus(ParameterStatus::new(
                    name.to_string(),
                    value.to_string(),
                )))
                .await?;
        }
        client
            .send(PgWireBackendMessage::BackendKeyData(BackendKeyData::new(
                self.pid,
                self.secret,
            )))
            .await?;
        client
            .send(PgWireBackendMessage::ReadyForQuery(ReadyForQuery::new(
                READY_STATUS_IDLE,
            )))
            .await?;
        client.set_state(PgWireConnectionState::ReadyForQuery);
        Ok(())
    }
}

#[async_trait]
impl StartupHandler for BemiStartupHandler {
    async fn on_startup<C>(
        &self,
        client: &mut C,
        message: PgWireFrontendMessage,
    ) -> PgWireResult<()>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send,
        C::Error: Debug,
        PgWireError: From<<C as Sink<PgWireBackendMessage>>::Error>,
    {
        match message {
            PgWireFrontendMessage::Startup(ref startup) => {
                save_startup_parameters_to_metadata(client, startup);
                if self.password.is_some() {
                    client.set_state(PgWireConnectionState::AuthenticationInProgress);
                    client
                        .send(PgWireBackendMessage::Authentication(
                            Authentication::CleartextPassword,
                        ))
                        .await?;
                } else {
                    self.finish_startup(client).await?;
                }
            }
            PgWireFrontendMessage::PasswordMessageFamily(message) => {
                let password = message.into_password()?;
                if Some(password.password()) == self.password.as_deref() {
                    self.finish_startup(client).await?;
                } else {
                    return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                        "FATAL".to_string(),
                        "28P01".to_string(),
                        "password authentication failed".to_string(),
                    ))));
                }
            }
            PgWireFrontendMessage::CancelRequest(cancel) => {
                self.registry.cancel(cancel.pid, cancel.secret_key);
            }
            _ => {}
        }
        Ok(())
    }
}

/// Simple and extended query processing for one session.
pub struct BemiQueryProcessor {
    handler: Arc<QueryHandler>,
    cancel: Arc<SessionCancel>,
    parser: Arc<NoopQueryParser>,
}

fn outcome_to_response<'a>(outcome: QueryOutcome) -> Response<'a> {
    match outcome {
        QueryOutcome::Rows { fields, rows } => Response::Query(QueryResponse::new(fields, rows)),
        QueryOutcome::Command(tag) => Response::Execution(tag),
        QueryOutcome::Empty => Response::EmptyQuery,
    }
}

#[async_trait]
impl SimpleQueryHandler for BemiQueryProcessor {
    async fn do_query<'a, C>(&self, _client: &mut C, query: &'a str) -> PgWireResult<Vec<Response<'a>>>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        let token = self.cancel.begin_query();
        let outcomes = self.handler.handle_simple(query, &token).await?;
        Ok(outcomes.into_iter().map(outcome_to_response).collect())
    }
}

#[async_trait]
impl ExtendedQueryHandler for BemiQueryProcessor {
    type Statement = String;
    type QueryParser = NoopQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.parser.clone()
    }

    async fn do_query<'a, C>(
        &self,
        _client: &mut C,
        portal: &'a Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response<'a>>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        if portal.parameter_len() > 0 {
            return Err(user_error("0A000", "bound parameters are not supported"));
        }
        let token = self.cancel.begin_query();
        let outcome = self
            .handler
            .handle_one(&portal.statement.statement, &token)
            .await?;
        Ok(outcome_to_response(outcome))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        let fields = self.handler.describe(&target.statement).await?;
        Ok(DescribeStatementResponse::new(Vec::new(), fields))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        let fields = self.handler.describe(&target.statement.statement).await?;
        Ok(DescribePortalResponse::new(fields))
    }
}

/// Per-connection handler bundle.
pub struct BemiHandlerFactory {
    startup: Arc<BemiStartupHandler>,
    processor: Arc<BemiQueryProcessor>,
}

impl PgWireServerHandlers for BemiHandlerFactory {
    type StartupHandler = BemiStartupHandler;
    type SimpleQueryHandler = BemiQueryProcessor;
    type ExtendedQueryHandler = BemiQueryProcessor;
    type CopyHandler = NoopCopyHandler;
    type ErrorHandler = NoopErrorHandler;

    fn simple_query_handler(&self) -> Arc<Self::SimpleQueryHandler> {
        self.processor.clone()
    }

    fn extended_query_handler(&self) -> Arc<Self::ExtendedQueryHandler> {
        self.processor.clone()
    }

    fn startup_handler(&self) -> Arc<Self::StartupHandler> {
        self.startup.clone()
    }

    fn copy_handler(&self) -> Arc<Self::CopyHandler> {
        Arc::new(NoopCopyHandler)
    }

    fn error_handler(&self) -> Arc<Self::ErrorHandler> {
        Arc::new(NoopErrorHandler)
    }
}

/// Accept loop: one independently scheduled task per connection; sessions
/// share nothing but the engine and the cancel registry.
pub async fn serve(config: &Config, handler: Arc<QueryHandler>) -> Result<()> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding wire listener on {addr}"))?;
    tracing::info!(addr = %addr, "listening for Postgres connections");

    let registry = Arc::new(CancelRegistry::default());
    let mut next_pid = 0i32;

    loop {
        let (socket, peer) = listener.accept().await.context("accepting connection")?;
        next_pid += 1;
        let pid = next_pid;
        let secret: i32 = rand::random();
        let cancel = registry.register(pid, secret);
        tracing::debug!(peer = %peer, pid, "accepted connection");

        let factory = Arc::new(BemiHandlerFactory {
            startup: Arc::new(BemiStartupHandler {
                password: config.server.password.clone(),
                registry: registry.clone(),
                pid,
                secret,
            }),
            processor: Arc::new(BemiQueryProcessor {
                handler: handler.clone(),
                cancel,
                parser: Arc::new(NoopQueryParser::new()),
            }),
        });

        let registry = registry.clone();
        tokio::spawn(async move {
            if let Err(e) = process_socket(socket, None, factory).await {
                tracing::debug!(pid, error = %e, "session ended with error");
            }
            registry.unregister(pid, secret);
            tracing::debug!(pid, "session closed");
        });
    }
}
