// switchyard/src/mcp/manager.rs

//! The session registry: one long-lived actor owning every MCP session,
//! aggregating their tools, routing tool calls, and reconnecting
//! crashed or unhealthy sessions on a timer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{BoxFuture, SessionStatus, Transport};
use crate::config::ServerConfig;
use crate::errors::McpError;
use crate::models::tools::{FunctionDecl, McpTool};

/// Default interval between health sweeps.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(300);

/// Builds a connected transport for a server config. Injectable so
/// tests can script transports.
pub type TransportFactory =
    Arc<dyn Fn(ServerConfig) -> BoxFuture<Result<Arc<dyn Transport>, McpError>> + Send + Sync>;

fn default_factory() -> TransportFactory {
    Arc::new(|config| {
        Box::pin(async move {
            match config {
                ServerConfig::Http(http) => {
                    let session = super::http::HttpSession::connect(http).await?;
                    Ok(Arc::new(session) as Arc<dyn Transport>)
                }
                ServerConfig::Stdio(stdio) => {
                    let session = super::stdio::StdioSession::connect(stdio).await?;
                    Ok(Arc::new(session) as Arc<dyn Transport>)
                }
            }
        })
    })
}

/// Per-session summary returned by [`SessionManager::list_sessions`].
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: String,
    pub status: SessionStatus,
    pub tool_count: usize,
    /// Time since the session was last swept.
    pub last_health_check: Duration,
}

/// The MCP-form tools one session advertises, for routing builds.
#[derive(Debug, Clone)]
pub struct SessionTools {
    pub session_id: String,
    pub tools: Vec<McpTool>,
}

enum Command {
    AddServer { config: ServerConfig, reply: oneshot::Sender<Result<String, McpError>> },
    RemoveServer { id: String, reply: oneshot::Sender<Result<(), McpError>> },
    ListSessions { reply: oneshot::Sender<Vec<SessionSummary>> },
    GetAllTools { reply: oneshot::Sender<Vec<FunctionDecl>> },
    ListRawTools { reply: oneshot::Sender<Vec<SessionTools>> },
    CallTool { name: String, arguments: Value, reply: oneshot::Sender<Result<Value, McpError>> },
    HealthCheck { reply: oneshot::Sender<()> },
    TransportDied { id: String },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Cloneable handle to the manager actor. Every operation is a
/// synchronous rendezvous with the actor's mailbox.
#[derive(Clone)]
pub struct SessionManager {
    tx: mpsc::Sender<Command>,
}

impl SessionManager {
    /// Starts the manager with the real transports and the default
    /// health interval.
    pub fn spawn() -> Self {
        Self::spawn_with(default_factory(), DEFAULT_HEALTH_INTERVAL)
    }

    /// Starts the manager with a custom transport factory and health
    /// interval.
    pub fn spawn_with(factory: TransportFactory, health_interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(32);
        let actor = ManagerActor {
            sessions: Vec::new(),
            factory,
            health_interval,
            tx: tx.clone(),
        };
        tokio::spawn(actor.run(rx));
        Self { tx }
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, McpError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| McpError::Protocol("session manager not running".to_string()))?;
        rx.await
            .map_err(|_| McpError::Protocol("session manager not running".to_string()))
    }

    /// Starts a transport for the config, queries its tools, and
    /// registers the session. Returns the deterministic session id.
    pub async fn add_server(&self, config: ServerConfig) -> Result<String, McpError> {
        self.call(|reply| Command::AddServer { config, reply }).await?
    }

    /// Stops the session's transport and drops the record.
    pub async fn remove_server(&self, id: &str) -> Result<(), McpError> {
        let id = id.to_string();
        self.call(|reply| Command::RemoveServer { id, reply }).await?
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, McpError> {
        self.call(|reply| Command::ListSessions { reply }).await
    }

    /// Tools from all connected sessions, in external form.
    pub async fn get_all_tools(&self) -> Result<Vec<FunctionDecl>, McpError> {
        self.call(|reply| Command::GetAllTools { reply }).await
    }

    /// MCP-form tools per connected session, for routing builds.
    pub async fn list_raw_tools(&self) -> Result<Vec<SessionTools>, McpError> {
        self.call(|reply| Command::ListRawTools { reply }).await
    }

    /// Routes a tool call to a connected session advertising the name.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        let name = name.to_string();
        self.call(|reply| Command::CallTool { name, arguments, reply }).await?
    }

    /// Runs one immediate health sweep and waits for it to finish.
    pub async fn health_check(&self) -> Result<(), McpError> {
        self.call(|reply| Command::HealthCheck { reply }).await
    }

    /// Shuts down every session and stops the actor.
    pub async fn stop(&self) -> Result<(), McpError> {
        self.call(|reply| Command::Shutdown { reply }).await
    }
}

struct SessionEntry {
    id: String,
    config: ServerConfig,
    transport: Option<Arc<dyn Transport>>,
    status: SessionStatus,
    tools: Vec<McpTool>,
    last_health_check: Instant,
}

struct ManagerActor {
    /// Insertion-ordered: routing iterates sessions in the order they
    /// were added.
    sessions: Vec<SessionEntry>,
    factory: TransportFactory,
    health_interval: Duration,
    tx: mpsc::Sender<Command>,
}

impl ManagerActor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let mut health = tokio::time::interval_at(
            tokio::time::Instant::now() + self.health_interval,
            self.health_interval,
        );
        health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    None => break,
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown_all().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command).await,
                },
                _ = health.tick() => self.health_sweep().await,
            }
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::AddServer { config, reply } => {
                let _ = reply.send(self.add_server(config).await);
            }
            Command::RemoveServer { id, reply } => {
                let _ = reply.send(self.remove_server(&id).await);
            }
            Command::ListSessions { reply } => {
                let summaries = self
                    .sessions
                    .iter()
                    .map(|s| SessionSummary {
                        id: s.id.clone(),
                        status: s.status,
                        tool_count: s.tools.len(),
                        last_health_check: s.last_health_check.elapsed(),
                    })
                    .collect();
                let _ = reply.send(summaries);
            }
            Command::GetAllTools { reply } => {
                let tools = self
                    .sessions
                    .iter()
                    .filter(|s| s.status == SessionStatus::Connected)
                    .flat_map(|s| s.tools.iter().map(McpTool::to_function_decl))
                    .collect();
                let _ = reply.send(tools);
            }
            Command::ListRawTools { reply } => {
                let tools = self
                    .sessions
                    .iter()
                    .filter(|s| s.status == SessionStatus::Connected)
                    .map(|s| SessionTools { session_id: s.id.clone(), tools: s.tools.clone() })
                    .collect();
                let _ = reply.send(tools);
            }
            Command::CallTool { name, arguments, reply } => {
                let _ = reply.send(self.call_tool(&name, arguments).await);
            }
            Command::HealthCheck { reply } => {
                self.health_sweep().await;
                let _ = reply.send(());
            }
            Command::TransportDied { id } => self.transport_died(&id),
            // Intercepted by the run loop; answered here only so the
            // match stays exhaustive.
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn add_server(&mut self, config: ServerConfig) -> Result<String, McpError> {
        let id = server_id(&config);
        let transport = (self.factory)(config.clone()).await?;

        // A failed tool query does not fail registration; the tools are
        // refreshed at the next health sweep.
        let tools = match transport.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                warn!(id = %id, error = %e, "Tool query failed at registration, keeping session");
                Vec::new()
            }
        };

        self.watch_transport(&id, &transport);
        info!(id = %id, tools = tools.len(), "Registered MCP session");

        let entry = SessionEntry {
            id: id.clone(),
            config,
            transport: Some(transport),
            status: SessionStatus::Connected,
            tools,
            last_health_check: Instant::now(),
        };
        if let Some(existing) = self.sessions.iter_mut().find(|s| s.id == id) {
            if let Some(old) = existing.transport.take() {
                old.shutdown().await;
            }
            *existing = entry;
        } else {
            self.sessions.push(entry);
        }
        Ok(id)
    }

    async fn remove_server(&mut self, id: &str) -> Result<(), McpError> {
        let Some(position) = self.sessions.iter().position(|s| s.id == id) else {
            return Err(McpError::Protocol(format!("unknown session: {id}")));
        };
        let entry = self.sessions.remove(position);
        if let Some(transport) = entry.transport {
            transport.shutdown().await;
        }
        info!(id = %id, "Removed MCP session");
        Ok(())
    }

    /// Routing with recovery: iterate connected sessions advertising
    /// the tool in insertion order. A crash triggers one reconnect and
    /// one retry on the fresh transport; a timeout stops the search
    /// (the server is likely alive but slow); any other error surfaces
    /// as-is.
    async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<Value, McpError> {
        let candidates: Vec<usize> = self
            .sessions
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                s.status == SessionStatus::Connected && s.tools.iter().any(|t| t.name == name)
            })
            .map(|(i, _)| i)
            .collect();

        if candidates.is_empty() {
            return Err(McpError::ToolNotFound(name.to_string()));
        }

        for index in candidates {
            let Some(transport) = self.sessions[index].transport.clone() else {
                continue;
            };
            match transport.call_tool(name, arguments.clone()).await {
                Ok(result) => return Ok(result),
                // Defensive; the candidate filter should have caught it.
                Err(McpError::ToolNotFound(_)) => continue,
                Err(McpError::ServerCrashed(reason)) => {
                    let id = self.sessions[index].id.clone();
                    warn!(id = %id, reason = %reason, "Session crashed mid-call, reconnecting");
                    self.sessions[index].status = SessionStatus::Disconnected;
                    self.sessions[index].transport = None;
                    match self.reconnect(index).await {
                        Ok(fresh) => match fresh.call_tool(name, arguments.clone()).await {
                            Ok(result) => {
                                info!(id = %id, "Recovered after reconnect");
                                return Ok(result);
                            }
                            Err(e) => {
                                debug!(id = %id, error = %e, "Retry on fresh transport failed");
                                continue;
                            }
                        },
                        Err(e) => {
                            warn!(id = %id, error = %e, "Reconnect failed");
                            continue;
                        }
                    }
                }
                Err(e @ McpError::OperationTimeout(_)) => return Err(e),
                Err(e) => return Err(e),
            }
        }

        // Preserve the same error shape as the no-candidate case.
        Err(McpError::ToolNotFound(name.to_string()))
    }

    async fn reconnect(&mut self, index: usize) -> Result<Arc<dyn Transport>, McpError> {
        let config = self.sessions[index].config.clone();
        let id = self.sessions[index].id.clone();
        let transport = (self.factory)(config).await?;
        self.watch_transport(&id, &transport);
        self.sessions[index].transport = Some(transport.clone());
        self.sessions[index].status = SessionStatus::Connected;
        Ok(transport)
    }

    /// One sweep: refresh tools on connected sessions, marking failures
    /// disconnected; try to revive disconnected sessions.
    async fn health_sweep(&mut self) {
        debug!(sessions = self.sessions.len(), "Health sweep");
        for index in 0..self.sessions.len() {
            self.sessions[index].last_health_check = Instant::now();
            match self.sessions[index].status {
                SessionStatus::Connected => {
                    let Some(transport) = self.sessions[index].transport.clone() else {
                        self.sessions[index].status = SessionStatus::Disconnected;
                        continue;
                    };
                    match transport.list_tools().await {
                        Ok(tools) => self.sessions[index].tools = tools,
                        Err(e) => {
                            warn!(id = %self.sessions[index].id, error = %e, "Health check failed, marking disconnected");
                            transport.shutdown().await;
                            self.sessions[index].transport = None;
                            self.sessions[index].status = SessionStatus::Disconnected;
                        }
                    }
                }
                SessionStatus::Disconnected => {
                    match self.reconnect(index).await {
                        Ok(transport) => {
                            if let Ok(tools) = transport.list_tools().await {
                                self.sessions[index].tools = tools;
                            }
                            info!(id = %self.sessions[index].id, "Session reconnected");
                        }
                        Err(e) => {
                            debug!(id = %self.sessions[index].id, error = %e, "Reconnect attempt failed");
                        }
                    }
                }
            }
        }
    }

    /// An asynchronous death notice from a transport watcher. Ignored
    /// when the session has already been replaced by a live transport.
    fn transport_died(&mut self, id: &str) {
        if let Some(entry) = self.sessions.iter_mut().find(|s| s.id == id) {
            let still_dead = entry.transport.as_ref().map_or(true, |t| !t.is_alive());
            if still_dead {
                warn!(id = %id, "Transport actor died, marking disconnected");
                entry.transport = None;
                entry.status = SessionStatus::Disconnected;
            }
        }
    }

    fn watch_transport(&self, id: &str, transport: &Arc<dyn Transport>) {
        let id = id.to_string();
        let transport = transport.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            transport.closed().await;
            let _ = tx.send(Command::TransportDied { id }).await;
        });
    }

    async fn shutdown_all(&mut self) {
        for entry in self.sessions.drain(..) {
            if let Some(transport) = entry.transport {
                transport.shutdown().await;
            }
        }
    }
}

/// Derives the deterministic session id: lowercase hex of the first 8
/// bytes of SHA-256 over the JSON-normalized config. Environment maps
/// normalize to key-sorted two-element arrays so the same logical
/// config always hashes the same.
pub fn server_id(config: &ServerConfig) -> String {
    let canonical = match config {
        ServerConfig::Stdio(stdio) => {
            let mut env: Vec<(&String, &String)> = stdio.env.iter().collect();
            env.sort();
            let pairs: Vec<Value> = env
                .into_iter()
                .map(|(k, v)| json!([k, v]))
                .collect();
            json!({
                "args": stdio.args,
                "command": stdio.command,
                "env": pairs,
            })
        }
        ServerConfig::Http(http) => json!({
            "auth_token": http.auth_token,
            "execution_id": http.execution_id,
            "url": http.url,
        }),
    };
    let digest = Sha256::digest(canonical.to_string().as_bytes());
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}
