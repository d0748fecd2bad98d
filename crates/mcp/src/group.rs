//! Several sessions behind one catalog and one call surface.
//!
//! Each connected server contributes a slice to the [`Catalog`]. Calls are
//! routed to the server that owns the name or uri, and operations that touch
//! every server run concurrently and report failures per server.

use crate::callbacks::CallbackRouter;
use crate::error::{McpError, McpResult};
use crate::schema::{
    methods, GetPromptResult, Implementation, InitializeResult, LoggingLevel, ReadResourceResult,
    ServerCapabilities,
};
use crate::session::{NotificationHandler, Session, SessionConfig};
use crate::transport::{StdioTransport, StreamableHttpTransport, Transport};
use futures::future::join_all;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use switchyard_core::catalog::{Catalog, CatalogEntry, CatalogKind, Collision, MergeReport, ServerCatalog};
use switchyard_core::content::{flatten, render_items, ResultItem};
use switchyard_core::{
    PromptDescriptor, ResourceDescriptor, ResourceTemplateDescriptor, ServerId, ToolDescriptor,
};
use tracing::{debug, info, warn};
use url::Url;

/// How to reach a server
#[derive(Debug, Clone, PartialEq)]
pub enum ServerParams {
    Stdio {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    },
    Http {
        url: Url,
        headers: HashMap<String, String>,
    },
}

impl ServerParams {
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        Self::Stdio {
            command: command.into(),
            args,
            env: HashMap::new(),
        }
    }

    fn open(&self, server: &ServerId) -> McpResult<Arc<dyn Transport>> {
        Ok(match self {
            Self::Stdio { command, args, env } => {
                Arc::new(StdioTransport::spawn(server, command, args, env)?)
            }
            Self::Http { url, headers } => {
                Arc::new(StreamableHttpTransport::new(url.clone(), headers)?)
            }
        })
    }
}

/// What the group knows about one connected server
#[derive(Debug, Clone, PartialEq)]
pub struct ServerHandle {
    pub id: ServerId,
    pub server_info: Implementation,
    pub protocol_version: String,
    pub capabilities: ServerCapabilities,
    pub instructions: Option<String>,
    /// Keys this server took over from earlier servers when it connected
    pub collisions: Vec<Collision>,
}

impl ServerHandle {
    fn new(id: ServerId, init: InitializeResult, report: MergeReport) -> Self {
        Self {
            id,
            server_info: init.server_info,
            protocol_version: init.protocol_version,
            capabilities: init.capabilities,
            instructions: init.instructions,
            collisions: report.collisions,
        }
    }
}

struct GroupInner {
    router: CallbackRouter,
    config: SessionConfig,
    sessions: RwLock<BTreeMap<ServerId, Arc<Session>>>,
    catalog: RwLock<Catalog>,
    /// Servers mid-connect, with the list refreshes they asked for meanwhile
    connecting: RwLock<HashMap<ServerId, Vec<CatalogKind>>>,
    handlers: RwLock<Vec<(String, NotificationHandler)>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

fn log_collisions(report: &MergeReport) {
    for c in &report.collisions {
        warn!(
            kind = %c.kind,
            key = %c.key,
            previous = %c.previous,
            winner = %c.winner,
            "Catalog collision, last registered server wins"
        );
    }
}

/// Pull every list the server advertises, concurrently.
async fn fetch_catalog(session: &Session) -> McpResult<ServerCatalog> {
    let caps = session.capabilities();

    let tools = async {
        match caps.tools {
            Some(_) => session.list_all_tools().await,
            None => Ok(Vec::new()),
        }
    };
    let resources = async {
        match caps.resources {
            Some(_) => session.list_all_resources().await,
            None => Ok(Vec::new()),
        }
    };
    let templates = async {
        match caps.resources {
            Some(_) => match session.list_all_resource_templates().await {
                Err(e) if e.is_method_not_found() => {
                    debug!(server = %session.server_id(), "Server has no resource templates");
                    Ok(Vec::new())
                }
                other => other,
            },
            None => Ok(Vec::new()),
        }
    };
    let prompts = async {
        match caps.prompts {
            Some(_) => session.list_all_prompts().await,
            None => Ok(Vec::new()),
        }
    };

    let (tools, resources, resource_templates, prompts) =
        futures::try_join!(tools, resources, templates, prompts)?;

    Ok(ServerCatalog {
        tools,
        resources,
        resource_templates,
        prompts,
    })
}

impl GroupInner {
    fn session(&self, server: &ServerId) -> Option<Arc<Session>> {
        read(&self.sessions).get(server).cloned()
    }

    fn all_sessions(&self) -> Vec<Arc<Session>> {
        read(&self.sessions).values().cloned().collect()
    }

    /// Re-fetch one list after a list-changed notification. A server still
    /// connecting gets the refresh once its first catalog is merged.
    async fn refresh_kind(&self, server: &ServerId, kind: CatalogKind) -> McpResult<()> {
        let deferred = {
            let mut connecting = write(&self.connecting);
            match connecting.get_mut(server) {
                Some(queued) => {
                    if !queued.contains(&kind) {
                        queued.push(kind);
                    }
                    true
                }
                None => false,
            }
        };
        if deferred {
            debug!(server = %server, kind = %kind, "Catalog refresh deferred until connected");
            return Ok(());
        }

        let session = self
            .session(server)
            .ok_or_else(|| McpError::UnknownServer(server.to_string()))?;

        let report = match kind {
            CatalogKind::Tool => {
                let tools = session.list_all_tools().await?;
                self.update_slice(server, |slice| slice.tools = tools)
            }
            CatalogKind::Resource | CatalogKind::ResourceTemplate => {
                let resources = session.list_all_resources().await?;
                let templates = match session.list_all_resource_templates().await {
                    Err(e) if e.is_method_not_found() => Vec::new(),
                    other => other?,
                };
                self.update_slice(server, |slice| {
                    slice.resources = resources;
                    slice.resource_templates = templates;
                })
            }
            CatalogKind::Prompt => {
                let prompts = session.list_all_prompts().await?;
                self.update_slice(server, |slice| slice.prompts = prompts)
            }
        };

        if report.is_some() {
            info!(server = %server, kind = %kind, "Catalog refreshed");
        }
        Ok(())
    }

    async fn refresh_server(&self, session: &Session) -> McpResult<()> {
        let slice = fetch_catalog(session).await?;
        self.update_slice(session.server_id(), |current| *current = slice);
        Ok(())
    }

    fn update_slice<F>(&self, server: &ServerId, update: F) -> Option<MergeReport>
    where
        F: FnOnce(&mut ServerCatalog),
    {
        let report = write(&self.catalog).refresh(server, update)?;
        log_collisions(&report);
        Some(report)
    }
}

/// Refresh a slice when the server says one of its lists changed.
fn install_list_changed(inner: &Arc<GroupInner>, session: &Session) {
    let kinds = [
        (methods::TOOLS_LIST_CHANGED, CatalogKind::Tool),
        (methods::RESOURCES_LIST_CHANGED, CatalogKind::Resource),
        (methods::PROMPTS_LIST_CHANGED, CatalogKind::Prompt),
    ];

    for (method, kind) in kinds {
        let group: Weak<GroupInner> = Arc::downgrade(inner);
        session.on_notification(
            method,
            Arc::new(move |server: &ServerId, _params: Option<Value>| {
                let Some(group) = group.upgrade() else {
                    return;
                };
                let server = server.clone();
                tokio::spawn(async move {
                    if let Err(e) = group.refresh_kind(&server, kind).await {
                        warn!(server = %server, kind = %kind, error = %e, "Catalog refresh failed");
                    }
                });
            }),
        );
    }
}

/// Drop a server's slice once its stream fails. The session stays registered
/// until it is disconnected.
fn install_failure(inner: &Arc<GroupInner>, session: &Session) {
    let group: Weak<GroupInner> = Arc::downgrade(inner);
    session.on_failure(Arc::new(move |server: &ServerId| {
        let Some(group) = group.upgrade() else {
            return;
        };
        if write(&group.catalog).remove(server) {
            warn!(server = %server, "Server failed, catalog entries withdrawn");
        }
    }));
}

/// A name claimed by an unfinished connect. Released on drop unless the
/// session was registered.
struct Reservation<'a> {
    connecting: &'a RwLock<HashMap<ServerId, Vec<CatalogKind>>>,
    name: ServerId,
    armed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            write(self.connecting).remove(&self.name);
        }
    }
}

#[derive(Clone)]
pub struct SessionGroup {
    inner: Arc<GroupInner>,
}

impl SessionGroup {
    pub fn new(router: CallbackRouter, config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(GroupInner {
                router,
                config,
                sessions: RwLock::new(BTreeMap::new()),
                catalog: RwLock::new(Catalog::new()),
                connecting: RwLock::new(HashMap::new()),
                handlers: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Spawn or dial a server and connect it to the group.
    pub async fn connect_server(
        &self,
        name: impl Into<ServerId>,
        params: &ServerParams,
    ) -> McpResult<ServerHandle> {
        let name = name.into();
        self.ensure_new(&name)?;
        let transport = params.open(&name)?;
        self.connect_transport(name, transport).await
    }

    /// Connect a server over a transport the caller already opened.
    pub async fn connect_transport(
        &self,
        name: impl Into<ServerId>,
        transport: Arc<dyn Transport>,
    ) -> McpResult<ServerHandle> {
        let name = name.into();
        let mut reservation = self.reserve(&name)?;

        let session = Arc::new(Session::new(
            name.clone(),
            transport,
            self.inner.router.clone(),
            self.inner.config.clone(),
        ));
        install_list_changed(&self.inner, &session);
        install_failure(&self.inner, &session);
        for (method, handler) in read(&self.inner.handlers).iter() {
            session.on_notification(method.clone(), handler.clone());
        }

        let (init, slice) = match Self::start(&session).await {
            Ok(started) => started,
            Err(e) => {
                warn!(server = %name, error = %e, "Could not connect server");
                let _ = session.disconnect().await;
                return Err(e);
            }
        };

        let counts = (
            slice.tools.len(),
            slice.resources.len(),
            slice.resource_templates.len(),
            slice.prompts.len(),
        );
        // registration and the end of the reservation are one step, so a
        // list-changed refresh is either queued or sees the session
        let (report, queued) = {
            let mut connecting = write(&self.inner.connecting);
            let queued = connecting.remove(&name).unwrap_or_default();
            reservation.armed = false;
            write(&self.inner.sessions).insert(name.clone(), session.clone());
            let report = write(&self.inner.catalog).merge(name.clone(), slice);
            (report, queued)
        };
        log_collisions(&report);

        // the stream may have failed before the slice was merged
        if !session.state().is_ready() {
            write(&self.inner.sessions).remove(&name);
            write(&self.inner.catalog).remove(&name);
            warn!(server = %name, "Server failed while connecting");
            let _ = session.disconnect().await;
            return Err(McpError::Disconnected);
        }

        for kind in queued {
            if let Err(e) = self.inner.refresh_kind(&name, kind).await {
                warn!(server = %name, kind = %kind, error = %e, "Catalog refresh failed");
            }
        }

        info!(
            server = %name,
            tools = counts.0,
            resources = counts.1,
            resource_templates = counts.2,
            prompts = counts.3,
            "Server connected"
        );
        Ok(ServerHandle::new(name, init, report))
    }

    async fn start(session: &Session) -> McpResult<(InitializeResult, ServerCatalog)> {
        let init = session.connect().await?;
        let slice = fetch_catalog(session).await?;
        Ok((init, slice))
    }

    fn ensure_new(&self, name: &ServerId) -> McpResult<()> {
        if read(&self.inner.connecting).contains_key(name)
            || read(&self.inner.sessions).contains_key(name)
        {
            return Err(McpError::AlreadyConnected(name.to_string()));
        }
        Ok(())
    }

    /// Claim a name for the duration of a connect.
    fn reserve(&self, name: &ServerId) -> McpResult<Reservation<'_>> {
        let mut connecting = write(&self.inner.connecting);
        if connecting.contains_key(name) || read(&self.inner.sessions).contains_key(name) {
            return Err(McpError::AlreadyConnected(name.to_string()));
        }
        connecting.insert(name.clone(), Vec::new());
        Ok(Reservation {
            connecting: &self.inner.connecting,
            name: name.clone(),
            armed: true,
        })
    }

    /// Owning session for a catalog key, after the group-level checks.
    fn owner<F>(&self, lookup: F, unknown: McpError) -> McpResult<Arc<Session>>
    where
        F: FnOnce(&Catalog) -> Option<ServerId>,
    {
        let any_ready = read(&self.inner.sessions)
            .values()
            .any(|session| session.state().is_ready());
        if !any_ready {
            return Err(McpError::NotConnected);
        }
        let server = lookup(&read(&self.inner.catalog)).ok_or(unknown)?;
        self.inner
            .session(&server)
            .ok_or_else(|| McpError::UnknownServer(server.to_string()))
    }

    /// Call a tool on the server that owns it and flatten the result.
    pub async fn call_tool(&self, name: &str, arguments: Option<Value>) -> McpResult<Vec<ResultItem>> {
        let session = self.owner(
            |catalog| catalog.tool(name).map(|e| e.server.clone()),
            McpError::UnknownTool(name.to_string()),
        )?;

        debug!(server = %session.server_id(), tool = name, "Calling tool");
        let result = session.call_tool(name, arguments).await?;
        let failed = result.is_error();
        let items = flatten(result.content);

        if failed {
            return Err(McpError::RemoteTool {
                tool: name.to_string(),
                message: render_items(&items),
            });
        }
        Ok(items)
    }

    pub async fn read_resource(&self, uri: &str) -> McpResult<ReadResourceResult> {
        let session = self.owner(
            |catalog| catalog.resource_owner(uri).cloned(),
            McpError::UnknownResource(uri.to_string()),
        )?;
        session.read_resource(uri).await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: BTreeMap<String, String>,
    ) -> McpResult<GetPromptResult> {
        let session = self.owner(
            |catalog| catalog.prompt(name).map(|e| e.server.clone()),
            McpError::UnknownPrompt(name.to_string()),
        )?;
        session.get_prompt(name, arguments).await
    }

    pub fn list_tools(&self) -> Vec<CatalogEntry<ToolDescriptor>> {
        read(&self.inner.catalog).tools().cloned().collect()
    }

    pub fn list_resources(&self) -> Vec<CatalogEntry<ResourceDescriptor>> {
        read(&self.inner.catalog).resources().cloned().collect()
    }

    pub fn list_resource_templates(&self) -> Vec<CatalogEntry<ResourceTemplateDescriptor>> {
        read(&self.inner.catalog).resource_templates().cloned().collect()
    }

    pub fn list_prompts(&self) -> Vec<CatalogEntry<PromptDescriptor>> {
        read(&self.inner.catalog).prompts().cloned().collect()
    }

    /// Disconnect one server and drop its catalog slice. Keys it shadowed
    /// fall back to the earlier owner.
    pub async fn disconnect_server(&self, name: &ServerId) -> McpResult<()> {
        let session = write(&self.inner.sessions)
            .remove(name)
            .ok_or_else(|| McpError::UnknownServer(name.to_string()))?;
        write(&self.inner.catalog).remove(name);
        info!(server = %name, "Disconnecting server");
        session.disconnect().await
    }

    /// Disconnect every server concurrently. Every server is attempted;
    /// failures are collected into [`McpError::Aggregate`].
    pub async fn disconnect_all(&self) -> McpResult<()> {
        let sessions: Vec<Arc<Session>> = {
            let mut sessions = write(&self.inner.sessions);
            std::mem::take(&mut *sessions).into_values().collect()
        };
        write(&self.inner.catalog).clear();

        let outcomes = join_all(sessions.iter().map(|session| async move {
            (session.server_id().clone(), session.disconnect().await)
        }))
        .await;

        McpError::aggregate(failures(outcomes))
    }

    /// Re-fetch every server's lists concurrently.
    pub async fn refresh(&self) -> McpResult<()> {
        let sessions = self.inner.all_sessions();
        let inner = &self.inner;
        let outcomes = join_all(sessions.iter().map(|session| async move {
            (session.server_id().clone(), inner.refresh_server(session).await)
        }))
        .await;

        McpError::aggregate(failures(outcomes))
    }

    /// Send `logging/setLevel` to every server that advertises logging.
    pub async fn set_logging_level(&self, level: LoggingLevel) -> McpResult<()> {
        let sessions: Vec<Arc<Session>> = self
            .inner
            .all_sessions()
            .into_iter()
            .filter(|s| s.capabilities().logging.is_some())
            .collect();

        let outcomes = join_all(sessions.iter().map(|session| async move {
            (session.server_id().clone(), session.set_logging_level(level).await)
        }))
        .await;

        McpError::aggregate(failures(outcomes))
    }

    /// Tell every server the client's roots changed.
    pub async fn notify_roots_changed(&self) -> McpResult<()> {
        let sessions = self.inner.all_sessions();
        let outcomes = join_all(sessions.iter().map(|session| async move {
            (
                session.server_id().clone(),
                session.notify(methods::ROOTS_LIST_CHANGED, None).await,
            )
        }))
        .await;

        McpError::aggregate(failures(outcomes))
    }

    /// Register a notification handler on every current and future session.
    pub fn on_notification(&self, method: impl Into<String>, handler: NotificationHandler) {
        let method = method.into();
        for session in self.inner.all_sessions() {
            session.on_notification(method.clone(), handler.clone());
        }
        write(&self.inner.handlers).push((method, handler));
    }

    pub fn session(&self, name: &ServerId) -> Option<Arc<Session>> {
        self.inner.session(name)
    }

    /// Connected servers in connection order.
    pub fn servers(&self) -> Vec<ServerId> {
        read(&self.inner.catalog).servers().to_vec()
    }

    pub fn server_handles(&self) -> Vec<ServerHandle> {
        self.servers()
            .into_iter()
            .filter_map(|id| {
                let init = self.inner.session(&id)?.initialize_result()?;
                Some(ServerHandle::new(id, init, MergeReport::default()))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        read(&self.inner.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.inner.sessions).is_empty()
    }
}

fn failures(outcomes: Vec<(ServerId, McpResult<()>)>) -> Vec<(ServerId, McpError)> {
    outcomes
        .into_iter()
        .filter_map(|(server, outcome)| outcome.err().map(|e| (server, e)))
        .collect()
}
