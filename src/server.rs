//! Server lifecycle: options, handler registration, listeners and the
//! accept loop, plus delegate notifications.
//!
//! The registration surface is mutable only while the server is stopped;
//! `start` freezes everything into an immutable [`ServerContext`] shared by
//! reference count with every live connection, so no locking is needed on
//! the request path. `stop` closes the listening sockets only, in-flight
//! connections drain on their own.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::Method;
use regex::RegexBuilder;
use tokio::net::{TcpListener, TcpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::{AuthenticationScheme, Authenticator};
use crate::connection::{Connection, ConnectionHooks};
use crate::handler::{self, Handler, MatchFn, ProcessFn};
use crate::protocol::ServerError;
use crate::request::RequestBodyKind;

/// Authentication requirement applied to every request before dispatch.
pub struct AuthenticationConfig {
    pub scheme: AuthenticationScheme,
    /// Challenge realm; defaults to the server name when `None`.
    pub realm: Option<String>,
    /// User name to password map.
    pub accounts: HashMap<String, String>,
}

/// Service advertisement parameters handed to the [`ServiceRegistrar`].
pub struct BonjourConfig {
    /// Advertised name; defaults to the server name when `None`.
    pub name: Option<String>,
    pub service_type: String,
    pub txt_data: HashMap<String, String>,
}

impl Default for BonjourConfig {
    fn default() -> Self {
        Self { name: None, service_type: "_http._tcp".to_string(), txt_data: HashMap::new() }
    }
}

pub struct ServerOptions {
    /// TCP port, 0 for an OS-assigned one.
    pub port: u16,
    /// Bind to loopback only instead of all interfaces.
    pub bind_to_localhost: bool,
    /// Listen queue depth.
    pub max_pending_connections: u32,
    /// `Server` header value, default Bonjour name and default auth realm.
    pub server_name: String,
    pub authentication: Option<AuthenticationConfig>,
    /// Rewrite HEAD to GET before matching, suppressing only the response
    /// body. On by default.
    pub map_head_to_get: bool,
    /// Debounce window before the delegate's disconnected notification.
    pub connected_state_coalescing_interval: Duration,
    /// Service advertisement, delegated to a registrar collaborator.
    pub bonjour: Option<BonjourConfig>,
    /// Ask the registrar collaborator for a NAT port mapping.
    pub request_nat_port_mapping: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            port: 0,
            bind_to_localhost: false,
            max_pending_connections: 16,
            server_name: "HearthHttp".to_string(),
            authentication: None,
            map_head_to_get: true,
            connected_state_coalescing_interval: Duration::from_secs(1),
            bonjour: None,
            request_nat_port_mapping: false,
        }
    }
}

/// One-way lifecycle notifications to the embedding application.
pub trait ServerDelegate: Send + Sync {
    fn did_start(&self) {}
    fn did_complete_service_registration(&self) {}
    fn did_update_nat_port_mapping(&self) {}
    /// First connection opened while none were active.
    fn did_connect(&self) {}
    /// Last connection closed and the coalescing window elapsed.
    fn did_disconnect(&self) {}
    fn did_stop(&self) {}
}

/// External collaborator for service discovery and NAT traversal.
/// Registration is fire-and-forget from the server's point of view.
pub trait ServiceRegistrar: Send + Sync {
    fn register_service(&self, name: &str, service_type: &str, port: u16, txt_data: &HashMap<String, String>);
    fn request_port_mapping(&self, port: u16);
    fn unregister(&self);
}

/// Immutable per-run state shared with every connection task.
pub(crate) struct ServerContext {
    pub(crate) handlers: Vec<Arc<Handler>>,
    pub(crate) server_name: String,
    pub(crate) map_head_to_get: bool,
    pub(crate) authenticator: Option<Authenticator>,
    pub(crate) hooks: Option<Arc<dyn ConnectionHooks>>,
    delegate: Option<Arc<dyn ServerDelegate>>,
    coalescing_interval: Duration,
    coalescing: Arc<Mutex<CoalescingState>>,
}

#[derive(Default)]
struct CoalescingState {
    active: usize,
    connected: bool,
    /// Bumped on every transition, lets a pending disconnect timer detect
    /// it has been superseded.
    epoch: u64,
}

impl ServerContext {
    pub(crate) fn connection_opened(&self) {
        let became_connected = {
            let mut state = self.coalescing.lock().unwrap();
            state.active += 1;
            state.epoch += 1;
            if state.connected {
                false
            } else {
                state.connected = true;
                true
            }
        };
        if became_connected {
            if let Some(delegate) = &self.delegate {
                delegate.did_connect();
            }
        }
    }

    pub(crate) fn connection_closed(&self) {
        let epoch = {
            let mut state = self.coalescing.lock().unwrap();
            state.active -= 1;
            if state.active > 0 {
                return;
            }
            state.epoch += 1;
            state.epoch
        };
        let coalescing = Arc::clone(&self.coalescing);
        let delegate = self.delegate.clone();
        let interval = self.coalescing_interval;
        tokio::spawn(async move {
            if !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
            let fire = {
                let mut state = coalescing.lock().unwrap();
                if state.epoch == epoch && state.active == 0 && state.connected {
                    state.connected = false;
                    true
                } else {
                    false
                }
            };
            if fire {
                if let Some(delegate) = delegate {
                    delegate.did_disconnect();
                }
            }
        });
    }
}

struct Running {
    port: u16,
    accept_tasks: Vec<JoinHandle<()>>,
}

/// An embeddable HTTP/1.1 server.
///
/// Handlers and collaborators are registered while stopped; `start` binds
/// the listeners and freezes the configuration, `stop` closes only the
/// listeners.
pub struct Server {
    options: ServerOptions,
    handlers: Vec<Arc<Handler>>,
    hooks: Option<Arc<dyn ConnectionHooks>>,
    delegate: Option<Arc<dyn ServerDelegate>>,
    registrar: Option<Arc<dyn ServiceRegistrar>>,
    running: Option<Running>,
}

impl Server {
    pub fn new(options: ServerOptions) -> Self {
        Self { options, handlers: Vec::new(), hooks: None, delegate: None, registrar: None, running: None }
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// The bound port while running.
    pub fn port(&self) -> Option<u16> {
        self.running.as_ref().map(|running| running.port)
    }

    pub fn set_connection_hooks(&mut self, hooks: Arc<dyn ConnectionHooks>) {
        self.assert_stopped();
        self.hooks = Some(hooks);
    }

    pub fn set_delegate(&mut self, delegate: Arc<dyn ServerDelegate>) {
        self.assert_stopped();
        self.delegate = Some(delegate);
    }

    pub fn set_service_registrar(&mut self, registrar: Arc<dyn ServiceRegistrar>) {
        self.assert_stopped();
        self.registrar = Some(registrar);
    }

    /// Registers a handler from a raw match/process pair. Later
    /// registrations take precedence over earlier ones.
    pub fn add_handler(&mut self, match_fn: MatchFn, process_fn: ProcessFn) {
        self.assert_stopped();
        self.handlers.push(Arc::new(Handler::new(match_fn, process_fn)));
    }

    /// Registers a handler matching every request with the given method.
    pub fn add_default_handler_for_method(&mut self, method: Method, kind: RequestBodyKind, process_fn: ProcessFn) {
        self.add_handler(handler::match_method(method, kind), process_fn);
    }

    /// Registers a handler for an exact method and path.
    pub fn add_handler_for_method_path(
        &mut self,
        method: Method,
        path: &str,
        kind: RequestBodyKind,
        process_fn: ProcessFn,
    ) {
        self.add_handler(handler::match_method_path(method, path, kind), process_fn);
    }

    /// Registers a handler for a method and a case-insensitive regex over
    /// the decoded path; capture groups are exposed on the request.
    pub fn add_handler_for_method_path_regex(
        &mut self,
        method: Method,
        pattern: &str,
        kind: RequestBodyKind,
        process_fn: ProcessFn,
    ) -> Result<(), ServerError> {
        let pattern = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|error| ServerError::invalid_option(format!("invalid path pattern: {error}")))?;
        self.add_handler(handler::match_method_path_regex(method, pattern, kind), process_fn);
        Ok(())
    }

    /// Serves fixed bytes for GET requests to an exact path.
    pub fn add_get_handler_for_path_data(
        &mut self,
        path: &str,
        data: impl Into<Bytes>,
        content_type: &str,
        cache_age: u32,
    ) {
        self.assert_stopped();
        self.handlers.push(Arc::new(handler::static_data_handler(path, data.into(), content_type, cache_age)));
    }

    /// Serves one file for GET requests to an exact path. `attachment`
    /// adds a download disposition named after the file.
    pub fn add_get_handler_for_path_file(
        &mut self,
        path: &str,
        file_path: PathBuf,
        cache_age: u32,
        allow_ranges: bool,
        attachment: bool,
    ) {
        self.assert_stopped();
        self.handlers.push(Arc::new(handler::static_file_handler(
            path,
            file_path,
            cache_age,
            allow_ranges,
            attachment,
        )));
    }

    /// Serves a directory tree for GET requests under a base path.
    pub fn add_get_handler_for_base_path(
        &mut self,
        base_path: &str,
        directory: PathBuf,
        index_filename: Option<String>,
        cache_age: u32,
        allow_ranges: bool,
    ) {
        self.assert_stopped();
        self.handlers.push(Arc::new(handler::directory_handler(base_path, directory, index_filename, cache_age, allow_ranges)));
    }

    pub fn remove_all_handlers(&mut self) {
        self.assert_stopped();
        self.handlers.clear();
    }

    fn assert_stopped(&self) {
        assert!(self.running.is_none(), "handler registration requires a stopped server");
    }

    /// Binds the listeners and begins accepting connections; returns the
    /// bound port. Fails without partial state: either all configured
    /// sockets are listening or none is.
    pub async fn start(&mut self) -> Result<u16, ServerError> {
        if self.running.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let authenticator = self.options.authentication.as_ref().map(|config| {
            let realm = config.realm.as_deref().unwrap_or(&self.options.server_name);
            Authenticator::new(config.scheme, realm, config.accounts.clone())
        });

        let v4_address = SocketAddr::new(
            IpAddr::V4(if self.options.bind_to_localhost { Ipv4Addr::LOCALHOST } else { Ipv4Addr::UNSPECIFIED }),
            self.options.port,
        );
        let v4_listener = bind_listener(v4_address, self.options.max_pending_connections)
            .map_err(|error| ServerError::bind(v4_address, error))?;
        let port = v4_listener
            .local_addr()
            .map_err(|error| ServerError::bind(v4_address, error))?
            .port();

        // dual-stack platforms may already cover v6 through the v4 socket
        let v6_address = SocketAddr::new(
            IpAddr::V6(if self.options.bind_to_localhost { Ipv6Addr::LOCALHOST } else { Ipv6Addr::UNSPECIFIED }),
            port,
        );
        let v6_listener = match bind_listener(v6_address, self.options.max_pending_connections) {
            Ok(listener) => Some(listener),
            Err(error) => {
                debug!(address = %v6_address, cause = %error, "no separate IPv6 listener");
                None
            }
        };

        let context = Arc::new(ServerContext {
            handlers: self.handlers.clone(),
            server_name: self.options.server_name.clone(),
            map_head_to_get: self.options.map_head_to_get,
            authenticator,
            hooks: self.hooks.clone(),
            delegate: self.delegate.clone(),
            coalescing_interval: self.options.connected_state_coalescing_interval,
            coalescing: Arc::new(Mutex::new(CoalescingState::default())),
        });

        let mut accept_tasks = Vec::new();
        for listener in std::iter::once(v4_listener).chain(v6_listener) {
            accept_tasks.push(tokio::spawn(accept_loop(listener, Arc::clone(&context))));
        }
        self.running = Some(Running { port, accept_tasks });
        info!(port, localhost_only = self.options.bind_to_localhost, "server started");

        if let Some(delegate) = &self.delegate {
            delegate.did_start();
        }
        if let Some(registrar) = &self.registrar {
            if let Some(bonjour) = &self.options.bonjour {
                let name = bonjour.name.as_deref().unwrap_or(&self.options.server_name);
                registrar.register_service(name, &bonjour.service_type, port, &bonjour.txt_data);
                if let Some(delegate) = &self.delegate {
                    delegate.did_complete_service_registration();
                }
            }
            if self.options.request_nat_port_mapping {
                registrar.request_port_mapping(port);
                if let Some(delegate) = &self.delegate {
                    delegate.did_update_nat_port_mapping();
                }
            }
        }

        Ok(port)
    }

    /// Closes the listening sockets. Connections already accepted keep
    /// running until they finish on their own.
    pub fn stop(&mut self) -> Result<(), ServerError> {
        let running = self.running.take().ok_or(ServerError::NotRunning)?;
        for task in running.accept_tasks {
            task.abort();
        }
        if let Some(registrar) = &self.registrar {
            registrar.unregister();
        }
        info!(port = running.port, "server stopped");
        if let Some(delegate) = &self.delegate {
            delegate.did_stop();
        }
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.running.is_some() {
            let _ = self.stop();
        }
    }
}

fn bind_listener(address: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
    let socket = match address {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(address)?;
    socket.listen(backlog)
}

async fn accept_loop(listener: TcpListener, context: Arc<ServerContext>) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                warn!(cause = %error, "failed to accept");
                continue;
            }
        };
        let context = Arc::clone(&context);
        tokio::spawn(Connection::new(context, stream, peer_addr).serve());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingDelegate {
        connects: AtomicUsize,
        disconnects: AtomicUsize,
    }

    impl ServerDelegate for CountingDelegate {
        fn did_connect(&self) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }

        fn did_disconnect(&self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn context_with(delegate: Arc<CountingDelegate>, interval: Duration) -> ServerContext {
        ServerContext {
            handlers: Vec::new(),
            server_name: "test".to_string(),
            map_head_to_get: true,
            authenticator: None,
            hooks: None,
            delegate: Some(delegate),
            coalescing_interval: interval,
            coalescing: Arc::new(Mutex::new(CoalescingState::default())),
        }
    }

    #[tokio::test]
    async fn overlapping_connections_coalesce_into_one_connected_cycle() {
        let delegate = Arc::new(CountingDelegate::default());
        let context = context_with(Arc::clone(&delegate), Duration::from_millis(20));

        context.connection_opened();
        context.connection_opened();
        context.connection_closed();
        context.connection_closed();
        // reconnect inside the coalescing window
        context.connection_opened();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(delegate.connects.load(Ordering::SeqCst), 1);
        assert_eq!(delegate.disconnects.load(Ordering::SeqCst), 0);

        context.connection_closed();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(delegate.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn start_rejects_a_running_server() {
        let mut server = Server::new(ServerOptions { bind_to_localhost: true, ..Default::default() });
        let port = server.start().await.unwrap();
        assert!(port > 0);
        assert!(server.is_running());
        assert!(matches!(server.start().await, Err(ServerError::AlreadyRunning)));
        server.stop().unwrap();
        assert!(!server.is_running());
        assert!(matches!(server.stop(), Err(ServerError::NotRunning)));
    }

    #[test]
    #[should_panic(expected = "stopped server")]
    fn registration_panics_while_running() {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let mut server = Server::new(ServerOptions { bind_to_localhost: true, ..Default::default() });
        runtime.block_on(server.start()).unwrap();
        server.remove_all_handlers();
    }
}
