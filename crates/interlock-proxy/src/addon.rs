//! Lifecycle observers.
//!
//! Addons see three transitions of a session: the upstream TCP connection
//! coming up, the client going away, and the upstream going away. They are
//! invoked synchronously, in registration order, on the task that caused the
//! transition, so they should not block.
//!
//! A panicking addon is isolated: the panic is logged and the remaining addons
//! still run.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::connection::ClientConn;
use crate::context::ConnContext;

/// Observer of connection lifecycle events.
pub trait Addon: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// The upstream TCP connection of `ctx` has been established.
    fn server_connected(&self, _ctx: &ConnContext) {}

    /// The client connection has been closed.
    fn client_disconnected(&self, _client: &ClientConn) {}

    /// The upstream connection of `ctx` has been closed.
    fn server_disconnected(&self, _ctx: &ConnContext) {}
}

/// Ordered set of registered addons.
#[derive(Clone, Default)]
pub struct Addons {
    addons: Vec<Arc<dyn Addon>>,
}

impl fmt::Debug for Addons {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.addons.iter().map(|addon| addon.name()))
            .finish()
    }
}

impl Addons {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an addon; it runs after every addon registered before it.
    pub fn push(&mut self, addon: Arc<dyn Addon>) {
        self.addons.push(addon);
    }

    /// Builder-style [`push`](Self::push).
    pub fn with(mut self, addon: Arc<dyn Addon>) -> Self {
        self.push(addon);
        self
    }

    /// Number of registered addons.
    pub fn len(&self) -> usize {
        self.addons.len()
    }

    /// Returns true if no addon is registered.
    pub fn is_empty(&self) -> bool {
        self.addons.is_empty()
    }

    /// Notifies every addon that the upstream of `ctx` connected.
    pub fn server_connected(&self, ctx: &ConnContext) {
        self.dispatch("server_connected", |addon| addon.server_connected(ctx));
    }

    /// Notifies every addon that `client` disconnected.
    pub fn client_disconnected(&self, client: &ClientConn) {
        self.dispatch("client_disconnected", |addon| {
            addon.client_disconnected(client)
        });
    }

    /// Notifies every addon that the upstream of `ctx` disconnected.
    pub fn server_disconnected(&self, ctx: &ConnContext) {
        self.dispatch("server_disconnected", |addon| {
            addon.server_disconnected(ctx)
        });
    }

    fn dispatch(&self, event: &'static str, call: impl Fn(&dyn Addon)) {
        for addon in &self.addons {
            let result = panic::catch_unwind(AssertUnwindSafe(|| call(addon.as_ref())));
            if let Err(payload) = result {
                tracing::warn!(
                    addon = addon.name(),
                    event,
                    "Addon panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Addon that logs every lifecycle event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAddon;

impl Addon for LogAddon {
    fn name(&self) -> &str {
        "log"
    }

    fn server_connected(&self, ctx: &ConnContext) {
        let address = ctx
            .server_conn()
            .and_then(|server| server.address())
            .unwrap_or_default();
        tracing::info!(
            client = %ctx.client_conn().id(),
            peer = %ctx.client_conn().peer_addr(),
            %address,
            "Server connected"
        );
    }

    fn client_disconnected(&self, client: &ClientConn) {
        tracing::info!(client = %client.id(), peer = %client.peer_addr(), "Client disconnected");
    }

    fn server_disconnected(&self, ctx: &ConnContext) {
        let address = ctx
            .server_conn()
            .and_then(|server| server.address())
            .unwrap_or_default();
        tracing::info!(client = %ctx.client_conn().id(), %address, "Server disconnected");
    }
}
