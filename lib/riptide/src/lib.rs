//! `riptide` is an embedded, event-driven networking runtime: one
//! cooperative loop drives any number of listeners and connections, and a
//! single application handler receives typed events for HTTP/1.1,
//! WebSocket and MQTT 3.1.1 traffic parsed from per-connection byte
//! buffers.
//!
//! The [`mgr::Manager`] owns the connection table and the readiness
//! poller; [`mgr::Manager::poll`] is the only suspension point. Everything
//! runs on the loop thread except [`wake::WakeupSender`], which may inject
//! WAKEUP events from anywhere.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod buffer;
pub mod conn;
pub mod event;
pub mod fsdir;
pub mod http;
pub mod mgr;
pub mod mqtt;
pub mod sntp;
pub mod sock;
pub mod timer;
pub mod tls;
pub mod url;
pub mod wake;
pub mod ws;

pub mod prelude {
    pub use crate::buffer::Buffer;
    pub use crate::conn::Connection;
    pub use crate::event::{Event, EventHandler};
    pub use crate::fsdir::{FileProvider, StdFs};
    pub use crate::http::{HttpMessage, ServeOpts};
    pub use crate::mgr::{Manager, ManagerOpts};
    pub use crate::mqtt::{MqttMessage, MqttOpts};
    pub use crate::timer::{
        TIMER_AUTODELETE, TIMER_ONCE, TIMER_REPEAT, TIMER_RUN_NOW,
    };
    pub use crate::tls::{TlsHooks, TlsOpts};
    pub use crate::wake::WakeupSender;
    pub use crate::ws::{WsFrame, WS_OP_BINARY, WS_OP_CLOSE, WS_OP_PING, WS_OP_PONG, WS_OP_TEXT};
}
