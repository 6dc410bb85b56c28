use crate::conn::Connection;
use crate::http::HttpMessage;
use crate::mqtt::MqttMessage;
use crate::ws::WsFrame;
use keel::logging;
use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

/// Typed event payloads delivered to connection handlers. Borrowed
/// payloads (message and frame views, wakeup bytes) are valid only for the
/// duration of the callback.
pub enum Event<'a> {
    Error(&'a str),
    Open,
    Poll,
    Resolve,
    Connect,
    Accept,
    TlsHs,
    Read(usize),
    Write(usize),
    Close,
    HttpHdrs(&'a HttpMessage<'a>),
    HttpMsg(&'a HttpMessage<'a>),
    WsOpen(&'a HttpMessage<'a>),
    WsMsg(&'a WsFrame<'a>),
    WsCtl(&'a WsFrame<'a>),
    MqttCmd(&'a MqttMessage<'a>),
    MqttMsg(&'a MqttMessage<'a>),
    MqttOpen(u8),
    SntpTime(u64),
    Wakeup(&'a [u8]),
    User(&'a [u8]),
}

impl<'a> Event<'a> {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Error(_) => "ERROR",
            Event::Open => "OPEN",
            Event::Poll => "POLL",
            Event::Resolve => "RESOLVE",
            Event::Connect => "CONNECT",
            Event::Accept => "ACCEPT",
            Event::TlsHs => "TLS_HS",
            Event::Read(_) => "READ",
            Event::Write(_) => "WRITE",
            Event::Close => "CLOSE",
            Event::HttpHdrs(_) => "HTTP_HDRS",
            Event::HttpMsg(_) => "HTTP_MSG",
            Event::WsOpen(_) => "WS_OPEN",
            Event::WsMsg(_) => "WS_MSG",
            Event::WsCtl(_) => "WS_CTL",
            Event::MqttCmd(_) => "MQTT_CMD",
            Event::MqttMsg(_) => "MQTT_MSG",
            Event::MqttOpen(_) => "MQTT_OPEN",
            Event::SntpTime(_) => "SNTP_TIME",
            Event::Wakeup(_) => "WAKEUP",
            Event::User(_) => "USER",
        }
    }
}

/// Application-side event sink. The per-connection handler takes
/// precedence over the manager default; with neither present events are
/// dropped.
pub trait EventHandler {
    fn on_event(&mut self, conn: &mut Connection, event: Event<'_>);
}

impl<F> EventHandler for F
where
    F: FnMut(&mut Connection, Event<'_>),
{
    #[inline]
    fn on_event(&mut self, conn: &mut Connection, event: Event<'_>) {
        self(conn, event)
    }
}

/// Shared handler slot. Accepted connections inherit their listener's
/// handler by cloning the slot, so listener and children observe the same
/// handler state.
pub(crate) type Handler = Rc<RefCell<dyn EventHandler>>;

#[inline]
pub(crate) fn handler_slot<H: EventHandler + 'static>(handler: H) -> Handler {
    Rc::new(RefCell::new(handler))
}

/// Invokes the resolved handler with the event. Handler panics are trapped
/// and logged; the loop carries on.
pub(crate) fn dispatch(
    conn: &mut Connection,
    fallback: Option<&Handler>,
    log: &logging::Logger,
    event: Event<'_>,
) {
    let name = event.name();
    let handler = match conn.handler.clone().or_else(|| fallback.cloned()) {
        Some(handler) => handler,
        None => {
            logging::trace!(log, "event dropped, no handler"; "conn_id" => conn.id(), "event" => name);
            return;
        }
    };

    logging::trace!(log, "dispatching event"; "conn_id" => conn.id(), "event" => name);

    let result = catch_unwind(AssertUnwindSafe(|| {
        handler.borrow_mut().on_event(conn, event)
    }));

    if result.is_err() {
        logging::error!(log, "event handler panicked";
                        "conn_id" => conn.id(),
                        "event" => name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{Connection, Proto};

    fn test_conn() -> Connection {
        Connection::virtual_endpoint(7, Proto::Raw, keel::logging::discard())
    }

    #[test]
    fn test_per_connection_handler_wins() {
        let mut conn = test_conn();
        let fallback = handler_slot(|_conn: &mut Connection, _event: Event<'_>| {
            panic!("fallback must not run");
        });

        let seen = Rc::new(RefCell::new(Vec::new()));
        let inner = seen.clone();
        conn.set_handler(move |_conn: &mut Connection, event: Event<'_>| {
            inner.borrow_mut().push(event.name());
        });

        dispatch(&mut conn, Some(&fallback), &keel::logging::discard(), Event::Open);
        dispatch(&mut conn, Some(&fallback), &keel::logging::discard(), Event::Poll);

        assert_eq!(*seen.borrow(), vec!["OPEN", "POLL"]);
    }

    #[test]
    fn test_fallback_handler_used_when_unset() {
        let mut conn = test_conn();

        let seen = Rc::new(RefCell::new(0));
        let inner = seen.clone();
        let fallback = handler_slot(move |_conn: &mut Connection, _event: Event<'_>| {
            *inner.borrow_mut() += 1;
        });

        dispatch(&mut conn, Some(&fallback), &keel::logging::discard(), Event::Open);
        assert_eq!(*seen.borrow(), 1);
    }

    #[test]
    fn test_no_handler_drops_event() {
        let mut conn = test_conn();
        // Nothing to assert beyond "does not panic".
        dispatch(&mut conn, None, &keel::logging::discard(), Event::Open);
    }

    #[test]
    fn test_handler_panic_is_trapped() {
        let mut conn = test_conn();
        conn.set_handler(|_conn: &mut Connection, _event: Event<'_>| panic!("boom"));

        dispatch(&mut conn, None, &keel::logging::discard(), Event::Open);

        // The loop survives and further dispatches still reach the handler.
        dispatch(&mut conn, None, &keel::logging::discard(), Event::Poll);
    }
}
