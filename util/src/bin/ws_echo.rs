use clap::{App, Arg};
use keel::logging;
use riptide::prelude::*;

fn main() {
    let matches = App::new("ws_echo")
        .about("WebSocket echo server")
        .arg(
            Arg::with_name("listen")
                .long("listen")
                .takes_value(true)
                .default_value("ws://127.0.0.1:8001"),
        )
        .get_matches();

    let listen = matches.value_of("listen").unwrap().to_owned();
    let log = logging::terminal(logging::Level::Debug);

    let opts = ManagerOpts {
        log: Some(log.clone()),
        ..ManagerOpts::default()
    };
    let mut mgr = Manager::new(opts).expect("manager init failed");

    let event_log = log.clone();
    mgr.set_default_handler(move |conn: &mut Connection, event: Event<'_>| match event {
        Event::HttpMsg(msg) => {
            if conn.ws_upgrade(msg, &[]).is_err() {
                logging::warn!(event_log, "upgrade refused"; "conn" => conn.id());
            }
        }
        Event::WsOpen(_) => {
            logging::info!(event_log, "websocket session open"; "conn" => conn.id());
        }
        Event::WsMsg(frame) => {
            let payload = frame.payload().to_vec();
            let opcode = frame.opcode();
            if conn.ws_send(&payload, opcode).is_err() {
                conn.close();
            }
        }
        _ => (),
    });

    mgr.listen(&listen, None).expect("listen failed");
    logging::info!(log, "serving"; "url" => listen);

    loop {
        mgr.poll(100).expect("poll failed");
    }
}
