use clap::{App, Arg};
use keel::logging;
use riptide::prelude::*;
use std::cell::Cell;
use std::rc::Rc;

fn main() {
    let matches = App::new("mqtt_pub")
        .about("Connects to a broker, publishes one message at QoS 1, disconnects")
        .arg(
            Arg::with_name("broker")
                .long("broker")
                .takes_value(true)
                .default_value("mqtt://127.0.0.1:1883"),
        )
        .arg(Arg::with_name("topic").long("topic").takes_value(true).required(true))
        .arg(Arg::with_name("message").long("message").takes_value(true).required(true))
        .get_matches();

    let broker = matches.value_of("broker").unwrap().to_owned();
    let topic = matches.value_of("topic").unwrap().to_owned();
    let message = matches.value_of("message").unwrap().to_owned();

    let log = logging::terminal(logging::Level::Debug);
    let mut mgr = Manager::new(ManagerOpts {
        log: Some(log.clone()),
        ..ManagerOpts::default()
    })
    .expect("manager init failed");

    let done = Rc::new(Cell::new(false));

    let flag = done.clone();
    let event_log = log.clone();
    mgr.set_default_handler(move |conn: &mut Connection, event: Event<'_>| match event {
        Event::MqttOpen(code) => {
            if code != 0 {
                logging::error!(event_log, "broker refused connection"; "code" => code);
                conn.close();
                return;
            }

            match conn.mqtt_pub(&topic, message.as_bytes(), 1, false) {
                Ok(id) => logging::info!(event_log, "published"; "topic" => &topic, "packet_id" => id),
                Err(_) => conn.close(),
            }
        }
        Event::MqttCmd(msg) if msg.cmd == riptide::mqtt::MQTT_CMD_PUBACK => {
            logging::info!(event_log, "puback received"; "packet_id" => msg.id);
            let _ = conn.mqtt_disconnect();
            conn.drain();
        }
        Event::Close => flag.set(true),
        _ => (),
    });

    let opts = MqttOpts {
        client_id: "riptide-mqtt-pub".to_owned(),
        ..MqttOpts::default()
    };
    mgr.mqtt_connect(&broker, opts, None).expect("connect failed");

    while !done.get() {
        mgr.poll(100).expect("poll failed");
    }
}
