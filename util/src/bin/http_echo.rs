use clap::{App, Arg};
use keel::logging;
use riptide::fsdir::StdFs;
use riptide::http::ServeOpts;
use riptide::prelude::*;

fn main() {
    let matches = App::new("http_echo")
        .about("HTTP demo server: echoes request details, or serves a directory")
        .arg(
            Arg::with_name("listen")
                .long("listen")
                .takes_value(true)
                .default_value("http://127.0.0.1:8000"),
        )
        .arg(Arg::with_name("dir").long("dir").takes_value(true))
        .get_matches();

    let listen = matches.value_of("listen").unwrap().to_owned();
    let root = matches.value_of("dir").map(str::to_owned);

    let log = logging::terminal(logging::Level::Debug);

    let opts = ManagerOpts {
        log: Some(log.clone()),
        ..ManagerOpts::default()
    };
    let mut mgr = Manager::new(opts).expect("manager init failed");

    mgr.set_default_handler(move |conn: &mut Connection, event: Event<'_>| {
        if let Event::HttpMsg(msg) = event {
            let result = match &root {
                Some(root) => {
                    let serve = ServeOpts {
                        root,
                        ..ServeOpts::default()
                    };
                    conn.serve_dir(msg, &mut StdFs::new(), &serve)
                }
                None => {
                    let body = format!(
                        "method={} uri={} query={} body_len={}\n",
                        msg.method(),
                        msg.uri(),
                        msg.query(),
                        msg.body().len()
                    );
                    conn.reply(200, &[], body.as_bytes())
                }
            };

            if result.is_err() {
                conn.close();
            }
        }
    });

    mgr.listen(&listen, None).expect("listen failed");
    logging::info!(log, "serving"; "url" => listen);

    loop {
        mgr.poll(100).expect("poll failed");
    }
}
