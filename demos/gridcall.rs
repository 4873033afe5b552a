// Copyright 2020 Joyent, Inc.

use std::process;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use serde_json::json;
use slog::{o, Drain, Level, LevelFilter, Logger};

use grid_rpc::config::Settings;
use grid_rpc::{Endpoint, RpcClient, StaticResolver, Value};

static APP: &str = "gridcall";

pub fn parse_opts<'a>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Command-line tool for making one grid-rpc method call")
        .version(crate_version!())
        .arg(
            Arg::with_name("url")
                .help("Endpoint URL, e.g. dips://host:9135/Framework/Demo")
                .long("url")
                .short("u")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("method")
                .help("Name of remote RPC method call")
                .long("method")
                .short("m")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("args")
                .help("JSON array of positional arguments (Default: [])")
                .long("args")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("kwargs")
                .help("JSON object of keyword arguments")
                .long("kwargs")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("timeout")
                .help("Call timeout in seconds")
                .long("timeout")
                .short("t")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("config")
                .help("Settings file holding the security section")
                .long("config")
                .short("c")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .long("verbose")
                .short("v")
                .takes_value(false),
        )
        .get_matches()
}

fn parse_json(
    what: &str,
    text: Option<&str>,
    default: serde_json::Value,
) -> Value {
    match text {
        None => Value::from_json(default),
        Some(text) => match serde_json::from_str(text) {
            Ok(json) => Value::from_json(json),
            Err(e) => {
                eprintln!("Failed to parse {} as JSON: {}", what, e);
                process::exit(1)
            }
        },
    }
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());

    let level = if matches.is_present("verbose") {
        Level::Debug
    } else {
        Level::Warning
    };
    let plain = slog_term::PlainSyncDecorator::new(std::io::stderr());
    let log = Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            level,
        ))
        .fuse(),
        o!(),
    );

    let endpoint: Endpoint = value_t!(matches, "url", Endpoint)
        .unwrap_or_else(|e| e.exit());
    let method = matches.value_of("method").unwrap_or_default().to_string();
    let args = parse_json("args", matches.value_of("args"), json!([]));
    let args = match args {
        Value::List(args) => args,
        other => vec![other],
    };
    let kwargs = parse_json("kwargs", matches.value_of("kwargs"), json!({}));
    let kwargs = match kwargs {
        Value::Map(kwargs) => kwargs,
        _ => {
            eprintln!("kwargs must be a JSON object");
            process::exit(1)
        }
    };
    let timeout = value_t!(matches, "timeout", u64)
        .ok()
        .map(Duration::from_secs);

    let settings =
        Settings::load(matches.value_of("config")).unwrap_or_else(|e| {
            eprintln!("{}", e);
            process::exit(1)
        });
    let registry = settings.client_registry().unwrap_or_else(|e| {
        eprintln!("{}", e);
        process::exit(1)
    });

    let service = endpoint.path.clone();
    let resolver = StaticResolver::new().with_service(&service, vec![endpoint]);
    let client = RpcClient::new(
        settings.client.clone(),
        Arc::new(resolver),
        registry,
        Some(&log),
    );

    match client.call(&service, &method, args, kwargs, timeout).await {
        Ok(value) => println!("{}", value.to_json()),
        Err(e) => {
            eprintln!("Error ({}): {}", e.kind(), e);
            process::exit(1)
        }
    }
}
