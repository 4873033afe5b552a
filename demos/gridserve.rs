// Copyright 2020 Joyent, Inc.

use std::collections::BTreeMap;
use std::process;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::prelude::*;
use clap::{crate_version, App, Arg, ArgMatches};
use slog::{debug, error, info, o, Drain, Logger};

use grid_rpc::config::Settings;
use grid_rpc::{
    ArgType, CallContext, Dispatcher, HandlerError, HandlerResult,
    MethodRegistration, RpcServer, Value,
};

static APP: &str = "gridserve";
static SERVICE: &str = "Framework/Demo";

pub fn parse_opts<'a>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Demonstration grid-rpc service offering echo, date and sleep")
        .version(crate_version!())
        .arg(
            Arg::with_name("config")
                .help("Settings file (see grid_rpc::config)")
                .long("config")
                .short("c")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("bind")
                .help("Address to listen on (Default: 0.0.0.0:9135)")
                .long("bind")
                .short("b")
                .takes_value(true),
        )
        .get_matches()
}

async fn echo_handler(args: Vec<Value>, ctx: CallContext) -> HandlerResult {
    debug!(ctx.log, "handling echo request");
    Ok(Value::List(args))
}

async fn date_handler(ctx: CallContext) -> HandlerResult {
    debug!(ctx.log, "handling date request");
    let now = Utc::now();
    let mut date = BTreeMap::new();
    date.insert(String::from("timestamp"), Value::Int(now.timestamp_millis()));
    date.insert(String::from("iso8601"), Value::Str(now.to_rfc3339()));
    Ok(Value::Map(date))
}

async fn sleep_handler(args: Vec<Value>, ctx: CallContext) -> HandlerResult {
    let ms = args
        .get(0)
        .and_then(Value::as_i64)
        .ok_or_else(|| HandlerError::new("expected a delay in milliseconds"))?;
    if ms < 0 {
        return Err(HandlerError::with_class("negative delay", "ValueError"));
    }
    debug!(ctx.log, "sleeping"; "ms" => ms);
    tokio::time::sleep(Duration::from_millis(ms as u64)).await;
    Ok(Value::Int(ms))
}

async fn whoami_handler(ctx: CallContext) -> HandlerResult {
    Ok(Value::Str(ctx.identity.to_string()))
}

fn dispatcher() -> Result<Dispatcher, grid_rpc::RpcError> {
    Dispatcher::builder(SERVICE)
        .register(
            MethodRegistration::new("echo", |args, _kwargs, ctx| {
                echo_handler(args, ctx)
            })
            .access(vec!["anyone"]),
        )
        .register(
            MethodRegistration::new("date", |_args, _kwargs, ctx| {
                date_handler(ctx)
            })
            .access(vec!["anyone"])
            .signature(vec![]),
        )
        .register(
            MethodRegistration::new("sleep", |args, _kwargs, ctx| {
                sleep_handler(args, ctx)
            })
            .access(vec!["authenticated"])
            .signature(vec![ArgType::Int]),
        )
        .register(
            MethodRegistration::new("whoami", |_args, _kwargs, ctx| {
                whoami_handler(ctx)
            })
            .access(vec!["anyone"]),
        )
        .build()
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());

    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    let mut settings =
        Settings::load(matches.value_of("config")).unwrap_or_else(|e| {
            eprintln!("{}", e);
            process::exit(1)
        });
    if let Some(bind) = matches.value_of("bind") {
        settings.server.bind = bind.to_string();
    }

    let protocol = settings.server_protocol().unwrap_or_else(|e| {
        error!(root_log, "unable to load security settings"; "err" => %e);
        process::exit(1)
    });

    let dispatcher = dispatcher().unwrap_or_else(|e| {
        eprintln!("{}", e);
        process::exit(1)
    });
    info!(root_log, "serving"; "service" => SERVICE,
          "methods" => dispatcher.methods().join(","));

    let server = RpcServer::new(
        settings.server.clone(),
        protocol,
        Arc::new(dispatcher),
        Some(&root_log),
    );
    let listener = server.bind().await.unwrap_or_else(|e| {
        eprintln!("{}", e);
        process::exit(1)
    });
    if let Err(e) = server.serve(listener).await {
        error!(root_log, "server stopped"; "err" => %e);
    }
}
