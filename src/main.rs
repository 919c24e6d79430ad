#[macro_use]
extern crate log;
extern crate ctrlc;
extern crate simplelog;
use simplelog::{
    ColorChoice, CombinedLogger, Config, ConfigBuilder, LevelFilter, SharedLogger, TermLogger,
    TerminalMode, WriteLogger,
};

use crate::config::Settings;
use crate::database::{MemoryStore, PgStore, Store};
use crate::notify::Notifier;
use crate::pipeline::{Pipeline, PipelineTask};
use std::env;
use std::fs::OpenOptions;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

mod accumulator;
mod alerts;
mod asyncfile;
mod config;
mod database;
mod diagnosis;
mod frame;
mod notify;
mod pipeline;
mod schema;
mod serial;
mod thresholds;
mod topology;
mod webserver;

fn log_config() -> Config {
    let mut builder = ConfigBuilder::new();
    //keep UTC when the local offset cannot be determined
    let _ = builder.set_time_offset_to_local();
    //%F, %H:%M:%S%.3f
    builder.set_time_format_custom(time::macros::format_description!(
        "[year]-[month]-[day], [hour]:[minute]:[second].[subsecond digits:3]"
    ));
    builder.build()
}

fn logging_init(config_path: &str) {
    let conf = log_config();

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        LevelFilter::Debug,
        conf.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];

    let mut logfile_error: Option<String> = None;
    if let Some(ref log_path) = config::log_location(config_path) {
        let logfile = OpenOptions::new().create(true).append(true).open(log_path);
        match logfile {
            Ok(logfile) => {
                loggers.push(WriteLogger::new(LevelFilter::Info, conf, logfile));
            }
            Err(e) => {
                logfile_error = Some(format!(
                    "Error creating/opening log file: {:?}: {:?}",
                    log_path, e
                ));
            }
        }
    };

    CombinedLogger::init(loggers).expect("Cannot initialize logging subsystem");
    if let Some(e) = logfile_error {
        error!("{}", e);
        warn!("Will do console logging only...");
    }
}

#[tokio::main]
async fn main() {
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| config::DEFAULT_CONFIG_FILE.to_string());
    logging_init(&config_path);
    info!("Welcome to pvwatch (photovoltaic monitoring rust-daemon)");

    let settings = match Settings::load(&config_path) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Cannot load config file {:?}: {}", config_path, e);
            warn!("Using built-in defaults...");
            Settings::default()
        }
    };

    //Ctrl-C / SIGTERM support
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl-C handler");

    //common thread stuff
    let mut threads = vec![];
    let mut tasks = vec![];
    let cancel_flag = Arc::new(AtomicBool::new(false));
    let notifier = Notifier::default();
    let (tx, rx): (Sender<PipelineTask>, Receiver<PipelineTask>) = mpsc::channel(); //thread comm channel

    let store: Box<dyn Store> = match &settings.postgres {
        Some(pg) => match PgStore::new("postgres", pg) {
            Ok(store) => Box::new(store),
            Err(e) => {
                error!("postgres: cannot prepare TLS connector: {}", e);
                warn!("Keeping data in memory only...");
                Box::new(MemoryStore::new())
            }
        },
        None => {
            warn!("No complete [postgres] section, keeping data in memory only...");
            Box::new(MemoryStore::new())
        }
    };

    let transport = Arc::new(serial::Transport::new(
        "serial",
        settings.serial.device.clone(),
        settings.serial.baud,
        settings.serial.command_timeout,
        settings.serial.reconnect_delay,
        tx.clone(),
        notifier.clone(),
    ));
    let mut webserver = webserver::WebServer {
        name: "webserver".to_string(),
        address: settings.webserver.address.clone(),
        port: settings.webserver.port,
        transmitter: tx,
        transport: transport.clone(),
        notifier: notifier.clone(),
    };

    //creating pipeline thread
    let mut pipeline = Pipeline::new("pipeline", &config_path, settings, store, notifier, rx);
    let worker_cancel_flag = cancel_flag.clone();
    let thread_builder = thread::Builder::new().name("pipeline".into()); //thread name
    let thread_handler = thread_builder
        .spawn(move || {
            pipeline.worker(worker_cancel_flag);
        })
        .unwrap();
    threads.push(thread_handler);

    //serial task
    let worker_cancel_flag = cancel_flag.clone();
    tasks.push(tokio::task::spawn(async move {
        transport.worker(worker_cancel_flag).await
    }));

    //webserver task
    let worker_cancel_flag = cancel_flag.clone();
    tasks.push(tokio::task::spawn(async move {
        webserver.worker(worker_cancel_flag).await
    }));

    debug!("Entering main loop...");
    loop {
        if !running.load(Ordering::SeqCst) {
            info!("Ctrl-C or SIGTERM signal detected, exiting...");
            break;
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    info!("Stopping all threads...");
    //inform all threads about termination
    cancel_flag.store(true, Ordering::SeqCst);
    //wait for termination
    for result in futures::future::join_all(tasks).await {
        match result {
            Ok(Err(e)) => error!("task finished with error: {}", e),
            Err(e) => error!("task panicked: {}", e),
            Ok(Ok(())) => (),
        }
    }
    for t in threads {
        // Wait for the thread to finish. Returns a result.
        let _ = t.join();
    }
    info!("Done, exiting");
}
