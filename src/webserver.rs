use crate::config::DiagnosisSettings;
use crate::database::{Granularity, HistoryPoint};
use crate::diagnosis::Alert;
use crate::frame::parse_timestamp;
use crate::notify::{Event, Notifier};
use crate::pipeline::PipelineTask;
use crate::serial::{Command, CommandResult, Transport};
use chrono::{Duration as ChronoDuration, Local, NaiveDate, NaiveDateTime};
use rocket::http::Status;
use rocket::response::stream::{Event as SseEvent, EventStream};
use rocket::serde::json::Json;
use rocket::tokio::select;
use rocket::{delete, get, post, routes, Build, Rocket, Shutdown, State};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;

// Just a generic Result type to ease error handling for us. Errors in multithreaded
// async contexts needs some extra restrictions
type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

type PipelineSender = Mutex<Sender<PipelineTask>>;
type Failure = (Status, Json<CommandResult>);

const DEFAULT_ALERT_LIMIT: usize = 100;

fn failure(status: Status, message: &str) -> Failure {
    (status, Json(CommandResult::failed(message)))
}

/// Hands a task to the pipeline thread and waits for its answer
async fn ask<T>(
    pipeline: &PipelineSender,
    task: impl FnOnce(oneshot::Sender<T>) -> PipelineTask,
) -> std::result::Result<T, Failure> {
    let (reply, answer) = oneshot::channel();
    {
        let trans = pipeline
            .lock()
            .map_err(|_| failure(Status::InternalServerError, "pipeline lock poisoned"))?;
        trans
            .send(task(reply))
            .map_err(|_| failure(Status::ServiceUnavailable, "pipeline is not running"))?;
    }
    answer
        .await
        .map_err(|_| failure(Status::ServiceUnavailable, "pipeline dropped the request"))
}

fn parse_instant(text: &str) -> Option<NaiveDateTime> {
    parse_timestamp(text).or_else(|| {
        NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
    })
}

#[derive(Deserialize)]
pub struct SimulateRequest {
    pub line: String,
}

#[post("/simulate", data = "<request>")]
pub async fn simulate(
    request: Json<SimulateRequest>,
    pipeline: &State<PipelineSender>,
) -> std::result::Result<Json<Event>, Failure> {
    let line = request.into_inner().line;
    match ask(pipeline, |reply| PipelineTask::Inject { line, reply }).await? {
        Some(event) => Ok(Json(event)),
        None => Err(failure(Status::BadRequest, "line carries no data")),
    }
}

#[get("/alerts?<limit>&<active>")]
pub async fn alerts(
    limit: Option<usize>,
    active: Option<bool>,
    pipeline: &State<PipelineSender>,
) -> std::result::Result<Json<Vec<Alert>>, Failure> {
    let limit = limit.unwrap_or(DEFAULT_ALERT_LIMIT);
    let active_only = active.unwrap_or(false);
    ask(pipeline, |reply| PipelineTask::ListAlerts {
        limit,
        active_only,
        reply,
    })
    .await?
    .map(Json)
    .map_err(|e| failure(Status::InternalServerError, &e))
}

#[post("/alerts/<id>/acknowledge")]
pub async fn acknowledge(
    id: i64,
    pipeline: &State<PipelineSender>,
) -> std::result::Result<Json<CommandResult>, Failure> {
    ask(pipeline, |reply| PipelineTask::Acknowledge { id, reply })
        .await
        .map(Json)
}

#[delete("/alerts/<id>")]
pub async fn delete_alert(
    id: i64,
    pipeline: &State<PipelineSender>,
) -> std::result::Result<Json<CommandResult>, Failure> {
    ask(pipeline, |reply| PipelineTask::Delete { id, reply })
        .await
        .map(Json)
}

#[get("/history/range?<start>&<end>&<granularity>")]
pub async fn history(
    start: Option<String>,
    end: Option<String>,
    granularity: Option<String>,
    pipeline: &State<PipelineSender>,
) -> std::result::Result<Json<Vec<HistoryPoint>>, Failure> {
    let end = match end {
        Some(text) => parse_instant(&text)
            .ok_or_else(|| failure(Status::BadRequest, &format!("invalid end: {:?}", text)))?,
        None => Local::now().naive_local(),
    };
    let start = match start {
        Some(text) => parse_instant(&text)
            .ok_or_else(|| failure(Status::BadRequest, &format!("invalid start: {:?}", text)))?,
        None => end - ChronoDuration::hours(24),
    };
    let granularity = granularity
        .as_deref()
        .map(Granularity::from_name)
        .unwrap_or(Granularity::Hour);

    ask(pipeline, |reply| PipelineTask::History {
        start,
        end,
        granularity,
        reply,
    })
    .await?
    .map(Json)
    .map_err(|e| failure(Status::InternalServerError, &e))
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Deserialize)]
pub struct DiagnosisRequest {
    pub enabled: bool,
    #[serde(default = "enabled_by_default")]
    pub notifications_enabled: bool,
}

#[post("/diagnosis/settings", data = "<request>")]
pub async fn diagnosis_settings(
    request: Json<DiagnosisRequest>,
    pipeline: &State<PipelineSender>,
) -> std::result::Result<Json<CommandResult>, Failure> {
    let settings = DiagnosisSettings {
        enabled: request.enabled,
        notifications: request.notifications_enabled,
    };
    ask(pipeline, |reply| PipelineTask::SetDiagnosis { settings, reply })
        .await
        .map(Json)
}

#[post("/config/reload")]
pub async fn reload(
    pipeline: &State<PipelineSender>,
) -> std::result::Result<Json<CommandResult>, Failure> {
    ask(pipeline, |reply| PipelineTask::Reload { reply })
        .await
        .map(Json)
}

#[get("/events")]
pub fn events(notifier: &State<Notifier>, mut end: Shutdown) -> EventStream![] {
    let mut rx = notifier.subscribe();
    EventStream! {
        loop {
            let event = select! {
                msg = rx.recv() => match msg {
                    Ok(event) => event,
                    Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(n)) => {
                        warn!("webserver: event subscriber lagged, {} event(s) skipped", n);
                        continue;
                    }
                },
                _ = &mut end => break,
            };
            yield SseEvent::json(&event).event(event.name());
        }
    }
}

#[post("/start")]
pub async fn cmd_start(transport: &State<Arc<Transport>>) -> Json<CommandResult> {
    Json(transport.command(Command::Start).await)
}

#[post("/stop")]
pub async fn cmd_stop(transport: &State<Arc<Transport>>) -> Json<CommandResult> {
    Json(transport.command(Command::Stop).await)
}

#[post("/config")]
pub async fn cmd_config(
    transport: &State<Arc<Transport>>,
    pipeline: &State<PipelineSender>,
) -> std::result::Result<Json<CommandResult>, Failure> {
    let lines = ask(pipeline, |reply| PipelineTask::ConfigLines { reply }).await?;
    Ok(Json(transport.push_config(&lines).await))
}

pub struct WebServer {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub transmitter: Sender<PipelineTask>,
    pub transport: Arc<Transport>,
    pub notifier: Notifier,
}

impl WebServer {
    pub fn build(&self, figment: rocket::figment::Figment) -> Rocket<Build> {
        rocket::custom(figment)
            .mount(
                "/api",
                routes![
                    simulate,
                    alerts,
                    acknowledge,
                    delete_alert,
                    history,
                    diagnosis_settings,
                    reload,
                    events
                ],
            )
            .mount("/cmd", routes![cmd_start, cmd_stop, cmd_config])
            //put a transmitter into a mutex and share to handlers
            .manage(Mutex::new(self.transmitter.clone()))
            .manage(self.transport.clone())
            .manage(self.notifier.clone())
    }

    pub async fn worker(&mut self, worker_cancel_flag: Arc<AtomicBool>) -> Result<()> {
        info!("{}: Starting task", self.name);
        //signals are handled by main, shutdown comes through the cancel flag
        let figment = rocket::Config::figment()
            .merge(("address", self.address.clone()))
            .merge(("port", self.port))
            .merge(("log_level", "critical"))
            .merge(("shutdown.ctrlc", false))
            .merge(("shutdown.signals", Vec::<String>::new()));

        let rocket = self
            .build(figment)
            .ignite()
            .await
            .map_err(|e| format!("cannot start webserver: {}", e))?;
        info!(
            "{}: listening on {}:{}",
            self.name, self.address, self.port
        );

        let shutdown = rocket.shutdown();
        tokio::spawn(async move {
            while !worker_cancel_flag.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            debug!("Got terminate signal from main");
            shutdown.notify();
        });

        rocket
            .launch()
            .await
            .map_err(|e| format!("webserver failed: {}", e))?;

        info!("{}: Stopping task", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::database::MemoryStore;
    use crate::pipeline::Pipeline;
    use ini::Ini;
    use rocket::local::blocking::Client;
    use serde_json::{json, Value};
    use std::sync::mpsc;
    use std::thread;

    const CONFIG: &str = "[schema]\nVD3 = V\n[categories]\nVD3 = battery\n";

    fn with_client(test: impl FnOnce(&Client)) {
        let (tx, rx) = mpsc::channel();
        let notifier = Notifier::new(16);
        let settings = Settings::from_ini(&Ini::load_from_str(CONFIG).unwrap());
        let mut pipeline = Pipeline::new(
            "pipeline",
            "/nonexistent/pvwatch.conf",
            settings,
            Box::new(MemoryStore::new()),
            notifier.clone(),
            rx,
        );
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = cancel.clone();
        let handle = thread::spawn(move || pipeline.worker(flag));

        let transport = Arc::new(Transport::new(
            "serial",
            None,
            9600,
            Duration::from_millis(100),
            Duration::from_millis(10),
            tx.clone(),
            notifier.clone(),
        ));
        let server = WebServer {
            name: "webserver".to_string(),
            address: "127.0.0.1".to_string(),
            port: 0,
            transmitter: tx,
            transport,
            notifier,
        };
        let client = Client::tracked(server.build(rocket::Config::figment())).unwrap();
        test(&client);

        cancel.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }

    #[test]
    fn simulate_then_list_alerts() {
        with_client(|client| {
            let response = client
                .post("/api/simulate")
                .json(&json!({"line": "2025-06-01 12:00:00,30"}))
                .dispatch();
            assert_eq!(response.status(), Status::Ok);
            let body: Value = response.into_json().unwrap();
            assert_eq!(body["type"], "measurement");
            assert_eq!(body["data"]["VD3"]["V"], 30.0);

            let response = client.get("/api/alerts?active=true").dispatch();
            let alerts: Value = response.into_json().unwrap();
            assert_eq!(alerts[0]["title"], "Low Battery Voltage");
            assert_eq!(alerts[0]["severity"], "WARNING");

            let id = alerts[0]["id"].as_i64().unwrap();
            let uri = format!("/api/alerts/{}", id);
            let response = client.delete(uri.as_str()).dispatch();
            let result: Value = response.into_json().unwrap();
            assert_eq!(result["success"], true);
        });
    }

    #[test]
    fn simulate_without_data_is_rejected() {
        with_client(|client| {
            let response = client
                .post("/api/simulate")
                .json(&json!({"line": "WAITING"}))
                .dispatch();
            assert_eq!(response.status(), Status::BadRequest);
            let body: Value = response.into_json().unwrap();
            assert_eq!(body["success"], false);
        });
    }

    #[test]
    fn history_rejects_bad_dates() {
        with_client(|client| {
            let response = client.get("/api/history/range?start=yesterday").dispatch();
            assert_eq!(response.status(), Status::BadRequest);

            let response = client
                .get("/api/history/range?start=2025-06-01&end=2025-06-02&granularity=day")
                .dispatch();
            assert_eq!(response.status(), Status::Ok);
        });
    }

    #[test]
    fn commands_fail_without_serial_port() {
        with_client(|client| {
            let response = client.post("/cmd/start").dispatch();
            let result: Value = response.into_json().unwrap();
            assert_eq!(result["success"], false);

            let response = client.post("/cmd/config").dispatch();
            let result: Value = response.into_json().unwrap();
            assert_eq!(result["success"], false);
        });
    }

    #[test]
    fn diagnosis_settings_toggle() {
        with_client(|client| {
            let response = client
                .post("/api/diagnosis/settings")
                .json(&json!({"enabled": false}))
                .dispatch();
            let result: Value = response.into_json().unwrap();
            assert_eq!(result["success"], true);
        });
    }
}
